//! Run configuration and the explicit execution context.

use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::{CheckpointStore, FingerprintMode},
    schema::RowSchema,
    storage::StorageLocation,
    table::OutputTable,
};

/// Default number of source files read concurrently.
pub const DEFAULT_READ_CONCURRENCY: usize = 8;

fn default_acquire_lock() -> bool {
    true
}

fn default_read_concurrency() -> usize {
    DEFAULT_READ_CONCURRENCY
}

/// Tunables for one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderOptions {
    /// How listed files are matched against the checkpoint.
    #[serde(default)]
    pub fingerprint: FingerprintMode,
    /// Take the checkpoint run lock for the duration of the run.
    #[serde(default = "default_acquire_lock")]
    pub acquire_lock: bool,
    /// Source files read concurrently.
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            fingerprint: FingerprintMode::default(),
            acquire_lock: default_acquire_lock(),
            read_concurrency: default_read_concurrency(),
        }
    }
}

/// Everything one run needs, passed explicitly.
pub struct IngestContext<'a> {
    /// Directory of tab-separated input files.
    pub source: StorageLocation,
    /// Destination table.
    pub table: &'a mut dyn OutputTable,
    /// Processed-file checkpoint.
    pub checkpoint: &'a dyn CheckpointStore,
    /// Schema the input is parsed against.
    pub schema: RowSchema,
    /// Run tunables.
    pub options: LoaderOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_fill_defaults_from_partial_json() {
        let opts: LoaderOptions =
            serde_json::from_str(r#"{ "fingerprint": "path" }"#).expect("deserialize");
        assert_eq!(opts, LoaderOptions {
            fingerprint: FingerprintMode::PathOnly,
            acquire_lock: true,
            read_concurrency: DEFAULT_READ_CONCURRENCY,
        });

        let empty: LoaderOptions = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(empty, LoaderOptions::default());
    }
}
