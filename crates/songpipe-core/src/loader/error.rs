//! Error types for ingestion runs.

use snafu::prelude::*;

use crate::{
    checkpoint::CheckpointError, parse::ParseError, storage::StorageError, table::TableError,
};

/// What a failed run durably committed before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitProgress {
    /// Files recorded in the checkpoint.
    pub files_committed: u64,
    /// Rows committed to the output table.
    pub rows_committed: u64,
}

/// Errors from [`IncrementalLoader::run`](super::IncrementalLoader::run).
///
/// Use [`LoaderError::progress`] to learn what was committed before the
/// failure. Nothing is retried automatically.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LoaderError {
    /// The source directory could not be listed. Nothing was written.
    #[snafu(display("Source {source_root} is unavailable: {source}"))]
    SourceUnavailable {
        /// Source root as given.
        source_root: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The checkpoint was created for a different source root.
    #[snafu(display(
        "Checkpoint belongs to source {recorded}, refusing to ingest from {requested}"
    ))]
    SourceMismatch {
        /// Source recorded in the checkpoint.
        recorded: String,
        /// Source of this run.
        requested: String,
    },

    /// The checkpoint could not be read or locked. Nothing was written.
    #[snafu(display("Checkpoint is unavailable: {source}"))]
    CheckpointUnavailable {
        /// Underlying checkpoint error.
        source: CheckpointError,
    },

    /// Another run holds the checkpoint lock. Nothing was written.
    #[snafu(display("Another ingestion run is in progress: {source}"))]
    AlreadyRunning {
        /// Underlying lock error.
        source: CheckpointError,
    },

    /// A listed file vanished or became unreadable. Nothing was written.
    #[snafu(display("Failed to read source file {path}: {source}"))]
    ReadFailed {
        /// Relative path of the file.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// A file could not be turned into a batch. Nothing was written.
    #[snafu(display("Failed to parse source file: {source}"))]
    ParseFailed {
        /// Underlying parse error.
        source: ParseError,
    },

    /// The parsing worker did not finish. Nothing was written.
    #[snafu(display("Parse worker failed: {source}"))]
    ParseWorker {
        /// Underlying join error.
        source: tokio::task::JoinError,
    },

    /// The table append failed; the checkpoint was not touched.
    #[snafu(display("Failed to append {rows} row(s) to the output table: {source}"))]
    WriteFailed {
        /// Rows that were being appended.
        rows: u64,
        /// Underlying table error.
        source: TableError,
    },

    /// Rows were committed to the table but the checkpoint was not updated.
    ///
    /// A retry re-ingests the same files (at-least-once).
    #[snafu(display(
        "Committed {rows_committed} row(s) at table version {table_version} but failed to \
         record {pending_files} file(s) in the checkpoint: {source}"
    ))]
    CheckpointFailed {
        /// Rows durably committed to the table.
        rows_committed: u64,
        /// Files whose rows were committed but not recorded.
        pending_files: u64,
        /// Table version holding the rows.
        table_version: u64,
        /// Underlying checkpoint error.
        source: CheckpointError,
    },
}

impl LoaderError {
    /// What this run committed before failing.
    pub fn progress(&self) -> CommitProgress {
        match self {
            LoaderError::CheckpointFailed { rows_committed, .. } => CommitProgress {
                files_committed: 0,
                rows_committed: *rows_committed,
            },
            _ => CommitProgress::default(),
        }
    }

    /// True if the failure left committed rows without a checkpoint entry.
    pub fn left_uncheckpointed_rows(&self) -> bool {
        self.progress().rows_committed > 0
    }
}
