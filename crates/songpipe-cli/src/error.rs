use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use songpipe_core::{
    checkpoint::CheckpointError, loader::LoaderError, storage::StorageError, table::TableError,
    views::ViewError,
};

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Invalid {flag} '{spec}': {source}"))]
    InvalidLocation {
        flag: &'static str,
        spec: String,
        source: StorageError,
    },

    #[snafu(display("Source directory not found or not accessible: {path}: {source}"))]
    ListSource { path: String, source: StorageError },

    #[snafu(display("Failed to read checkpoint at {path}: {source}"))]
    ReadCheckpoint {
        path: String,
        source: CheckpointError,
    },

    #[snafu(display(
        "Failed to open song table at {table}: {source}. \
         Ensure it was created by songpipe."
    ))]
    OpenTable {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display(
        "Ingestion failed: {source} \
         (committed before failure: {files_committed} file(s), {rows_committed} row(s))"
    ))]
    Ingest {
        files_committed: u64,
        rows_committed: u64,
        #[snafu(source(from(LoaderError, Box::new)))]
        source: Box<LoaderError>,
    },

    #[snafu(display("Failed to remove table at {table}: {source}"))]
    ResetTable {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Failed to remove checkpoint at {path}: {source}"))]
    ResetCheckpoint {
        path: String,
        source: CheckpointError,
    },

    #[snafu(display("{source}"))]
    View { source: ViewError },

    #[snafu(display("DataFusion error: {source}"))]
    DataFusion { source: DataFusionError },

    #[snafu(display("Arrow error: {source}"))]
    Arrow { source: ArrowError },

    #[snafu(display("Failed to write output: {source}"))]
    WriteOutput { source: std::io::Error },
}

impl CliError {
    /// Wrap a loader failure, keeping what it committed visible in the message.
    pub fn ingest(source: LoaderError) -> Self {
        let progress = source.progress();
        CliError::Ingest {
            files_committed: progress.files_committed,
            rows_committed: progress.rows_committed,
            source: Box::new(source),
        }
    }
}
