//! Error types and SNAFU context selectors for the table layer.
//!
//! Sibling modules attach context through the `pub(crate)` selectors; keep
//! new variants here so user-facing messages stay consistent.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{commit_log::CommitError, schema::SchemaError, storage::StorageError};

/// Errors from output table operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// Any error from the commit machinery (conflicts, storage, corrupt commits).
    #[snafu(display("Table log error: {source}"))]
    TableLog {
        /// Underlying commit error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// Opening a location with no commits at all.
    #[snafu(display("Table not found at {location} (no commits)"))]
    TableNotFound {
        /// The location that was opened.
        location: String,
    },

    /// Creating a table where commits already exist.
    #[snafu(display("Table already exists; current log version is {current_version}"))]
    AlreadyExists {
        /// Current log version of the existing table.
        current_version: u64,
    },

    /// The stored schema differs from the expected one.
    #[snafu(display("Table schema does not match (no schema evolution): {source}"))]
    SchemaMismatch {
        /// Underlying schema comparison error.
        source: SchemaError,
    },

    /// A batch handed to append does not have the table's Arrow schema.
    #[snafu(display("Batch schema does not match table schema: {detail}"))]
    BatchSchemaMismatch {
        /// Description of the mismatch.
        detail: String,
    },

    /// The log replays into something that is not a valid table.
    #[snafu(display("Corrupt table log: {msg}"))]
    CorruptTable {
        /// What was wrong.
        msg: String,
    },

    /// Storage error while accessing segment files.
    #[snafu(display("Storage error while accessing table data: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// A segment file with the same name but different content already exists.
    #[snafu(display("Segment file {path} already exists with different content"))]
    SegmentCollision {
        /// Relative path of the colliding segment.
        path: String,
    },

    /// Parquet encoding error while writing a segment.
    #[snafu(display("Parquet write error: {source}"))]
    ParquetWrite {
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Parquet read error while scanning a segment.
    #[snafu(display("Parquet read error in {path}: {source}"))]
    ParquetRead {
        /// Relative path of the segment being read.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow error while decoding or combining batches.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },
}
