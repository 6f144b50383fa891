//! Append-only song table.
//!
//! A table lives under a single root:
//!
//! ```text
//! <table_root>/
//!   _table_log/CURRENT
//!   _table_log/0000000001.json     # CreateTable { schema, .. }
//!   _table_log/0000000002.json     # AddSegment { .. }
//!   data/part-<hash>.parquet
//! ```
//!
//! Segment files are written first; a segment becomes visible only when the
//! commit that adds it lands. Readers replay commits up to `CURRENT`, so a
//! batch is either wholly visible or not at all. There is no remove action.

pub mod append;
pub mod error;
pub mod scan;

use std::fmt;

use async_trait::async_trait;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    commit_log::{Commit, CommitLog},
    schema::{RowSchema, ensure_schema_exact_match},
    storage::{self, StorageLocation},
};

pub use append::AppendOutcome;
pub use error::TableError;
use error::{
    AlreadyExistsSnafu, CorruptTableSnafu, SchemaMismatchSnafu, StorageSnafu,
    TableLogSnafu, TableNotFoundSnafu,
};

/// Directory holding the table's commit log.
pub const TABLE_LOG_DIR: &str = "_table_log";
/// Directory holding segment files.
pub const DATA_DIR: &str = "data";
/// On-disk table format version.
pub const TABLE_FORMAT_VERSION: u32 = 1;

/// Identifier of a segment, derived from its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub String);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Table-level metadata recorded by the first commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableMeta {
    /// Row schema of every segment.
    pub schema: RowSchema,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Format version.
    pub format_version: u32,
}

/// One Parquet segment file committed to the table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Content-derived identifier.
    pub segment_id: SegmentId,
    /// Path relative to the table root.
    pub path: String,
    /// Number of rows in the segment.
    pub row_count: u64,
    /// Size of the segment file in bytes.
    pub file_size: u64,
}

/// Actions recorded in the table log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TableAction {
    /// Establish the table and its schema.
    CreateTable(TableMeta),
    /// Make a segment file visible.
    AddSegment(SegmentMeta),
}

/// Table state rebuilt by replaying the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableState {
    /// Version the state was replayed up to.
    pub version: u64,
    /// Table metadata.
    pub meta: TableMeta,
    /// Segments in commit order.
    pub segments: Vec<SegmentMeta>,
}

impl TableState {
    fn replay(version: u64, commits: Vec<Commit<TableAction>>) -> Result<Self, TableError> {
        let mut meta: Option<TableMeta> = None;
        let mut segments = Vec::new();

        for commit in commits {
            for action in commit.actions {
                match action {
                    TableAction::CreateTable(m) => {
                        ensure!(
                            meta.is_none(),
                            CorruptTableSnafu {
                                msg: format!("duplicate CreateTable at version {}", commit.version),
                            }
                        );
                        meta = Some(m);
                    }
                    TableAction::AddSegment(seg) => {
                        ensure!(
                            meta.is_some(),
                            CorruptTableSnafu {
                                msg: format!(
                                    "AddSegment before CreateTable at version {}",
                                    commit.version
                                ),
                            }
                        );
                        segments.push(seg);
                    }
                }
            }
        }

        let meta = meta.context(CorruptTableSnafu {
            msg: "log has commits but no CreateTable".to_string(),
        })?;

        Ok(TableState {
            version,
            meta,
            segments,
        })
    }

    /// Total rows across all segments.
    pub fn total_rows(&self) -> u64 {
        self.segments.iter().map(|s| s.row_count).sum()
    }
}

/// Handle to an append-only song table.
#[derive(Debug, Clone)]
pub struct SongTable {
    location: StorageLocation,
    log: CommitLog<TableAction>,
    state: TableState,
}

impl SongTable {
    fn log_for(location: &StorageLocation) -> CommitLog<TableAction> {
        CommitLog::new(location.clone(), TABLE_LOG_DIR)
    }

    /// Create a new table with `schema`.
    ///
    /// Fails with `AlreadyExists` if the location already has commits.
    pub async fn create(location: StorageLocation, schema: RowSchema) -> Result<Self, TableError> {
        let log = Self::log_for(&location);
        let current = log.load_current_version().await.context(TableLogSnafu)?;
        ensure!(
            current == 0,
            AlreadyExistsSnafu {
                current_version: current
            }
        );

        let meta = TableMeta {
            schema,
            created_at: Utc::now(),
            format_version: TABLE_FORMAT_VERSION,
        };
        let version = log
            .commit_with_expected_version(0, vec![TableAction::CreateTable(meta.clone())])
            .await
            .context(TableLogSnafu)?;

        log::info!("created table at {location} (version {version})");

        Ok(SongTable {
            location,
            log,
            state: TableState {
                version,
                meta,
                segments: Vec::new(),
            },
        })
    }

    /// Open an existing table by replaying its log.
    pub async fn open(location: StorageLocation) -> Result<Self, TableError> {
        let log = Self::log_for(&location);
        let (version, commits) = log.load_all().await.context(TableLogSnafu)?;
        ensure!(
            version > 0,
            TableNotFoundSnafu {
                location: location.to_string()
            }
        );

        let state = TableState::replay(version, commits)?;
        Ok(SongTable {
            location,
            log,
            state,
        })
    }

    /// Open an existing table and require its schema to equal `expected`.
    pub async fn open_with_schema(
        location: StorageLocation,
        expected: &RowSchema,
    ) -> Result<Self, TableError> {
        let table = Self::open(location).await?;
        ensure_schema_exact_match(table.schema(), expected).context(SchemaMismatchSnafu)?;
        Ok(table)
    }

    /// Open the table at `location`, creating it with `schema` if absent.
    pub async fn open_or_create(
        location: StorageLocation,
        schema: RowSchema,
    ) -> Result<Self, TableError> {
        match Self::open_with_schema(location.clone(), &schema).await {
            Err(TableError::TableNotFound { .. }) => Self::create(location, schema).await,
            other => other,
        }
    }

    /// Remove the whole table directory. A missing table is not an error.
    pub async fn destroy(location: &StorageLocation) -> Result<(), TableError> {
        storage::remove_root(location).await.context(StorageSnafu)
    }

    /// Re-read the log so this handle sees commits made by other handles.
    pub async fn refresh(&mut self) -> Result<(), TableError> {
        let (version, commits) = self.log.load_all().await.context(TableLogSnafu)?;
        self.state = TableState::replay(version, commits)?;
        Ok(())
    }

    /// Table root.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Current table log version.
    pub fn version(&self) -> u64 {
        self.state.version
    }

    /// Stored row schema.
    pub fn schema(&self) -> &RowSchema {
        &self.state.meta.schema
    }

    /// Committed segments in commit order.
    pub fn segments(&self) -> &[SegmentMeta] {
        &self.state.segments
    }

    /// Total committed rows.
    pub fn total_rows(&self) -> u64 {
        self.state.total_rows()
    }
}

/// Destination the loader appends into.
#[async_trait]
pub trait OutputTable: Send + Sync {
    /// Durably append `batches` as one unit.
    async fn append(&mut self, batches: &[RecordBatch]) -> Result<AppendOutcome, TableError>;

    /// Current committed version.
    fn version(&self) -> u64;
}

#[async_trait]
impl OutputTable for SongTable {
    async fn append(&mut self, batches: &[RecordBatch]) -> Result<AppendOutcome, TableError> {
        self.append_batches(batches).await
    }

    fn version(&self) -> u64 {
        self.state.version
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::schema::{LogicalDataType, LogicalField, describe};
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_then_open_round_trips_schema() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let created = SongTable::create(location.clone(), describe()).await?;
        assert_eq!(created.version(), 1);

        let opened = SongTable::open(location).await?;
        assert_eq!(opened.schema(), &describe());
        assert_eq!(opened.total_rows(), 0);
        assert!(tmp.path().join("_table_log/0000000001.json").exists());
        Ok(())
    }

    #[tokio::test]
    async fn open_missing_table_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let err = SongTable::open(StorageLocation::local(tmp.path().join("nope")))
            .await
            .expect_err("expected TableNotFound");
        assert!(matches!(err, TableError::TableNotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn create_twice_is_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        SongTable::create(location.clone(), describe()).await?;

        let err = SongTable::create(location, describe())
            .await
            .expect_err("expected AlreadyExists");
        assert!(matches!(err, TableError::AlreadyExists { current_version: 1 }));
        Ok(())
    }

    #[tokio::test]
    async fn open_or_create_refuses_schema_evolution() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let other = RowSchema::new(vec![LogicalField {
            name: "only".to_string(),
            data_type: LogicalDataType::Utf8,
            nullable: true,
        }])?;
        SongTable::create(location.clone(), other).await?;

        let err = SongTable::open_or_create(location, describe())
            .await
            .expect_err("expected SchemaMismatch");
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn open_or_create_reuses_existing_table() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let mut first = SongTable::open_or_create(location.clone(), describe()).await?;
        first.append_batches(&[songs_batch(&[song("A", 2000)])]).await?;

        let second = SongTable::open_or_create(location, describe()).await?;
        assert_eq!(second.version(), 2);
        assert_eq!(second.total_rows(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn destroy_removes_everything() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("t"));
        SongTable::create(location.clone(), describe()).await?;

        SongTable::destroy(&location).await?;
        SongTable::destroy(&location).await?;
        assert!(!tmp.path().join("t").exists());
        Ok(())
    }
}
