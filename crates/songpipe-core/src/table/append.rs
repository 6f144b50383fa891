//! Append pipeline for `SongTable`.
//!
//! One call writes one Parquet segment holding every row handed in, then
//! commits a single `AddSegment`. The commit file creation is the only
//! visibility point; a segment file without a commit is never read.

use std::path::Path;

use arrow::{datatypes::SchemaRef, record_batch::RecordBatch};
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use snafu::prelude::*;

use crate::{
    storage::{self, StorageError},
    table::{
        DATA_DIR, SegmentId, SegmentMeta, SongTable, TableAction,
        error::{
            BatchSchemaMismatchSnafu, ParquetWriteSnafu, SegmentCollisionSnafu, StorageSnafu,
            TableError, TableLogSnafu,
        },
    },
};

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Table version after the append.
    pub version: u64,
    /// Rows appended.
    pub rows: u64,
    /// The segment written, or `None` when there were no rows.
    pub segment: Option<SegmentMeta>,
}

/// Content-derived segment id, salted with the version it is written for.
///
/// Re-appending identical rows at a later version yields a distinct id.
pub fn segment_id_for(version: u64, data: &[u8]) -> SegmentId {
    let mut h = blake3::Hasher::new();
    h.update(b"segment-id-v1");
    h.update(b"\0");
    h.update(&version.to_le_bytes());
    h.update(b"\0");
    h.update(data);
    let hex = h.finalize().to_hex();
    SegmentId(hex[..32].to_string())
}

fn segment_rel_path(id: &SegmentId) -> String {
    format!("{DATA_DIR}/part-{id}.parquet")
}

fn encode_parquet(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>, TableError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();

    let mut writer =
        ArrowWriter::try_new(Vec::new(), schema, Some(props)).context(ParquetWriteSnafu)?;
    for batch in batches {
        writer.write(batch).context(ParquetWriteSnafu)?;
    }
    writer.into_inner().context(ParquetWriteSnafu)
}

impl SongTable {
    fn check_batch_schemas(&self, batches: &[RecordBatch]) -> Result<(), TableError> {
        let expected = self.schema().to_arrow_schema();
        for (i, batch) in batches.iter().enumerate() {
            let actual = batch.schema();
            ensure!(
                actual.fields() == expected.fields(),
                BatchSchemaMismatchSnafu {
                    detail: format!("batch {i} has fields {:?}", actual.fields()),
                }
            );
        }
        Ok(())
    }

    /// Write a segment file, tolerating an identical orphan left by an
    /// earlier attempt that never committed.
    async fn write_segment_file(&self, rel_path: &str, data: &[u8]) -> Result<(), TableError> {
        let rel = Path::new(rel_path);
        match storage::write_new(self.location(), rel, data).await {
            Ok(()) => Ok(()),
            Err(StorageError::AlreadyExists { .. }) => {
                let existing = storage::read_all_bytes(self.location(), rel)
                    .await
                    .context(StorageSnafu)?;
                ensure!(
                    existing == data,
                    SegmentCollisionSnafu {
                        path: rel_path.to_string()
                    }
                );
                log::debug!("reusing uncommitted segment file {rel_path}");
                Ok(())
            }
            Err(source) => Err(TableError::Storage { source }),
        }
    }

    /// Append `batches` as a single segment and commit it.
    ///
    /// All batches must carry the table's Arrow schema. With zero total rows
    /// nothing is written and the current version is returned.
    ///
    /// On `Conflict` (another writer committed first) nothing becomes
    /// visible; refresh and retry.
    pub async fn append_batches(
        &mut self,
        batches: &[RecordBatch],
    ) -> Result<AppendOutcome, TableError> {
        self.check_batch_schemas(batches)?;

        let rows: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();
        if rows == 0 {
            return Ok(AppendOutcome {
                version: self.version(),
                rows: 0,
                segment: None,
            });
        }

        let expected_version = self.version();
        let data = encode_parquet(self.schema().to_arrow_schema_ref(), batches)?;
        let segment_id = segment_id_for(expected_version + 1, &data);
        let path = segment_rel_path(&segment_id);

        self.write_segment_file(&path, &data).await?;

        let segment = SegmentMeta {
            segment_id,
            path,
            row_count: rows,
            file_size: data.len() as u64,
        };

        let version = self
            .log
            .commit_with_expected_version(
                expected_version,
                vec![TableAction::AddSegment(segment.clone())],
            )
            .await
            .context(TableLogSnafu)?;

        log::info!(
            "appended {rows} row(s) as segment {} (table version {version})",
            segment.segment_id
        );

        self.state.version = version;
        self.state.segments.push(segment.clone());

        Ok(AppendOutcome {
            version,
            rows,
            segment: Some(segment),
        })
    }
}
