//! Full-table reads.
//!
//! Only segments listed by commits up to `CURRENT` are read, in commit order,
//! so a reader never sees part of a batch.

use std::path::Path;

use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use snafu::prelude::*;

use crate::{
    storage::{self, StorageLocation},
    table::{
        SegmentMeta, SongTable,
        error::{ArrowSnafu, ParquetReadSnafu, StorageSnafu, TableError},
    },
};

const SEGMENT_READ_CONCURRENCY: usize = 4;

async fn read_segment(
    location: &StorageLocation,
    segment: &SegmentMeta,
) -> Result<Vec<RecordBatch>, TableError> {
    let bytes = storage::read_all_bytes(location, Path::new(&segment.path))
        .await
        .context(StorageSnafu)?;

    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .and_then(|builder| builder.build())
        .context(ParquetReadSnafu {
            path: segment.path.clone(),
        })?;

    reader
        .map(|batch| batch.context(ArrowSnafu))
        .collect()
}

impl SongTable {
    /// Read every committed row, segment by segment in commit order.
    pub async fn scan(&self) -> Result<Vec<RecordBatch>, TableError> {
        let location = self.location();
        let per_segment: Vec<Vec<RecordBatch>> = stream::iter(self.segments())
            .map(|segment| read_segment(location, segment))
            .buffered(SEGMENT_READ_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(per_segment.into_iter().flatten().collect())
    }

    /// Read every committed row as a single batch with the table schema.
    pub async fn scan_concat(&self) -> Result<RecordBatch, TableError> {
        let batches = self.scan().await?;
        arrow::compute::concat_batches(&self.schema().to_arrow_schema_ref(), &batches)
            .context(ArrowSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema::describe, table::test_util::*};
    use arrow::array::{Array, Int64Array, StringArray};
    use tempfile::TempDir;

    #[tokio::test]
    async fn scan_returns_rows_in_commit_order() -> TestResult {
        let tmp = TempDir::new()?;
        let mut table = SongTable::create(StorageLocation::local(tmp.path()), describe()).await?;
        table.append_batches(&[songs_batch(&[song("A", 2000)])]).await?;
        table
            .append_batches(&[songs_batch(&[song("B", 2001), song("C", 2002)])])
            .await?;

        let batch = table.scan_concat().await?;
        assert_eq!(batch.num_rows(), 3);
        let names = batch
            .column_by_name("artist_name")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .expect("artist_name");
        assert_eq!(
            (0..3).map(|i| names.value(i)).collect::<Vec<_>>(),
            ["A", "B", "C"]
        );
        let years = batch
            .column_by_name("year")
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .expect("year");
        assert_eq!(years.value(2), 2002);
        Ok(())
    }

    #[tokio::test]
    async fn scan_of_empty_table_is_empty() -> TestResult {
        let tmp = TempDir::new()?;
        let table = SongTable::create(StorageLocation::local(tmp.path()), describe()).await?;

        assert!(table.scan().await?.is_empty());
        let batch = table.scan_concat().await?;
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 20);
        Ok(())
    }

    #[tokio::test]
    async fn uncommitted_segment_files_are_invisible() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let mut table = SongTable::create(location.clone(), describe()).await?;
        table.append_batches(&[songs_batch(&[song("A", 2000)])]).await?;

        let committed = &table.segments()[0];
        tokio::fs::copy(
            tmp.path().join(&committed.path),
            tmp.path().join("data/part-orphan.parquet"),
        )
        .await?;

        let reopened = SongTable::open(location).await?;
        assert_eq!(reopened.scan_concat().await?.num_rows(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_segment_file_surfaces_storage_error() -> TestResult {
        let tmp = TempDir::new()?;
        let mut table = SongTable::create(StorageLocation::local(tmp.path()), describe()).await?;
        table.append_batches(&[songs_batch(&[song("A", 2000)])]).await?;
        tokio::fs::remove_file(tmp.path().join(&table.segments()[0].path)).await?;

        let err = table.scan().await.expect_err("expected storage error");
        assert!(matches!(err, TableError::Storage { .. }));
        Ok(())
    }
}
