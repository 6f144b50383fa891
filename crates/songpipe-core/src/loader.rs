//! Incremental file loader.
//!
//! One run moves every not-yet-ingested source file into the output table
//! as a single durable batch, then records those files in the checkpoint:
//!
//! 1. list the source (hidden entries skipped, sorted by relative path)
//! 2. drop files the checkpoint already holds
//! 3. read the rest concurrently, parse them in parallel
//! 4. append all rows as one table commit
//! 5. record the files in one checkpoint commit
//!
//! Step 5 runs only after step 4 succeeded, so a crash between them leaves
//! rows that the next run ingests again (at-least-once). With no new files
//! the run writes nothing.

pub mod context;
pub mod error;

use std::path::Path;

use arrow::record_batch::RecordBatch;
use futures::stream::{self, StreamExt, TryStreamExt};
use rayon::prelude::*;
use snafu::prelude::*;

use crate::{
    checkpoint::{CheckpointAction, CheckpointError, CheckpointState, FileIdentity},
    parse::{ParseStats, ParsedFile, parse_tsv},
    schema::RowSchema,
    storage::{self, FileEntry},
};

pub use context::{DEFAULT_READ_CONCURRENCY, IngestContext, LoaderOptions};
pub use error::{CommitProgress, LoaderError};
use error::{
    CheckpointFailedSnafu, CheckpointUnavailableSnafu, ParseFailedSnafu, ParseWorkerSnafu,
    ReadFailedSnafu, SourceMismatchSnafu, SourceUnavailableSnafu, WriteFailedSnafu,
};

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionReport {
    /// Regular files found in the source.
    pub files_discovered: usize,
    /// Files skipped because the checkpoint already holds them.
    pub files_skipped: usize,
    /// Relative paths ingested by this run, in batch order.
    pub files_ingested: Vec<String>,
    /// Parse counters summed over the ingested files.
    pub stats: ParseStats,
    /// Table version holding this run's rows, if any were written.
    pub table_version: Option<u64>,
    /// Checkpoint version after this run, if it was advanced.
    pub checkpoint_version: Option<u64>,
}

impl IngestionReport {
    /// Rows appended to the table.
    pub fn rows_written(&self) -> u64 {
        self.stats.rows
    }

    /// True if the run found nothing new and wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.files_ingested.is_empty()
    }
}

/// Entry point for ingestion runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementalLoader;

impl IncrementalLoader {
    /// Execute one run against `ctx`.
    ///
    /// Holds the checkpoint run lock for the whole run unless
    /// `ctx.options.acquire_lock` is false.
    pub async fn run(ctx: IngestContext<'_>) -> Result<IngestionReport, LoaderError> {
        if !ctx.options.acquire_lock {
            return run_unlocked(ctx).await;
        }

        let lock = ctx.checkpoint.lock().await.map_err(|source| match source {
            CheckpointError::AlreadyRunning { .. } => LoaderError::AlreadyRunning { source },
            source => LoaderError::CheckpointUnavailable { source },
        })?;

        let result = run_unlocked(ctx).await;

        if let Err(e) = lock.release().await {
            log::warn!("failed to release run lock: {e}");
        }
        result
    }
}

fn new_files(
    entries: &[FileEntry],
    state: &CheckpointState,
    options: &LoaderOptions,
) -> Vec<FileIdentity> {
    entries
        .iter()
        .map(FileIdentity::from)
        .filter(|ident| {
            let seen = state.contains(ident, options.fingerprint);
            if seen {
                log::debug!("skipping already ingested {}", ident.path);
            }
            !seen
        })
        .collect()
}

async fn read_sources(
    ctx: &IngestContext<'_>,
    files: &[FileIdentity],
) -> Result<Vec<(String, Vec<u8>)>, LoaderError> {
    let concurrency = ctx.options.read_concurrency.max(1);
    stream::iter(files)
        .map(|file| async move {
            let bytes = storage::read_all_bytes(&ctx.source, Path::new(&file.path))
                .await
                .context(ReadFailedSnafu {
                    path: file.path.clone(),
                })?;
            Ok::<_, LoaderError>((file.path.clone(), bytes))
        })
        .buffered(concurrency)
        .try_collect()
        .await
}

/// Parse on the blocking pool, one rayon task per file; output keeps input order.
async fn parse_sources(
    contents: Vec<(String, Vec<u8>)>,
    schema: RowSchema,
) -> Result<Vec<ParsedFile>, LoaderError> {
    let parsed = tokio::task::spawn_blocking(move || {
        contents
            .par_iter()
            .map(|(name, bytes)| parse_tsv(bytes, &schema, name))
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .context(ParseWorkerSnafu)?;

    parsed.context(ParseFailedSnafu)
}

async fn run_unlocked(ctx: IngestContext<'_>) -> Result<IngestionReport, LoaderError> {
    let source_root = ctx.source.to_string();

    let entries = storage::list_files(&ctx.source)
        .await
        .context(SourceUnavailableSnafu {
            source_root: source_root.clone(),
        })?;

    let state = ctx
        .checkpoint
        .load()
        .await
        .context(CheckpointUnavailableSnafu)?;

    if let Some(recorded) = &state.source {
        ensure!(
            *recorded == source_root,
            SourceMismatchSnafu {
                recorded: recorded.clone(),
                requested: source_root.clone(),
            }
        );
    }

    let files = new_files(&entries, &state, &ctx.options);
    let mut report = IngestionReport {
        files_discovered: entries.len(),
        files_skipped: entries.len() - files.len(),
        ..Default::default()
    };
    log::info!(
        "{source_root}: {} file(s) discovered, {} new, {} already ingested",
        report.files_discovered,
        files.len(),
        report.files_skipped
    );

    if files.is_empty() {
        return Ok(report);
    }

    let contents = read_sources(&ctx, &files).await?;
    let parsed = parse_sources(contents, ctx.schema.clone()).await?;

    let mut batches: Vec<RecordBatch> = Vec::with_capacity(parsed.len());
    for file in parsed {
        report.stats += file.stats;
        batches.push(file.batch);
    }
    if report.stats.malformed_records > 0 || report.stats.coerced_nulls > 0 {
        log::warn!(
            "{source_root}: {} malformed record(s), {} value(s) coerced to null",
            report.stats.malformed_records,
            report.stats.coerced_nulls
        );
    }

    let rows = report.stats.rows;
    let table_version = if rows > 0 {
        let outcome = ctx
            .table
            .append(&batches)
            .await
            .context(WriteFailedSnafu { rows })?;
        report.table_version = Some(outcome.version);
        outcome.version
    } else {
        log::info!("{source_root}: new files hold no rows, skipping table write");
        ctx.table.version()
    };

    let mut actions = Vec::with_capacity(2);
    if state.source.is_none() {
        actions.push(CheckpointAction::Init {
            source: source_root.clone(),
        });
    }
    actions.push(CheckpointAction::RecordFiles {
        files: files.clone(),
        table_version,
    });

    let checkpoint_version = ctx
        .checkpoint
        .commit(state.version, actions)
        .await
        .context(CheckpointFailedSnafu {
            rows_committed: if report.table_version.is_some() { rows } else { 0 },
            pending_files: files.len() as u64,
            table_version,
        })?;

    report.checkpoint_version = Some(checkpoint_version);
    report.files_ingested = files.into_iter().map(|f| f.path).collect();

    log::info!(
        "{source_root}: ingested {} file(s), {rows} row(s) (table v{table_version}, checkpoint v{checkpoint_version})",
        report.files_ingested.len()
    );

    Ok(report)
}
