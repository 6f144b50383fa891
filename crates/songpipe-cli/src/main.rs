//! CLI tool for incremental song ingestion and the derived views.

mod error;
mod query;

use std::path::{Path, PathBuf};

use chrono::DateTime;
use clap::{Parser, Subcommand, ValueEnum};
use snafu::ResultExt;
use songpipe_core::{
    checkpoint::{CheckpointStore, FileIdentity, FingerprintMode, LogCheckpointStore},
    loader::{IncrementalLoader, IngestContext, IngestionReport, LoaderOptions},
    schema::describe,
    storage::{self, StorageLocation},
    table::SongTable,
    views::{self, load_table},
};
use songpipe_datafusion::session_for_table;

use crate::{
    error::{
        CliError, CliResult, DataFusionSnafu, InvalidLocationSnafu, ListSourceSnafu,
        OpenTableSnafu, ReadCheckpointSnafu, ResetCheckpointSnafu, ResetTableSnafu, ViewSnafu,
        WriteOutputSnafu,
    },
    query::{QueryResult, print_query_result, render_table, run_sql},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FingerprintArg {
    /// A file is known once its path was ingested
    Path,
    /// A rewritten file (new size or mtime) is ingested again
    PathSizeMtime,
}

impl From<FingerprintArg> for FingerprintMode {
    fn from(v: FingerprintArg) -> Self {
        match v {
            FingerprintArg::Path => FingerprintMode::PathOnly,
            FingerprintArg::PathSizeMtime => FingerprintMode::PathSizeMtime,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ViewArg {
    ArtistsByYear,
    DanceableSongs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List source files and whether the checkpoint already holds them
    Ls {
        #[arg(long)]
        source: PathBuf,

        #[arg(long)]
        checkpoint: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = FingerprintArg::PathSizeMtime)]
        fingerprint: FingerprintArg,
    },

    /// Ingest every new source file into the table in one run
    Ingest {
        #[arg(long)]
        source: PathBuf,

        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long, value_enum, default_value_t = FingerprintArg::PathSizeMtime)]
        fingerprint: FingerprintArg,

        /// Do not take the checkpoint run lock
        #[arg(long, default_value_t = false)]
        no_lock: bool,

        /// Drop the table and checkpoint before ingesting
        #[arg(long, default_value_t = false)]
        reset: bool,
    },

    /// Remove the table and the checkpoint
    Reset {
        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        checkpoint: PathBuf,
    },

    /// Show a derived view
    View {
        #[arg(long)]
        table: PathBuf,

        #[arg(value_enum)]
        view: ViewArg,

        #[arg(long, default_value_t = 20)]
        max_rows: usize,
    },

    /// Songs per artist and year, most prolific first
    TopArtists {
        #[arg(long)]
        table: PathBuf,

        #[arg(long, default_value_t = 20)]
        max_rows: usize,
    },

    /// Execute SQL via DataFusion; the table is `songs`, both views are available
    Query {
        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        sql: String,

        #[arg(long, default_value_t = 20)]
        max_rows: usize,
    },
}

#[derive(Debug, Parser)]
#[command(name = "songpipe", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

fn parse_location(flag: &'static str, path: &Path) -> CliResult<StorageLocation> {
    let spec = path.to_string_lossy();
    StorageLocation::parse(spec.as_ref()).context(InvalidLocationSnafu {
        flag,
        spec: spec.to_string(),
    })
}

/// The checkpoint records the source root, so resolve it to one spelling.
/// An unresolvable path is kept as given and reported by the loader.
fn source_location(path: &Path) -> CliResult<StorageLocation> {
    let location = parse_location("--source", path)?;
    Ok(match std::fs::canonicalize(location.root()) {
        Ok(root) => StorageLocation::local(root),
        Err(_) => location,
    })
}

fn format_mtime(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

async fn cmd_ls(
    source: &Path,
    checkpoint: Option<&Path>,
    fingerprint: FingerprintArg,
) -> CliResult<()> {
    let location = source_location(source)?;
    let files = storage::list_files(&location)
        .await
        .context(ListSourceSnafu {
            path: location.to_string(),
        })?;

    let state = match checkpoint {
        Some(path) => {
            let ckpt = parse_location("--checkpoint", path)?;
            let store = LogCheckpointStore::new(ckpt.clone());
            Some(store.load().await.context(ReadCheckpointSnafu {
                path: ckpt.to_string(),
            })?)
        }
        None => None,
    };

    let mut columns = vec!["path".to_string(), "size".to_string(), "modified".to_string()];
    if state.is_some() {
        columns.push("ingested".to_string());
    }

    let mode = FingerprintMode::from(fingerprint);
    let rows: Vec<Vec<String>> = files
        .iter()
        .map(|entry| {
            let mut row = vec![
                entry.rel_path.clone(),
                entry.size.to_string(),
                format_mtime(entry.modified_ms),
            ];
            if let Some(state) = &state {
                let known = state.contains(&FileIdentity::from(entry), mode);
                row.push(if known { "yes" } else { "no" }.to_string());
            }
            row
        })
        .collect();

    if rows.is_empty() {
        println!("(no files)");
    } else {
        println!("{}", render_table("Source files", &columns, &rows));
    }
    println!("files: {}", rows.len());
    if let Some(state) = &state {
        println!("checkpoint_version: {}", state.version);
        if let Some(table_version) = state.last_table_version {
            println!("recorded_table_version: {table_version}");
        }
    }
    Ok(())
}

async fn reset_outputs(table: &StorageLocation, checkpoint: &StorageLocation) -> CliResult<()> {
    SongTable::destroy(table).await.context(ResetTableSnafu {
        table: table.to_string(),
    })?;
    LogCheckpointStore::reset(checkpoint)
        .await
        .context(ResetCheckpointSnafu {
            path: checkpoint.to_string(),
        })?;
    Ok(())
}

fn write_report<W: std::io::Write>(report: &IngestionReport, out: &mut W) -> CliResult<()> {
    if report.is_noop() {
        writeln!(
            out,
            "No new files ({} already ingested); nothing written.",
            report.files_skipped
        )
        .context(WriteOutputSnafu)?;
        return Ok(());
    }

    writeln!(
        out,
        "Ingested {} file(s), {} row(s).",
        report.files_ingested.len(),
        report.rows_written()
    )
    .context(WriteOutputSnafu)?;
    for path in &report.files_ingested {
        writeln!(out, "  {path}").context(WriteOutputSnafu)?;
    }
    writeln!(out, "files_discovered: {}", report.files_discovered).context(WriteOutputSnafu)?;
    writeln!(out, "files_skipped: {}", report.files_skipped).context(WriteOutputSnafu)?;
    writeln!(out, "malformed_records: {}", report.stats.malformed_records)
        .context(WriteOutputSnafu)?;
    writeln!(out, "coerced_nulls: {}", report.stats.coerced_nulls).context(WriteOutputSnafu)?;
    if let Some(v) = report.table_version {
        writeln!(out, "table_version: {v}").context(WriteOutputSnafu)?;
    }
    if let Some(v) = report.checkpoint_version {
        writeln!(out, "checkpoint_version: {v}").context(WriteOutputSnafu)?;
    }
    Ok(())
}

struct IngestArgs {
    source: PathBuf,
    table: PathBuf,
    checkpoint: PathBuf,
    fingerprint: FingerprintArg,
    no_lock: bool,
    reset: bool,
}

async fn cmd_ingest(args: IngestArgs) -> CliResult<()> {
    let source = source_location(&args.source)?;
    let table_loc = parse_location("--table", &args.table)?;
    let ckpt_loc = parse_location("--checkpoint", &args.checkpoint)?;

    if args.reset {
        reset_outputs(&table_loc, &ckpt_loc).await?;
        log::info!("reset table {table_loc} and checkpoint {ckpt_loc}");
    }

    let mut table = SongTable::open_or_create(table_loc.clone(), describe())
        .await
        .context(OpenTableSnafu {
            table: table_loc.to_string(),
        })?;
    let store = LogCheckpointStore::new(ckpt_loc);

    let options = LoaderOptions {
        fingerprint: args.fingerprint.into(),
        acquire_lock: !args.no_lock,
        ..LoaderOptions::default()
    };
    let ctx = IngestContext {
        source,
        table: &mut table,
        checkpoint: &store,
        schema: describe(),
        options,
    };

    let report = IncrementalLoader::run(ctx).await.map_err(CliError::ingest)?;
    write_report(&report, &mut std::io::stdout())
}

async fn cmd_reset(table: &Path, checkpoint: &Path) -> CliResult<()> {
    let table_loc = parse_location("--table", table)?;
    let ckpt_loc = parse_location("--checkpoint", checkpoint)?;
    reset_outputs(&table_loc, &ckpt_loc).await?;
    println!("Removed table {table_loc} and checkpoint {ckpt_loc}");
    Ok(())
}

async fn cmd_view(table: &Path, view: ViewArg, max_rows: usize) -> CliResult<()> {
    let location = parse_location("--table", table)?;
    let rows = load_table(&location).await.context(ViewSnafu)?;

    let def = match view {
        ViewArg::ArtistsByYear => views::artists_by_year(),
        ViewArg::DanceableSongs => views::danceable_songs(),
    };
    let out = def.browse(&rows).context(ViewSnafu)?;

    let res = QueryResult::from_batch(&def.name, &out, max_rows)?;
    print_query_result(&res, max_rows)
}

async fn cmd_top_artists(table: &Path, max_rows: usize) -> CliResult<()> {
    let location = parse_location("--table", table)?;
    let rows = load_table(&location).await.context(ViewSnafu)?;

    let agg = views::top_artists_by_year();
    let out = agg.evaluate(&rows).context(ViewSnafu)?;

    let res = QueryResult::from_batch(&agg.name, &out, max_rows)?;
    print_query_result(&res, max_rows)
}

async fn cmd_query(table: &Path, sql: &str, max_rows: usize) -> CliResult<()> {
    let location = parse_location("--table", table)?;
    let ctx = session_for_table(&location)
        .await
        .context(DataFusionSnafu)?;

    let res = run_sql(&ctx, sql, max_rows).await?;
    print_query_result(&res, max_rows)
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Ls {
            source,
            checkpoint,
            fingerprint,
        } => cmd_ls(&source, checkpoint.as_deref(), fingerprint).await,

        Command::Ingest {
            source,
            table,
            checkpoint,
            fingerprint,
            no_lock,
            reset,
        } => {
            cmd_ingest(IngestArgs {
                source,
                table,
                checkpoint,
                fingerprint,
                no_lock,
                reset,
            })
            .await
        }

        Command::Reset { table, checkpoint } => cmd_reset(&table, &checkpoint).await,

        Command::View {
            table,
            view,
            max_rows,
        } => cmd_view(&table, view, max_rows).await,

        Command::TopArtists { table, max_rows } => cmd_top_artists(&table, max_rows).await,

        Command::Query {
            table,
            sql,
            max_rows,
        } => cmd_query(&table, &sql, max_rows).await,
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use songpipe_core::parse::ParseStats;

    use super::*;

    #[test]
    fn noop_report_says_nothing_written() -> Result<(), Box<dyn std::error::Error>> {
        let report = IngestionReport {
            files_discovered: 2,
            files_skipped: 2,
            ..IngestionReport::default()
        };
        let mut out = Vec::new();
        write_report(&report, &mut out)?;
        assert_eq!(
            String::from_utf8(out)?,
            "No new files (2 already ingested); nothing written.\n"
        );
        Ok(())
    }

    #[test]
    fn report_lists_files_and_counters() -> Result<(), Box<dyn std::error::Error>> {
        let report = IngestionReport {
            files_discovered: 3,
            files_skipped: 1,
            files_ingested: vec!["a.tsv".to_string(), "b/c.tsv".to_string()],
            stats: ParseStats {
                rows: 5,
                coerced_nulls: 1,
                malformed_records: 0,
            },
            table_version: Some(2),
            checkpoint_version: Some(2),
        };
        let mut out = Vec::new();
        write_report(&report, &mut out)?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("Ingested 2 file(s), 5 row(s)."));
        assert!(text.contains("  b/c.tsv\n"));
        assert!(text.contains("coerced_nulls: 1"));
        assert!(text.contains("table_version: 2"));
        Ok(())
    }

    #[test]
    fn fingerprint_arg_maps_to_mode() {
        assert_eq!(
            FingerprintMode::from(FingerprintArg::Path),
            FingerprintMode::PathOnly
        );
        assert_eq!(
            FingerprintMode::from(FingerprintArg::PathSizeMtime),
            FingerprintMode::PathSizeMtime
        );
    }
}
