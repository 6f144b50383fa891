//! SQL views must return what the typed views return.

use arrow::{record_batch::RecordBatch, util::pretty::pretty_format_batches};
use songpipe_core::{
    parse::parse_tsv,
    schema::describe,
    storage::StorageLocation,
    table::SongTable,
    views::{artists_by_year, danceable_songs, top_artists_by_year},
};
use songpipe_datafusion::{
    SONGS_TABLE, register_song_table, register_views, session_for_table, top_artists_sql,
};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn tsv_row(artist: &str, title: &str, tempo: &str, time_signature: &str, year: &str) -> String {
    let mut f = vec![""; 20];
    f[0] = "AR";
    f[4] = artist;
    f[14] = tempo;
    f[15] = time_signature;
    f[17] = title;
    f[18] = year;
    f.join("\t")
}

fn sample_tsv() -> String {
    [
        tsv_row("Ann", "one", "100", "4", "1999"),
        tsv_row("Ann", "two", "120.5", "4", "1999"),
        tsv_row("Ann", "three", "99.9", "4", "1999"),
        tsv_row("Bob", "waltz", "120", "3", "2004"),
        tsv_row("Bob", "edge", "140", "4", "2004"),
        tsv_row("Cy", "old", "", "", "0"),
        tsv_row("", "anon", "110", "4", "2010"),
        tsv_row("Dee", "late", "141", "4", "2012"),
    ]
    .join("\n")
}

async fn sample_table(
    tmp: &TempDir,
) -> Result<(StorageLocation, SongTable), Box<dyn std::error::Error>> {
    let location = StorageLocation::local(tmp.path().join("table"));
    let mut table = SongTable::create(location.clone(), describe()).await?;
    let parsed = parse_tsv(sample_tsv().as_bytes(), &describe(), "sample.tsv")?;
    table.append_batches(&[parsed.batch]).await?;
    Ok((location, table))
}

/// Data lines of a pretty-printed table, optionally sorted.
fn body_lines(
    batches: &[RecordBatch],
    sort: bool,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let rendered = pretty_format_batches(batches)?.to_string();
    let mut lines: Vec<String> = rendered
        .lines()
        .filter(|l| l.starts_with('|'))
        .skip(1)
        .map(str::to_string)
        .collect();
    if sort {
        lines.sort();
    }
    Ok(lines)
}

#[tokio::test]
async fn sql_views_match_typed_views() -> TestResult {
    let tmp = TempDir::new()?;
    let (location, table) = sample_table(&tmp).await?;
    let rows = table.scan_concat().await?;
    let ctx = session_for_table(&location).await?;

    for view in [artists_by_year(), danceable_songs()] {
        let typed = view.evaluate(&rows)?;
        let sql = ctx
            .sql(&format!("SELECT * FROM {}", view.name))
            .await?
            .collect()
            .await?;
        assert_eq!(
            body_lines(&sql, true)?,
            body_lines(&[typed], true)?,
            "view {}",
            view.name
        );
    }
    Ok(())
}

#[tokio::test]
async fn top_artists_sql_matches_typed_aggregate_order() -> TestResult {
    let tmp = TempDir::new()?;
    let (location, table) = sample_table(&tmp).await?;
    let rows = table.scan_concat().await?;
    let ctx = session_for_table(&location).await?;

    let typed = top_artists_by_year().evaluate(&rows)?;
    let sql = ctx.sql(&top_artists_sql()).await?.collect().await?;

    let typed_lines = body_lines(&[typed], false)?;
    assert_eq!(body_lines(&sql, false)?, typed_lines);
    assert!(typed_lines[0].contains("Ann"));
    assert!(typed_lines[0].contains('3'));
    Ok(())
}

#[tokio::test]
async fn danceable_boundaries_hold_in_sql() -> TestResult {
    let tmp = TempDir::new()?;
    let (_location, table) = sample_table(&tmp).await?;

    let ctx = datafusion::prelude::SessionContext::new();
    register_song_table(&ctx, &table, SONGS_TABLE).await?;
    register_views(&ctx, SONGS_TABLE).await?;

    let batches = ctx
        .sql("SELECT title FROM danceable_songs ORDER BY title")
        .await?
        .collect()
        .await?;
    assert_eq!(body_lines(&batches, false)?, [
        "| anon  |",
        "| edge  |",
        "| one   |",
        "| two   |"
    ]);
    Ok(())
}

#[tokio::test]
async fn missing_table_fails_to_register() -> TestResult {
    let tmp = TempDir::new()?;
    let Err(err) = session_for_table(&StorageLocation::local(tmp.path())).await else {
        return Err("expected missing table".into());
    };
    assert!(err.to_string().contains("Table not found"));
    Ok(())
}
