//! DataFusion integration for `songpipe-core`.
//!
//! This crate keeps all DataFusion types out of `songpipe-core`. It registers
//! a snapshot of the song table plus the `artists_by_year` and
//! `danceable_songs` views in a [`SessionContext`], so the same queries the
//! typed views run are available through SQL.

use std::sync::Arc;

use datafusion::{
    datasource::MemTable,
    error::{DataFusionError, Result},
    prelude::SessionContext,
};
use songpipe_core::{
    storage::StorageLocation,
    table::SongTable,
    views::{artists_by_year, danceable_songs, top_artists_by_year},
};

/// Name the song table is registered under by [`session_for_table`].
pub const SONGS_TABLE: &str = "songs";

/// Register the committed rows of `table` as `name`.
///
/// The registration is a snapshot; rows appended afterwards are not seen.
pub async fn register_song_table(
    ctx: &SessionContext,
    table: &SongTable,
    name: &str,
) -> Result<()> {
    let batches = table
        .scan()
        .await
        .map_err(|e| DataFusionError::External(Box::new(e)))?;
    let schema = table.schema().to_arrow_schema_ref();

    let provider = MemTable::try_new(schema, vec![batches])?;
    ctx.register_table(name, Arc::new(provider))?;
    log::debug!(
        "registered table {name} at version {} ({} rows)",
        table.version(),
        table.total_rows()
    );
    Ok(())
}

/// Create the `artists_by_year` and `danceable_songs` SQL views over `table_name`.
pub async fn register_views(ctx: &SessionContext, table_name: &str) -> Result<()> {
    for view in [artists_by_year(), danceable_songs()] {
        let ddl = format!("CREATE VIEW {} AS {}", view.name, view.to_sql(table_name));
        ctx.sql(&ddl).await?.collect().await?;
    }
    Ok(())
}

/// SQL text of the aggregate over `artists_by_year`.
///
/// Requires the views from [`register_views`].
pub fn top_artists_sql() -> String {
    top_artists_by_year().to_sql()
}

/// Open the table at `location` and build a session with the table
/// registered as [`SONGS_TABLE`] and both views available.
pub async fn session_for_table(location: &StorageLocation) -> Result<SessionContext> {
    let table = SongTable::open(location.clone())
        .await
        .map_err(|e| DataFusionError::External(Box::new(e)))?;

    let ctx = SessionContext::new();
    register_song_table(&ctx, &table, SONGS_TABLE).await?;
    register_views(&ctx, SONGS_TABLE).await?;
    Ok(ctx)
}
