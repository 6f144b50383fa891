//! Derived views over the song table.
//!
//! Views are parameterless query objects evaluated on demand against the
//! committed rows; nothing is materialized. Each one can also be rendered as
//! SQL so a query engine can register it under the same name.

mod eval;

use std::fmt;

use arrow::{error::ArrowError, record_batch::RecordBatch};
use snafu::prelude::*;

use crate::{
    storage::StorageLocation,
    table::{SongTable, TableError},
};

/// Name of the `artists_by_year` view.
pub const ARTISTS_BY_YEAR: &str = "artists_by_year";
/// Name of the aggregate over `artists_by_year`.
pub const TOP_ARTISTS_BY_YEAR: &str = "top_artists_by_year";
/// Name of the `danceable_songs` view.
pub const DANCEABLE_SONGS: &str = "danceable_songs";
/// Rows shown when browsing `danceable_songs`.
pub const DANCEABLE_BROWSE_LIMIT: usize = 100;

/// Errors raised while evaluating views.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ViewError {
    /// The output table does not exist yet.
    #[snafu(display("Table not found at {location}; run an ingestion first"))]
    TableNotFound {
        /// Table root that was opened.
        location: String,
    },

    /// Any other table error while reading rows.
    #[snafu(display("Failed to read table: {source}"))]
    Table {
        /// Underlying table error.
        source: TableError,
    },

    /// A view refers to a column the input does not have.
    #[snafu(display("View {view} refers to unknown column {column}"))]
    UnknownColumn {
        /// View being evaluated.
        view: String,
        /// Missing column.
        column: String,
    },

    /// A literal cannot be compared with a column of this type.
    #[snafu(display("Cannot compare column {column} of type {data_type} with {literal}"))]
    IncomparableLiteral {
        /// Column being compared.
        column: String,
        /// Its Arrow type.
        data_type: String,
        /// The literal, as SQL text.
        literal: String,
    },

    /// Arrow kernel failure.
    #[snafu(display("Arrow error while evaluating view: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

/// A constant in a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Integer constant.
    Int(i64),
    /// Floating point constant.
    Float(f64),
    /// String constant.
    Str(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

/// Row filter. Rows where the predicate is null are dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `column > value`
    Gt {
        /// Column name.
        column: String,
        /// Right-hand side.
        value: Literal,
    },
    /// `column = value`
    Eq {
        /// Column name.
        column: String,
        /// Right-hand side.
        value: Literal,
    },
    /// `column BETWEEN low AND high`, both ends inclusive.
    Between {
        /// Column name.
        column: String,
        /// Inclusive lower bound.
        low: Literal,
        /// Inclusive upper bound.
        high: Literal,
    },
    /// Conjunction of all parts.
    And(Vec<Predicate>),
}

impl Predicate {
    /// `column > value`
    pub fn gt(column: &str, value: Literal) -> Self {
        Predicate::Gt {
            column: column.to_string(),
            value,
        }
    }

    /// `column = value`
    pub fn eq(column: &str, value: Literal) -> Self {
        Predicate::Eq {
            column: column.to_string(),
            value,
        }
    }

    /// `column BETWEEN low AND high`
    pub fn between(column: &str, low: Literal, high: Literal) -> Self {
        Predicate::Between {
            column: column.to_string(),
            low,
            high,
        }
    }

    /// Render as a SQL boolean expression.
    pub fn to_sql(&self) -> String {
        match self {
            Predicate::Gt { column, value } => format!("{column} > {value}"),
            Predicate::Eq { column, value } => format!("{column} = {value}"),
            Predicate::Between { column, low, high } => {
                format!("{column} BETWEEN {low} AND {high}")
            }
            Predicate::And(parts) => parts
                .iter()
                .map(|p| match p {
                    Predicate::And(_) => format!("({})", p.to_sql()),
                    _ => p.to_sql(),
                })
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }
}

/// Filter-and-project view over the song table.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDef {
    /// View name.
    pub name: String,
    /// Output columns, in order.
    pub projection: Vec<String>,
    /// Optional row filter.
    pub filter: Option<Predicate>,
    /// Rows shown when browsing; the view itself is unbounded.
    pub browse_limit: Option<usize>,
}

/// Sort key; nulls always sort last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Column to sort by.
    pub column: String,
    /// Descending if true.
    pub descending: bool,
}

impl SortKey {
    /// Descending key.
    pub fn desc(column: &str) -> Self {
        SortKey {
            column: column.to_string(),
            descending: true,
        }
    }
}

/// Grouped count over another view.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDef {
    /// Query name.
    pub name: String,
    /// View the aggregate reads from.
    pub input: ViewDef,
    /// Grouping columns.
    pub group_by: Vec<String>,
    /// Column whose non-null values are counted.
    pub count_column: String,
    /// Output name of the count.
    pub count_alias: String,
    /// Output columns, in order (group columns and the count alias).
    pub select: Vec<String>,
    /// Ordering of the result.
    pub order_by: Vec<SortKey>,
    /// Optional row limit.
    pub limit: Option<usize>,
}

impl ViewDef {
    /// Render as a SQL query over `table`.
    pub fn to_sql(&self, table: &str) -> String {
        let mut sql = format!("SELECT {} FROM {table}", self.projection.join(", "));
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.to_sql());
        }
        sql
    }

    /// Evaluate against `batch`, which must carry every referenced column.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<RecordBatch, ViewError> {
        eval::evaluate_view(self, batch)
    }

    /// Evaluate and keep at most `browse_limit` rows.
    pub fn browse(&self, batch: &RecordBatch) -> Result<RecordBatch, ViewError> {
        let out = self.evaluate(batch)?;
        Ok(match self.browse_limit {
            Some(limit) if out.num_rows() > limit => out.slice(0, limit),
            _ => out,
        })
    }
}

impl AggregateDef {
    /// Render as a SQL query over the input view, referenced by name.
    pub fn to_sql(&self) -> String {
        let select = self
            .select
            .iter()
            .map(|c| {
                if *c == self.count_alias {
                    format!("count({}) AS {}", self.count_column, self.count_alias)
                } else {
                    c.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let order = self
            .order_by
            .iter()
            .map(|k| {
                let dir = if k.descending { "DESC" } else { "ASC" };
                format!("{} {dir} NULLS LAST", k.column)
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "SELECT {select} FROM {} GROUP BY {}",
            self.input.name,
            self.group_by.join(", ")
        );
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }

    /// Evaluate the input view over `batch`, then group, count and sort.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<RecordBatch, ViewError> {
        let input = self.input.evaluate(batch)?;
        eval::evaluate_aggregate(self, &input)
    }
}

/// `(artist_name, year)` for songs with a positive year.
pub fn artists_by_year() -> ViewDef {
    ViewDef {
        name: ARTISTS_BY_YEAR.to_string(),
        projection: vec!["artist_name".to_string(), "year".to_string()],
        filter: Some(Predicate::gt("year", Literal::Int(0))),
        browse_limit: None,
    }
}

/// Songs per artist and year, most prolific first, then most recent.
pub fn top_artists_by_year() -> AggregateDef {
    AggregateDef {
        name: TOP_ARTISTS_BY_YEAR.to_string(),
        input: artists_by_year(),
        group_by: vec!["artist_name".to_string(), "year".to_string()],
        count_column: "artist_name".to_string(),
        count_alias: "num_songs".to_string(),
        select: vec![
            "artist_name".to_string(),
            "num_songs".to_string(),
            "year".to_string(),
        ],
        order_by: vec![SortKey::desc("num_songs"), SortKey::desc("year")],
        limit: None,
    }
}

/// `(artist_name, title, tempo)` for 4/4 songs between 100 and 140 bpm.
pub fn danceable_songs() -> ViewDef {
    ViewDef {
        name: DANCEABLE_SONGS.to_string(),
        projection: vec![
            "artist_name".to_string(),
            "title".to_string(),
            "tempo".to_string(),
        ],
        filter: Some(Predicate::And(vec![
            Predicate::eq("time_signature", Literal::Int(4)),
            Predicate::between("tempo", Literal::Int(100), Literal::Int(140)),
        ])),
        browse_limit: Some(DANCEABLE_BROWSE_LIMIT),
    }
}

/// Read every committed row of the table at `location` as one batch.
pub async fn load_table(location: &StorageLocation) -> Result<RecordBatch, ViewError> {
    let table = SongTable::open(location.clone())
        .await
        .map_err(|source| match source {
            TableError::TableNotFound { location } => ViewError::TableNotFound { location },
            source => ViewError::Table { source },
        })?;
    table.scan_concat().await.context(TableSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::describe,
        table::test_util::{TestResult, songs_batch},
    };
    use tempfile::TempDir;

    #[test]
    fn views_render_as_sql() {
        assert_eq!(
            artists_by_year().to_sql("songs"),
            "SELECT artist_name, year FROM songs WHERE year > 0"
        );
        assert_eq!(
            danceable_songs().to_sql("songs"),
            "SELECT artist_name, title, tempo FROM songs \
             WHERE time_signature = 4 AND tempo BETWEEN 100 AND 140"
        );
        assert_eq!(
            top_artists_by_year().to_sql(),
            "SELECT artist_name, count(artist_name) AS num_songs, year FROM artists_by_year \
             GROUP BY artist_name, year ORDER BY num_songs DESC NULLS LAST, year DESC NULLS LAST"
        );
    }

    #[test]
    fn literals_render_as_sql() {
        assert_eq!(Literal::Float(99.9).to_string(), "99.9");
        assert_eq!(Literal::Float(100.0).to_string(), "100.0");
        assert_eq!(Literal::Str("it's".to_string()).to_string(), "'it''s'");
    }

    #[tokio::test]
    async fn absent_table_is_reported() -> TestResult {
        let tmp = TempDir::new()?;
        let err = load_table(&StorageLocation::local(tmp.path()))
            .await
            .expect_err("expected TableNotFound");
        assert!(matches!(err, ViewError::TableNotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn views_see_committed_rows() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let mut table = SongTable::create(location.clone(), describe()).await?;
        table
            .append_batches(&[songs_batch(&[
                crate::table::test_util::song("A", 2000),
                crate::table::test_util::song("B", 0),
            ])])
            .await?;

        let rows = load_table(&location).await?;
        let out = artists_by_year().evaluate(&rows)?;
        assert_eq!(out.num_rows(), 1);
        Ok(())
    }
}
