use std::io::Write;

use arrow::{
    error::ArrowError,
    record_batch::RecordBatch,
    util::display::{ArrayFormatter, FormatOptions},
};
use datafusion::prelude::SessionContext;
use futures_util::StreamExt;
use snafu::ResultExt;
use tabled::{
    builder::Builder,
    settings::{Style, object::Rows, style::LineText, width::MinWidth},
};

use crate::error::{ArrowSnafu, CliResult, DataFusionSnafu, WriteOutputSnafu};

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub label: String,
    pub columns: Vec<String>,
    pub preview_rows: Vec<Vec<String>>,
    pub total_rows: u64,
}

impl QueryResult {
    pub fn new(label: &str) -> Self {
        QueryResult {
            label: label.to_string(),
            ..QueryResult::default()
        }
    }

    /// Count the rows of `batch` and keep up to `max_rows` total as preview.
    pub fn push_batch(&mut self, batch: &RecordBatch, max_rows: usize) -> CliResult<()> {
        self.total_rows += batch.num_rows() as u64;

        if self.columns.is_empty() {
            self.columns = batch
                .schema()
                .fields()
                .iter()
                .map(|f| f.name().to_string())
                .collect();
        }

        let rows_left = max_rows.saturating_sub(self.preview_rows.len());
        if rows_left == 0 {
            return Ok(());
        }

        let options = FormatOptions::default().with_null("NULL");
        let formatters = batch
            .columns()
            .iter()
            .map(|col| ArrayFormatter::try_new(col.as_ref(), &options))
            .collect::<Result<Vec<_>, ArrowError>>()
            .context(ArrowSnafu)?;

        let rows_to_take = rows_left.min(batch.num_rows());
        for row_idx in 0..rows_to_take {
            let mut row = Vec::with_capacity(formatters.len());
            for formatter in &formatters {
                row.push(
                    formatter
                        .value(row_idx)
                        .try_to_string()
                        .context(ArrowSnafu)?,
                );
            }
            self.preview_rows.push(row);
        }
        Ok(())
    }

    pub fn from_batch(label: &str, batch: &RecordBatch, max_rows: usize) -> CliResult<Self> {
        let mut res = QueryResult::new(label);
        res.push_batch(batch, max_rows)?;
        Ok(res)
    }
}

/// Run `sql` and stream the result into a preview.
pub async fn run_sql(ctx: &SessionContext, sql: &str, max_rows: usize) -> CliResult<QueryResult> {
    let df = ctx.sql(sql).await.context(DataFusionSnafu)?;
    let mut stream = df.execute_stream().await.context(DataFusionSnafu)?;

    let mut res = QueryResult::new("Query output");
    while let Some(item) = stream.next().await {
        let batch = item.context(DataFusionSnafu)?;
        res.push_batch(&batch, max_rows)?;
    }
    Ok(res)
}

pub(crate) fn render_table(label: &str, columns: &[String], rows: &[Vec<String>]) -> String {
    if columns.is_empty() {
        return String::new();
    }

    const LABEL_OFFSET: usize = 6;
    let min_width = LABEL_OFFSET + label.len() + 4;

    let mut builder = Builder::default();
    builder.push_record(columns);
    for row in rows {
        builder.push_record(row);
    }

    let mut table = builder.build();

    table.with(Style::rounded());
    table.with(MinWidth::new(min_width));
    if !label.is_empty() {
        table.with(LineText::new(label.to_string(), Rows::first()).offset(LABEL_OFFSET));
        // LineText re-estimates dimensions, so re-apply MinWidth afterwards.
        table.with(MinWidth::new(min_width));
    }
    table.to_string()
}

pub fn preview_message(res: &QueryResult, max_rows: usize) -> Option<String> {
    if res.total_rows == 0 {
        return Some("(no rows)".to_string());
    }

    if max_rows == 0 {
        return Some("(preview suppressed; use --max-rows > 0)".to_string());
    }

    None
}

pub fn write_query_result<W: Write>(
    res: &QueryResult,
    max_rows: usize,
    out: &mut W,
) -> CliResult<()> {
    if !res.preview_rows.is_empty() {
        let rendered = render_table(&res.label, &res.columns, &res.preview_rows);
        writeln!(out, "{rendered}").context(WriteOutputSnafu)?;
    }

    if let Some(message) = preview_message(res, max_rows) {
        writeln!(out, "{message}").context(WriteOutputSnafu)?;
    }

    writeln!(out, "total_rows: {}", res.total_rows).context(WriteOutputSnafu)?;
    Ok(())
}

pub fn print_query_result(res: &QueryResult, max_rows: usize) -> CliResult<()> {
    let mut stdout = std::io::stdout();
    write_query_result(res, max_rows, &mut stdout)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::{
        array::{ArrayRef, Int64Array, StringArray},
        datatypes::{DataType, Field, Schema},
    };

    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sample_batch() -> Result<RecordBatch, ArrowError> {
        let schema = Schema::new(vec![
            Field::new("artist_name", DataType::Utf8, true),
            Field::new("year", DataType::Int64, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec![Some("Ann"), None, Some("Bob")])) as ArrayRef,
                Arc::new(Int64Array::from(vec![Some(1999), Some(2001), None])),
            ],
        )
    }

    #[test]
    fn render_table_aligns_columns() {
        let columns = vec!["col1".to_string(), "longer".to_string()];
        let rows = vec![
            vec!["a".to_string(), "value".to_string()],
            vec!["bb".to_string(), "x".to_string()],
        ];

        let rendered = render_table("Preview output", &columns, &rows);
        assert!(rendered.contains("col1"));
        assert!(rendered.contains("longer"));
        assert!(rendered.contains("Preview output"));
    }

    #[test]
    fn preview_is_capped_but_total_counts_everything() -> TestResult {
        let batch = sample_batch()?;
        let mut res = QueryResult::new("x");
        res.push_batch(&batch, 4)?;
        res.push_batch(&batch, 4)?;

        assert_eq!(res.total_rows, 6);
        assert_eq!(res.preview_rows.len(), 4);
        assert_eq!(res.columns, vec!["artist_name", "year"]);
        assert_eq!(res.preview_rows[1], vec!["NULL", "2001"]);
        Ok(())
    }

    #[test]
    fn empty_result_says_no_rows() -> TestResult {
        let batch = sample_batch()?.slice(0, 0);
        let res = QueryResult::from_batch("x", &batch, 10)?;

        let mut out = Vec::new();
        write_query_result(&res, 10, &mut out)?;
        let text = String::from_utf8(out)?;
        assert!(text.contains("(no rows)"));
        assert!(text.contains("total_rows: 0"));
        Ok(())
    }

    #[test]
    fn zero_max_rows_suppresses_preview() -> TestResult {
        let res = QueryResult::from_batch("x", &sample_batch()?, 0)?;
        assert_eq!(
            preview_message(&res, 0).as_deref(),
            Some("(preview suppressed; use --max-rows > 0)")
        );
        Ok(())
    }
}
