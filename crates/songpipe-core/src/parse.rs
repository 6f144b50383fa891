//! Permissive tab-separated parsing into Arrow record batches.
//!
//! Input files have no header and one record per line. Fields are separated
//! by `\t`; quotes carry no meaning. Parsing never fails on bad data:
//! - missing trailing fields become null, extra fields are dropped
//! - empty fields become null
//! - numeric fields that do not parse become null
//! - invalid UTF-8 is replaced lossily
//!
//! Every such repair is counted in [`ParseStats`].

use std::{ops::AddAssign, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, StringArray},
    compute::{CastOptions, cast_with_options},
    error::ArrowError,
    record_batch::RecordBatch,
};
use snafu::prelude::*;

use crate::schema::RowSchema;

/// Field delimiter of the input files.
pub const FIELD_DELIMITER: u8 = b'\t';

/// Fatal errors while turning a file into a batch.
///
/// Bad field values are not errors; they are counted in [`ParseStats`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ParseError {
    /// The tokenizer could not read a record.
    #[snafu(display("Failed to tokenize record in {source_name}: {source}"))]
    Tokenize {
        /// File the record came from.
        source_name: String,
        /// Underlying tokenizer error.
        source: csv::Error,
    },

    /// Arrow rejected the assembled columns.
    #[snafu(display("Failed to build record batch for {source_name}: {source}"))]
    Assemble {
        /// File the batch was built from.
        source_name: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

/// Counters describing what parsing had to repair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Rows produced.
    pub rows: u64,
    /// Non-empty numeric fields that failed to parse and became null.
    pub coerced_nulls: u64,
    /// Records whose field count differed from the schema.
    pub malformed_records: u64,
}

impl AddAssign for ParseStats {
    fn add_assign(&mut self, rhs: Self) {
        self.rows += rhs.rows;
        self.coerced_nulls += rhs.coerced_nulls;
        self.malformed_records += rhs.malformed_records;
    }
}

/// Result of parsing one file.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    /// All rows of the file, in file order.
    pub batch: RecordBatch,
    /// What had to be repaired along the way.
    pub stats: ParseStats,
}

/// Parse `bytes` as tab-separated rows matching `schema`.
///
/// `source_name` is only used for diagnostics.
pub fn parse_tsv(
    bytes: &[u8],
    schema: &RowSchema,
    source_name: &str,
) -> Result<ParsedFile, ParseError> {
    let width = schema.len();
    let mut columns: Vec<Vec<Option<String>>> = vec![Vec::new(); width];
    let mut stats = ParseStats::default();

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(FIELD_DELIMITER)
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(bytes);

    for (line_idx, record) in reader.byte_records().enumerate() {
        let record = record.context(TokenizeSnafu { source_name })?;

        if record.len() != width {
            stats.malformed_records += 1;
            log::warn!(
                "{source_name}: record {} has {} fields, expected {width}",
                line_idx + 1,
                record.len()
            );
        }

        for (i, column) in columns.iter_mut().enumerate() {
            let value = record
                .get(i)
                .filter(|raw| !raw.is_empty())
                .map(|raw| String::from_utf8_lossy(raw).into_owned());
            column.push(value);
        }
        stats.rows += 1;
    }

    let cast_options = CastOptions {
        safe: true,
        ..Default::default()
    };

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(width);
    for (field, values) in schema.columns().iter().zip(columns) {
        let strings = StringArray::from(values);
        if !field.data_type.is_numeric() {
            arrays.push(Arc::new(strings));
            continue;
        }

        let typed = cast_with_options(&strings, &field.data_type.to_arrow(), &cast_options)
            .context(AssembleSnafu { source_name })?;
        let coerced = typed.null_count().saturating_sub(strings.null_count()) as u64;
        if coerced > 0 {
            log::debug!(
                "{source_name}: {coerced} value(s) in column {} could not be read as {}",
                field.name,
                field.data_type
            );
        }
        stats.coerced_nulls += coerced;
        arrays.push(typed);
    }

    let batch = RecordBatch::try_new(schema.to_arrow_schema_ref(), arrays)
        .context(AssembleSnafu { source_name })?;

    Ok(ParsedFile { batch, stats })
}
