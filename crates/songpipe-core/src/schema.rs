//! Row schema registry.
//!
//! The song table has one fixed, ordered schema (see [`describe`]). It is
//! recorded in the table log when the table is created and compared on every
//! open.
//!
//! Rule: **no schema evolution**. An existing table must carry exactly the
//! schema the loader expects:
//! - same column set, in the same order
//! - same logical data type per column
//! - same `nullable` flag.

use std::{collections::HashSet, fmt, sync::Arc};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Logical data types a song column can hold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LogicalDataType {
    /// UTF-8 encoded string.
    Utf8,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit floating point.
    Float64,
}

impl LogicalDataType {
    /// Arrow representation of this type.
    pub fn to_arrow(self) -> DataType {
        match self {
            LogicalDataType::Utf8 => DataType::Utf8,
            LogicalDataType::Int64 => DataType::Int64,
            LogicalDataType::Float64 => DataType::Float64,
        }
    }

    /// True for the integer and floating point types.
    pub fn is_numeric(self) -> bool {
        matches!(self, LogicalDataType::Int64 | LogicalDataType::Float64)
    }
}

impl fmt::Display for LogicalDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalDataType::Utf8 => write!(f, "string"),
            LogicalDataType::Int64 => write!(f, "long"),
            LogicalDataType::Float64 => write!(f, "double"),
        }
    }
}

/// Logical column definition in a schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogicalField {
    /// Column name as stored in the schema.
    pub name: String,
    /// Logical data type for the column.
    pub data_type: LogicalDataType,
    /// Whether the column allows null values.
    pub nullable: bool,
}

impl LogicalField {
    fn nullable(name: &str, data_type: LogicalDataType) -> Self {
        LogicalField {
            name: name.to_string(),
            data_type,
            nullable: true,
        }
    }

    fn to_arrow_field(&self) -> Field {
        Field::new(self.name.clone(), self.data_type.to_arrow(), self.nullable)
    }
}

impl fmt::Display for LogicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{}?: {}", self.name, self.data_type)
        } else {
            write!(f, "{}: {}", self.name, self.data_type)
        }
    }
}

/// Errors raised when building or comparing row schemas.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
pub enum SchemaError {
    /// Duplicate column names are not allowed.
    #[snafu(display("Duplicate column name: {column}"))]
    DuplicateColumn {
        /// The duplicate column name.
        column: String,
    },

    /// The existing table is missing a column the loader expects.
    #[snafu(display("Table schema is missing required column {column}"))]
    MissingColumn {
        /// The name of the missing column.
        column: String,
    },

    /// The existing table has a column the loader does not expect.
    #[snafu(display("Table schema has extra column {column}"))]
    ExtraColumn {
        /// The name of the extra column.
        column: String,
    },

    /// Column exists in both schemas, but type, nullability or position differ.
    #[snafu(display(
        "Schema mismatch for column {column}: table has {table_field}, expected {expected_field}"
    ))]
    TypeMismatch {
        /// The name of the mismatched column.
        column: String,
        /// The field as recorded in the table.
        table_field: String,
        /// The field the caller expected.
        expected_field: String,
    },
}

/// Ordered, validated list of logical fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowSchema {
    columns: Vec<LogicalField>,
}

impl RowSchema {
    /// Construct a validated schema (rejects duplicate column names).
    pub fn new(columns: Vec<LogicalField>) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for col in &columns {
            if !seen.insert(col.name.as_str()) {
                return DuplicateColumnSnafu {
                    column: col.name.clone(),
                }
                .fail();
            }
        }
        Ok(RowSchema { columns })
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[LogicalField] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True if the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Look up a column by name.
    pub fn field(&self, name: &str) -> Option<&LogicalField> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Convert to an owned Arrow [`Schema`].
    pub fn to_arrow_schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(LogicalField::to_arrow_field)
                .collect::<Vec<_>>(),
        )
    }

    /// Convert to a shared Arrow [`SchemaRef`].
    pub fn to_arrow_schema_ref(&self) -> SchemaRef {
        Arc::new(self.to_arrow_schema())
    }
}

impl fmt::Display for RowSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{col}")?;
        }
        write!(f, ")")
    }
}

/// Column names of the song table, in file order.
pub const SONG_COLUMNS: [(&str, LogicalDataType); 20] = [
    ("artist_id", LogicalDataType::Utf8),
    ("artist_lat", LogicalDataType::Float64),
    ("artist_long", LogicalDataType::Float64),
    ("artist_location", LogicalDataType::Utf8),
    ("artist_name", LogicalDataType::Utf8),
    ("duration", LogicalDataType::Float64),
    ("end_of_fade_in", LogicalDataType::Float64),
    ("key", LogicalDataType::Int64),
    ("key_confidence", LogicalDataType::Float64),
    ("loudness", LogicalDataType::Float64),
    ("release", LogicalDataType::Utf8),
    ("song_hotnes", LogicalDataType::Float64),
    ("song_id", LogicalDataType::Utf8),
    ("start_of_fade_out", LogicalDataType::Float64),
    ("tempo", LogicalDataType::Float64),
    ("time_signature", LogicalDataType::Float64),
    ("time_signature_confidence", LogicalDataType::Float64),
    ("title", LogicalDataType::Utf8),
    ("year", LogicalDataType::Int64),
    ("partial_sequence", LogicalDataType::Int64),
];

/// The song row schema: 20 nullable columns in file order.
pub fn describe() -> RowSchema {
    RowSchema {
        columns: SONG_COLUMNS
            .iter()
            .map(|(name, dt)| LogicalField::nullable(name, *dt))
            .collect(),
    }
}

/// Enforce the "no schema evolution" rule between a stored table schema and
/// the schema a caller expects.
///
/// Reports the first difference found, walking the expected columns first.
pub fn ensure_schema_exact_match(
    table_schema: &RowSchema,
    expected: &RowSchema,
) -> Result<(), SchemaError> {
    for (pos, ecol) in expected.columns().iter().enumerate() {
        let Some(tpos) = table_schema.index_of(&ecol.name) else {
            return MissingColumnSnafu {
                column: ecol.name.clone(),
            }
            .fail();
        };
        let tcol = &table_schema.columns()[tpos];
        if tpos != pos || tcol.data_type != ecol.data_type || tcol.nullable != ecol.nullable {
            return TypeMismatchSnafu {
                column: ecol.name.clone(),
                table_field: format!("{tcol} at position {tpos}"),
                expected_field: format!("{ecol} at position {pos}"),
            }
            .fail();
        }
    }

    if let Some(extra) = table_schema
        .columns()
        .iter()
        .find(|c| expected.field(&c.name).is_none())
    {
        return ExtraColumnSnafu {
            column: extra.name.clone(),
        }
        .fail();
    }

    Ok(())
}
