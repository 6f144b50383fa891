//! Arrow kernels behind view evaluation.

use std::{collections::HashMap, sync::Arc};

use arrow::{
    array::{
        Array, ArrayRef, BooleanArray, Float64Array, Int64Array, Scalar, StringArray, UInt64Array,
    },
    compute::{
        SortColumn, SortOptions, and_kleene, cast, filter_record_batch,
        kernels::cmp::{eq, gt, gt_eq, lt_eq},
        lexsort_to_indices, take,
    },
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
    row::{RowConverter, SortField},
};
use snafu::prelude::*;

use super::{
    AggregateDef, ArrowSnafu, IncomparableLiteralSnafu, Literal, Predicate, UnknownColumnSnafu,
    ViewDef, ViewError,
};

fn column<'a>(view: &str, batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef, ViewError> {
    batch.column_by_name(name).context(UnknownColumnSnafu {
        view: view.to_string(),
        column: name.to_string(),
    })
}

/// Column and literal brought to a common type: integers widen to floats
/// when either side is floating point.
fn coerce(
    column_name: &str,
    values: &ArrayRef,
    literal: &Literal,
) -> Result<(ArrayRef, Scalar<ArrayRef>), ViewError> {
    let incomparable = || {
        IncomparableLiteralSnafu {
            column: column_name.to_string(),
            data_type: values.data_type().to_string(),
            literal: literal.to_string(),
        }
        .build()
    };

    let scalar = |array: ArrayRef| Scalar::new(array);

    match (values.data_type(), literal) {
        (DataType::Int64, Literal::Int(v)) => Ok((
            Arc::clone(values),
            scalar(Arc::new(Int64Array::from(vec![*v]))),
        )),
        (DataType::Int64, Literal::Float(v)) => Ok((
            cast(values, &DataType::Float64).context(ArrowSnafu)?,
            scalar(Arc::new(Float64Array::from(vec![*v]))),
        )),
        (DataType::Float64, Literal::Int(v)) => Ok((
            Arc::clone(values),
            scalar(Arc::new(Float64Array::from(vec![*v as f64]))),
        )),
        (DataType::Float64, Literal::Float(v)) => Ok((
            Arc::clone(values),
            scalar(Arc::new(Float64Array::from(vec![*v]))),
        )),
        (DataType::Utf8, Literal::Str(s)) => Ok((
            Arc::clone(values),
            scalar(Arc::new(StringArray::from(vec![s.as_str()]))),
        )),
        _ => Err(incomparable()),
    }
}

fn predicate_mask(
    view: &str,
    batch: &RecordBatch,
    predicate: &Predicate,
) -> Result<BooleanArray, ViewError> {
    match predicate {
        Predicate::Gt { column: name, value } => {
            let (values, lit) = coerce(name, column(view, batch, name)?, value)?;
            gt(&values, &lit).context(ArrowSnafu)
        }
        Predicate::Eq { column: name, value } => {
            let (values, lit) = coerce(name, column(view, batch, name)?, value)?;
            eq(&values, &lit).context(ArrowSnafu)
        }
        Predicate::Between {
            column: name,
            low,
            high,
        } => {
            let raw = column(view, batch, name)?;
            let (lo_values, lo) = coerce(name, raw, low)?;
            let (hi_values, hi) = coerce(name, raw, high)?;
            let above = gt_eq(&lo_values, &lo).context(ArrowSnafu)?;
            let below = lt_eq(&hi_values, &hi).context(ArrowSnafu)?;
            and_kleene(&above, &below).context(ArrowSnafu)
        }
        Predicate::And(parts) => {
            let mut mask = BooleanArray::from(vec![true; batch.num_rows()]);
            for part in parts {
                let next = predicate_mask(view, batch, part)?;
                mask = and_kleene(&mask, &next).context(ArrowSnafu)?;
            }
            Ok(mask)
        }
    }
}

fn project(view: &str, batch: &RecordBatch, columns: &[String]) -> Result<RecordBatch, ViewError> {
    let schema = batch.schema();
    let indices = columns
        .iter()
        .map(|name| {
            schema.index_of(name).ok().context(UnknownColumnSnafu {
                view: view.to_string(),
                column: name.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    batch.project(&indices).context(ArrowSnafu)
}

pub(super) fn evaluate_view(view: &ViewDef, batch: &RecordBatch) -> Result<RecordBatch, ViewError> {
    let filtered = match &view.filter {
        Some(predicate) => {
            let mask = predicate_mask(&view.name, batch, predicate)?;
            filter_record_batch(batch, &mask).context(ArrowSnafu)?
        }
        None => batch.clone(),
    };
    project(&view.name, &filtered, &view.projection)
}

struct Group {
    first_row: u64,
    count: i64,
}

pub(super) fn evaluate_aggregate(
    agg: &AggregateDef,
    input: &RecordBatch,
) -> Result<RecordBatch, ViewError> {
    let keys = agg
        .group_by
        .iter()
        .map(|name| column(&agg.name, input, name).cloned())
        .collect::<Result<Vec<_>, _>>()?;
    let counted = column(&agg.name, input, &agg.count_column)?;

    let converter = RowConverter::new(
        keys.iter()
            .map(|k| SortField::new(k.data_type().clone()))
            .collect(),
    )
    .context(ArrowSnafu)?;
    let rows = converter.convert_columns(&keys).context(ArrowSnafu)?;

    // Groups in first-seen order.
    let mut slots = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for i in 0..input.num_rows() {
        let slot = *slots.entry(rows.row(i).owned()).or_insert_with(|| {
            groups.push(Group {
                first_row: i as u64,
                count: 0,
            });
            groups.len() - 1
        });
        if counted.is_valid(i) {
            groups[slot].count += 1;
        }
    }

    let firsts = UInt64Array::from(groups.iter().map(|g| g.first_row).collect::<Vec<_>>());
    let counts: ArrayRef = Arc::new(Int64Array::from(
        groups.iter().map(|g| g.count).collect::<Vec<_>>(),
    ));

    let mut fields = Vec::with_capacity(agg.select.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(agg.select.len());
    for name in &agg.select {
        if *name == agg.count_alias {
            fields.push(Field::new(name, DataType::Int64, false));
            arrays.push(Arc::clone(&counts));
            continue;
        }
        ensure!(
            agg.group_by.contains(name),
            UnknownColumnSnafu {
                view: agg.name.clone(),
                column: name.clone(),
            }
        );
        let values = column(&agg.name, input, name)?;
        fields.push(Field::new(name, values.data_type().clone(), true));
        arrays.push(take(values.as_ref(), &firsts, None).context(ArrowSnafu)?);
    }
    let schema = Arc::new(Schema::new(fields));
    let grouped = RecordBatch::try_new(schema, arrays).context(ArrowSnafu)?;

    sort_and_limit(agg, grouped)
}

fn sort_and_limit(agg: &AggregateDef, batch: RecordBatch) -> Result<RecordBatch, ViewError> {
    if agg.order_by.is_empty() {
        return Ok(match agg.limit {
            Some(limit) if batch.num_rows() > limit => batch.slice(0, limit),
            _ => batch,
        });
    }

    let sort_columns = agg
        .order_by
        .iter()
        .map(|key| {
            Ok(SortColumn {
                values: Arc::clone(column(&agg.name, &batch, &key.column)?),
                options: Some(SortOptions {
                    descending: key.descending,
                    nulls_first: false,
                }),
            })
        })
        .collect::<Result<Vec<_>, ViewError>>()?;

    let indices = lexsort_to_indices(&sort_columns, agg.limit).context(ArrowSnafu)?;
    let columns = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &indices, None))
        .collect::<Result<Vec<_>, _>>()
        .context(ArrowSnafu)?;
    RecordBatch::try_new(batch.schema(), columns).context(ArrowSnafu)
}
