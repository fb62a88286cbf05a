//! Turns query results back into domain values.

use crate::error::DecodeError;
use crate::flux::{FluxResult, Row, Value};
use api_structs::{TagValue, TraceId};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

mod dependencies;
mod traces;

pub use dependencies::dependency_links_from_result;
pub use traces::{single_trace_from_result, traces_from_result, TraceAssembler};

const FIRST_COLUMN: &str = "first column";

fn first_column_str<'a>(row: &Row<'a>) -> Result<&'a str, DecodeError> {
    match row.value(0) {
        None => Err(DecodeError::MissingColumn(FIRST_COLUMN)),
        Some(Value::Null) => Err(DecodeError::MissingValue(FIRST_COLUMN)),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(DecodeError::UnexpectedColumnType {
            column: FIRST_COLUMN.to_string(),
            expected: "string",
            found: other.type_name(),
        }),
    }
}

/// First column of every row, in result order.
pub fn string_values(result: FluxResult) -> Result<Vec<String>, DecodeError> {
    let mut values = vec![];
    for table in result {
        let table = table?;
        for row in table.rows() {
            values.push(first_column_str(&row)?.to_string());
        }
    }
    Ok(values)
}

/// First column of every row parsed as a trace id. Repeated ids are kept once, first seen first.
pub fn trace_ids(result: FluxResult) -> Result<Vec<TraceId>, DecodeError> {
    let mut seen = HashSet::new();
    let mut ids = vec![];
    for table in result {
        let table = table?;
        for row in table.rows() {
            let id: TraceId = first_column_str(&row)?.parse()?;
            if seen.insert(id) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

pub(crate) fn optional_str<'a>(
    row: &Row<'a>,
    column: &'static str,
) -> Result<Option<&'a str>, DecodeError> {
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(DecodeError::UnexpectedColumnType {
            column: column.to_string(),
            expected: "string",
            found: other.type_name(),
        }),
    }
}

pub(crate) fn required_str<'a>(row: &Row<'a>, column: &'static str) -> Result<&'a str, DecodeError> {
    match row.get(column) {
        None => Err(DecodeError::MissingColumn(column)),
        Some(_) => optional_str(row, column)?.ok_or(DecodeError::MissingValue(column)),
    }
}

pub(crate) fn required_time(row: &Row<'_>, column: &'static str) -> Result<DateTime<Utc>, DecodeError> {
    match row.get(column) {
        None => Err(DecodeError::MissingColumn(column)),
        Some(Value::Null) => Err(DecodeError::MissingValue(column)),
        Some(Value::Time(time)) => Ok(*time),
        Some(other) => Err(DecodeError::UnexpectedColumnType {
            column: column.to_string(),
            expected: "dateTime",
            found: other.type_name(),
        }),
    }
}

pub(crate) fn optional_i64(row: &Row<'_>, column: &'static str) -> Result<Option<i64>, DecodeError> {
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Long(v)) | Some(Value::Duration(v)) => Ok(Some(*v)),
        Some(Value::UnsignedLong(v)) => i64::try_from(*v)
            .map(Some)
            .map_err(|_| DecodeError::ValueOutOfRange {
                column,
                value: i64::MAX,
            }),
        Some(other) => Err(DecodeError::UnexpectedColumnType {
            column: column.to_string(),
            expected: "long",
            found: other.type_name(),
        }),
    }
}

/// `None` for null cells.
pub(crate) fn tag_value(value: &Value) -> Option<TagValue> {
    let tag = match value {
        Value::Null => return None,
        Value::String(s) => TagValue::String(s.clone()),
        Value::Long(v) | Value::Duration(v) => TagValue::Int64(*v),
        Value::UnsignedLong(v) => match i64::try_from(*v) {
            Ok(v) => TagValue::Int64(v),
            Err(_) => TagValue::String(v.to_string()),
        },
        Value::Double(v) => TagValue::Float64(*v),
        Value::Boolean(v) => TagValue::Bool(*v),
        Value::Time(t) => TagValue::String(api_structs::time_conversion::to_rfc3339_nanos(*t)),
    };
    Some(tag)
}
