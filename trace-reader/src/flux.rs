//! Typed tables returned by the query service.
//!
//! A response is a sequence of tables, each with a fixed schema (ordered, typed columns) and
//! zero or more rows. Tables are read lazily from the annotated CSV body, once.

use chrono::{DateTime, Utc};
use std::io::Cursor;
use std::str::FromStr;
use thiserror::Error;

pub mod annotated_csv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    Long,
    UnsignedLong,
    Double,
    Boolean,
    DateTime,
    Duration,
    Base64Binary,
}

impl FromStr for DataType {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "long" => Ok(Self::Long),
            "unsignedLong" => Ok(Self::UnsignedLong),
            "double" => Ok(Self::Double),
            "boolean" => Ok(Self::Boolean),
            "dateTime" | "dateTime:RFC3339" | "dateTime:RFC3339Nano" => Ok(Self::DateTime),
            "duration" => Ok(Self::Duration),
            "base64Binary" => Ok(Self::Base64Binary),
            other => Err(TableError::UnsupportedDatatype(other.to_string())),
        }
    }
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Long => "long",
            DataType::UnsignedLong => "unsignedLong",
            DataType::Double => "double",
            DataType::Boolean => "boolean",
            DataType::DateTime => "dateTime",
            DataType::Duration => "duration",
            DataType::Base64Binary => "base64Binary",
        }
    }

    /// Parses one non-empty cell.
    pub fn parse(&self, column: &str, cell: &str) -> Result<Value, TableError> {
        let invalid = || TableError::InvalidValue {
            column: column.to_string(),
            value: cell.chars().take(128).collect(),
            datatype: self.as_str(),
        };
        let value = match self {
            DataType::String | DataType::Base64Binary => Value::String(cell.to_string()),
            DataType::Long => Value::Long(cell.parse().map_err(|_| invalid())?),
            DataType::UnsignedLong => Value::UnsignedLong(cell.parse().map_err(|_| invalid())?),
            DataType::Double => Value::Double(parse_double(cell).ok_or_else(invalid)?),
            DataType::Boolean => match cell {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                _ => return Err(invalid()),
            },
            DataType::DateTime => Value::Time(
                DateTime::parse_from_rfc3339(cell)
                    .map_err(|_| invalid())?
                    .with_timezone(&Utc),
            ),
            DataType::Duration => Value::Duration(parse_duration_nanos(cell).ok_or_else(invalid)?),
        };
        Ok(value)
    }
}

fn parse_double(cell: &str) -> Option<f64> {
    match cell {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => cell.parse().ok(),
    }
}

/// Flux duration literals such as `1h30m`, `-5s` or `250ms`.
fn parse_duration_nanos(cell: &str) -> Option<i64> {
    let (negative, mut rest) = match cell.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cell),
    };
    if rest.is_empty() {
        return None;
    }
    let mut total: i64 = 0;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        let magnitude: i64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit())
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let nanos_per_unit: i64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "d" => 86_400 * 1_000_000_000,
            "w" => 7 * 86_400 * 1_000_000_000,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total = total.checked_add(magnitude.checked_mul(nanos_per_unit)?)?;
    }
    Some(if negative { -total } else { total })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Long(i64),
    UnsignedLong(u64),
    Double(f64),
    Boolean(bool),
    Time(DateTime<Utc>),
    /// Nanoseconds.
    Duration(i64),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Long(_) => "long",
            Value::UnsignedLong(_) => "unsignedLong",
            Value::Double(_) => "double",
            Value::Boolean(_) => "boolean",
            Value::Time(_) => "dateTime",
            Value::Duration(_) => "duration",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    /// Part of the group key of the table.
    pub group: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FluxTable {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl FluxTable {
    pub(crate) fn new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |values| Row {
            columns: &self.columns,
            values,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [Column],
    values: &'a [Value],
}

impl<'a> Row<'a> {
    pub fn value(&self, idx: usize) -> Option<&'a Value> {
        self.values.get(idx)
    }

    /// `None` when the table has no such column, `Some(Value::Null)` for an empty cell.
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.values.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a Column, &'a Value)> {
        self.columns.iter().zip(self.values.iter())
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("malformed csv")]
    Csv(#[from] csv::Error),
    #[error("header row found before a #datatype annotation")]
    MissingDatatypeAnnotation,
    #[error("unknown annotation {0:?}")]
    UnknownAnnotation(String),
    #[error("unsupported column datatype {0:?}")]
    UnsupportedDatatype(String),
    #[error("row has {found} cells, the header has {expected}")]
    ColumnCount { expected: usize, found: usize },
    #[error("column {column:?}: cannot parse {value:?} as {datatype}")]
    InvalidValue {
        column: String,
        value: String,
        datatype: &'static str,
    },
    /// The engine reported a failure inside the response body.
    #[error("query failed: {message}")]
    QueryFailed { message: String, reference: String },
}

/// Tables of one query response. Single-pass: iterating consumes the response.
pub struct FluxResult {
    tables: annotated_csv::TableReader<Cursor<Vec<u8>>>,
}

impl std::fmt::Debug for FluxResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluxResult").finish_non_exhaustive()
    }
}

impl FluxResult {
    pub fn from_csv<B: Into<Vec<u8>>>(body: B) -> Self {
        Self {
            tables: annotated_csv::TableReader::new(Cursor::new(body.into())),
        }
    }
}

impl Iterator for FluxResult {
    type Item = Result<FluxTable, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.tables.next()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn durations_parse_with_mixed_units() {
        assert_eq!(parse_duration_nanos("1h30m"), Some(5_400_000_000_000));
        assert_eq!(parse_duration_nanos("-250ms"), Some(-250_000_000));
        assert_eq!(parse_duration_nanos("3µs"), Some(3_000));
        assert_eq!(parse_duration_nanos("10"), None);
        assert_eq!(parse_duration_nanos("1y"), None);
        assert_eq!(parse_duration_nanos(""), None);
    }

    #[test]
    fn cells_parse_by_datatype() {
        assert_eq!(DataType::Long.parse("c", "-42").unwrap(), Value::Long(-42));
        assert_eq!(
            DataType::Boolean.parse("c", "true").unwrap(),
            Value::Boolean(true)
        );
        assert!(matches!(
            DataType::Double.parse("c", "+Inf").unwrap(),
            Value::Double(v) if v.is_infinite()
        ));
        let Value::Time(t) = DataType::DateTime
            .parse("c", "2020-09-13T12:26:40.000000001Z")
            .unwrap()
        else {
            panic!("expected a time")
        };
        assert_eq!(t.timestamp_nanos_opt(), Some(1_600_000_000_000_000_001));
    }

    #[test]
    fn bad_cells_name_their_column() {
        let err = DataType::Long.parse("duration", "12x").unwrap_err();
        assert_eq!(
            err.to_string(),
            "column \"duration\": cannot parse \"12x\" as long"
        );
        assert!(matches!(
            "dateTime:RFC1123".parse::<DataType>(),
            Err(TableError::UnsupportedDatatype(_))
        ));
    }
}
