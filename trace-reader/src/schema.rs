//! Names of the tags and fields spans and logs are stored under.

use api_structs::{RefType, SpanRef};

pub const DEFAULT_SPAN_MEASUREMENT: &str = "span";
pub const DEFAULT_LOG_MEASUREMENT: &str = "log";

pub const TRACE_ID_KEY: &str = "trace_id";
pub const SPAN_ID_KEY: &str = "span_id";
pub const SERVICE_NAME_KEY: &str = "service_name";
pub const OPERATION_NAME_KEY: &str = "operation_name";
pub const DURATION_KEY: &str = "duration";
pub const FLAGS_KEY: &str = "flags";
pub const REFERENCES_KEY: &str = "references";

pub const MEASUREMENT_COLUMN: &str = "_measurement";
pub const FIELD_COLUMN: &str = "_field";
pub const VALUE_COLUMN: &str = "_value";
pub const TIME_COLUMN: &str = "_time";
pub const START_COLUMN: &str = "_start";
pub const STOP_COLUMN: &str = "_stop";

const RESERVED_COLUMNS: [&str; 15] = [
    "result",
    "table",
    START_COLUMN,
    STOP_COLUMN,
    TIME_COLUMN,
    MEASUREMENT_COLUMN,
    FIELD_COLUMN,
    VALUE_COLUMN,
    TRACE_ID_KEY,
    SPAN_ID_KEY,
    SERVICE_NAME_KEY,
    OPERATION_NAME_KEY,
    DURATION_KEY,
    FLAGS_KEY,
    REFERENCES_KEY,
];

/// Columns that never become span tags or log fields.
pub fn is_reserved_column(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
}

/// Parses `<ref-type>:<trace-id>:<span-id>` entries separated by commas.
/// An empty string means no references.
pub fn parse_references(encoded: &str) -> Option<Vec<SpanRef>> {
    encoded
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let ref_type: RefType = parts.next()?.parse().ok()?;
            let trace_id = parts.next()?.parse().ok()?;
            let span_id = parts.next()?.parse().ok()?;
            Some(SpanRef {
                ref_type,
                trace_id,
                span_id,
            })
        })
        .collect()
}
