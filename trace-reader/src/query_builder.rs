//! Renders read requests as Flux query text.
//!
//! Every caller supplied string ends up inside a string literal built by [`string_literal`] or
//! a column reference built by [`column_ref`], nothing is interpolated raw.

use crate::error::BuildError;
use crate::schema::{
    is_reserved_column, DURATION_KEY, FIELD_COLUMN, MEASUREMENT_COLUMN, OPERATION_NAME_KEY, REFERENCES_KEY,
    SERVICE_NAME_KEY, SPAN_ID_KEY, TRACE_ID_KEY, VALUE_COLUMN,
};
use api_structs::time_conversion::{duration_to_nanos_i64, to_rfc3339_nanos};
use api_structs::{TraceId, TraceQueryParameters};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

mod pipeline;

pub use pipeline::{Literal, Operator, Pipeline, Predicate};

const FLUX_KEYWORDS: [&str; 15] = [
    "and", "builtin", "else", "empty", "exists", "if", "import", "in", "not", "option", "or",
    "package", "return", "testcase", "then",
];

/// Quoted Flux string literal.
pub fn string_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            '\0' => escaped.push_str("\\x00"),
            // string interpolation
            '$' if chars.peek() == Some(&'{') => escaped.push_str("\\$"),
            c => escaped.push(c),
        }
    }
    escaped.push('"');
    escaped
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !FLUX_KEYWORDS.contains(&name)
}

/// `r.name` when `name` is a plain identifier, `r["name"]` otherwise.
pub fn column_ref(name: &str) -> String {
    if is_identifier(name) {
        format!("r.{name}")
    } else {
        format!("r[{}]", string_literal(name))
    }
}

pub fn time_literal(time: DateTime<Utc>) -> String {
    to_rfc3339_nanos(time)
}

const V1_IMPORT: &str = "import \"influxdata/influxdb/v1\"";

/// Distinct values of `tag_key` within `measurement`.
pub fn build_service_list_query(bucket: &str, measurement: &str, tag_key: &str) -> String {
    format!(
        "{V1_IMPORT}\n\nv1.measurementTagValues(bucket: {}, measurement: {}, tag: {})",
        string_literal(bucket),
        string_literal(measurement),
        string_literal(tag_key)
    )
}

/// Distinct values of `tag_key` on rows of `measurement` whose `service_filter_key` is `service_name`.
pub fn build_operation_list_query(
    bucket: &str,
    measurement: &str,
    tag_key: &str,
    service_filter_key: &str,
    service_name: &str,
) -> String {
    let predicate = Predicate::And(vec![
        Predicate::eq(MEASUREMENT_COLUMN, measurement),
        Predicate::eq(service_filter_key, service_name),
    ]);
    format!(
        "{V1_IMPORT}\n\nv1.tagValues(bucket: {}, tag: {}, predicate: (r) => {predicate})",
        string_literal(bucket),
        string_literal(tag_key)
    )
}

/// Selects spans and logs of a set of traces within a time window.
#[derive(Debug, Clone)]
pub struct TraceQuery<'a> {
    bucket: &'a str,
    span_measurement: &'a str,
    log_measurement: &'a str,
    start_time_min: DateTime<Utc>,
    start_time_max: Option<DateTime<Utc>>,
}

impl<'a> TraceQuery<'a> {
    pub fn new(
        bucket: &'a str,
        span_measurement: &'a str,
        log_measurement: &'a str,
        start_time_min: DateTime<Utc>,
    ) -> Self {
        Self {
            bucket,
            span_measurement,
            log_measurement,
            start_time_min,
            start_time_max: None,
        }
    }

    pub fn start_time_max(mut self, start_time_max: DateTime<Utc>) -> Self {
        self.start_time_max = Some(start_time_max);
        self
    }

    /// Repeated ids are matched once.
    pub fn build_trace_query(&self, trace_ids: &[TraceId]) -> Result<String, BuildError> {
        if trace_ids.is_empty() {
            return Err(BuildError::EmptyTraceIds);
        }
        if matches!(self.start_time_max, Some(max) if max < self.start_time_min) {
            return Err(BuildError::StartTimeMinGreaterThanMax);
        }
        let mut seen = HashSet::with_capacity(trace_ids.len());
        let trace_predicates: Vec<Predicate> = trace_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .map(|id| Predicate::eq(TRACE_ID_KEY, id.to_string()))
            .collect();
        let predicate = Predicate::And(vec![
            Predicate::Or(vec![
                Predicate::eq(MEASUREMENT_COLUMN, self.span_measurement),
                Predicate::eq(MEASUREMENT_COLUMN, self.log_measurement),
            ]),
            Predicate::Or(trace_predicates),
        ]);
        Ok(Pipeline::from_bucket(self.bucket)
            .range(self.start_time_min, self.start_time_max)?
            .filter(&predicate)
            .pivot_fields()
            .build())
    }
}

/// Ids of the traces having a span matching every filter in `params`.
pub fn build_trace_id_query(
    bucket: &str,
    span_measurement: &str,
    params: &TraceQueryParameters,
) -> Result<String, BuildError> {
    if params.service_name.trim().is_empty() {
        return Err(BuildError::MissingServiceName);
    }
    if matches!(params.start_time_max, Some(max) if max < params.start_time_min) {
        return Err(BuildError::StartTimeMinGreaterThanMax);
    }
    if let (Some(min), Some(max)) = (params.duration_min, params.duration_max) {
        if min > max {
            return Err(BuildError::DurationMinGreaterThanMax);
        }
    }
    if let Some(key) = params.tags.keys().find(|key| is_reserved_column(key)) {
        return Err(BuildError::ReservedTagKey(key.clone()));
    }

    let mut terms = vec![
        Predicate::eq(MEASUREMENT_COLUMN, span_measurement),
        Predicate::eq(FIELD_COLUMN, DURATION_KEY),
        Predicate::eq(SERVICE_NAME_KEY, params.service_name.as_str()),
    ];
    if let Some(operation_name) = &params.operation_name {
        terms.push(Predicate::eq(OPERATION_NAME_KEY, operation_name.as_str()));
    }
    for (key, value) in &params.tags {
        terms.push(Predicate::eq(key.as_str(), value.as_str()));
    }
    if let Some(min) = params.duration_min {
        terms.push(Predicate::int(
            VALUE_COLUMN,
            Operator::Ge,
            duration_to_nanos_i64(min),
        ));
    }
    if let Some(max) = params.duration_max {
        terms.push(Predicate::int(
            VALUE_COLUMN,
            Operator::Le,
            duration_to_nanos_i64(max),
        ));
    }

    let mut pipeline = Pipeline::from_bucket(bucket)
        .range(params.start_time_min, params.start_time_max)?
        .filter(&Predicate::And(terms))
        .ungroup()
        .keep(&[TRACE_ID_KEY])
        .distinct(TRACE_ID_KEY);
    if params.num_traces > 0 {
        pipeline = pipeline.limit(params.num_traces);
    }
    Ok(pipeline.build())
}

/// One ungrouped table of `span_id`, `references` and `service_name` per span in the window.
pub fn build_dependency_query(
    bucket: &str,
    measurement: &str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
) -> Result<String, BuildError> {
    let predicate = Predicate::And(vec![
        Predicate::eq(MEASUREMENT_COLUMN, measurement),
        Predicate::Or(vec![
            Predicate::eq(FIELD_COLUMN, SPAN_ID_KEY),
            Predicate::eq(FIELD_COLUMN, REFERENCES_KEY),
        ]),
    ]);
    Ok(Pipeline::from_bucket(bucket)
        .range(start, Some(stop))?
        .filter(&predicate)
        .pivot_fields()
        .ungroup()
        .keep(&[SPAN_ID_KEY, REFERENCES_KEY, SERVICE_NAME_KEY])
        .build())
}
