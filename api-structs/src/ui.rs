//! JSON shapes served by the query API, laid out the way the Jaeger UI reads them.
//! Times and durations are unix microseconds.

use crate::time_conversion::{duration_to_micros, time_to_unix_micros};
use crate::{RefType, TagValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse<T> {
    pub data: T,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub errors: Vec<ApiResponseError>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T, total: usize) -> Self {
        Self {
            data,
            total,
            limit: 0,
            offset: 0,
            errors: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponseError {
    pub code: u16,
    pub msg: String,
    #[serde(rename = "traceID", skip_serializing_if = "Option::is_none", default)]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    pub spans: Vec<Span>,
    pub processes: BTreeMap<String, Process>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
    pub flags: u32,
    pub operation_name: String,
    pub references: Vec<Reference>,
    pub start_time: u64,
    pub duration: u64,
    pub tags: Vec<KeyValue>,
    pub logs: Vec<Log>,
    #[serde(rename = "processID")]
    pub process_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub ref_type: String,
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub service_name: String,
    pub tags: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Log {
    pub timestamp: u64,
    pub fields: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyValue {
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyLink {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
}

impl From<&crate::KeyValue> for KeyValue {
    fn from(kv: &crate::KeyValue) -> Self {
        let (value_type, value) = match &kv.value {
            TagValue::String(s) => ("string", Value::String(s.clone())),
            TagValue::Bool(b) => ("bool", Value::Bool(*b)),
            TagValue::Int64(i) => ("int64", Value::Int64(*i)),
            TagValue::Float64(f) => ("float64", Value::Float64(*f)),
        };
        Self {
            key: kv.key.clone(),
            value_type: value_type.to_string(),
            value,
        }
    }
}

impl From<&crate::DependencyLink> for DependencyLink {
    fn from(link: &crate::DependencyLink) -> Self {
        Self {
            parent: link.parent.clone(),
            child: link.child.clone(),
            call_count: link.call_count,
        }
    }
}

fn ref_type_name(ref_type: RefType) -> &'static str {
    match ref_type {
        RefType::ChildOf => "CHILD_OF",
        RefType::FollowsFrom => "FOLLOWS_FROM",
    }
}

impl From<&crate::Trace> for Trace {
    /// Identical processes are shared between spans under ids `p1`, `p2`, ... in order of first use.
    fn from(trace: &crate::Trace) -> Self {
        let mut known_processes: Vec<&crate::Process> = vec![];
        let mut processes = BTreeMap::new();
        let mut spans = Vec::with_capacity(trace.spans.len());
        for span in &trace.spans {
            let process_idx = match known_processes.iter().position(|p| **p == span.process) {
                Some(idx) => idx,
                None => {
                    known_processes.push(&span.process);
                    let idx = known_processes.len() - 1;
                    processes.insert(
                        format!("p{}", idx + 1),
                        Process {
                            service_name: span.process.service_name.clone(),
                            tags: span.process.tags.iter().map(KeyValue::from).collect(),
                        },
                    );
                    idx
                }
            };
            spans.push(Span {
                trace_id: span.trace_id.to_string(),
                span_id: span.span_id.to_string(),
                flags: span.flags,
                operation_name: span.operation_name.clone(),
                references: span
                    .references
                    .iter()
                    .map(|r| Reference {
                        ref_type: ref_type_name(r.ref_type).to_string(),
                        trace_id: r.trace_id.to_string(),
                        span_id: r.span_id.to_string(),
                    })
                    .collect(),
                start_time: time_to_unix_micros(span.start_time),
                duration: duration_to_micros(span.duration),
                tags: span.tags.iter().map(KeyValue::from).collect(),
                logs: span
                    .logs
                    .iter()
                    .map(|l| Log {
                        timestamp: time_to_unix_micros(l.timestamp),
                        fields: l.fields.iter().map(KeyValue::from).collect(),
                    })
                    .collect(),
                process_id: format!("p{}", process_idx + 1),
            });
        }
        Self {
            trace_id: trace
                .trace_id()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            spans,
            processes,
            warnings: trace.warnings.clone(),
        }
    }
}
