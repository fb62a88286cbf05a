use chrono::{DateTime, Utc};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

pub mod time_conversion;
pub mod ui;

pub type ServiceName = String;
pub type OperationName = String;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} {value:?}: expected 1 to {max_digits} hex digits")]
pub struct ParseIdError {
    pub kind: &'static str,
    pub value: String,
    pub max_digits: usize,
}

fn parse_hex_u64(kind: &'static str, max_digits: usize, s: &str) -> Result<u64, ParseIdError> {
    let err = || ParseIdError {
        kind,
        value: s.chars().take(64).collect(),
        max_digits,
    };
    if s.is_empty() || s.len() > max_digits || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(err());
    }
    u64::from_str_radix(s, 16).map_err(|_| err())
}

/// 128 bit trace identifier, kept as two halves like the tracing clients emit it.
///
/// The text form is lower-case hex with the high half omitted when it is zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, SerializeDisplay, DeserializeFromStr,
)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.high == 0 {
            write!(f, "{:x}", self.low)
        } else {
            write!(f, "{:x}{:016x}", self.high, self.low)
        }
    }
}

impl FromStr for TraceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const KIND: &str = "trace id";
        if s.len() > 16 && s.len() <= 32 && s.is_ascii() {
            let (high, low) = s.split_at(s.len() - 16);
            let high = parse_hex_u64(KIND, 32, high).map_err(|mut e| {
                e.value = s.to_string();
                e
            })?;
            let low = parse_hex_u64(KIND, 32, low).map_err(|mut e| {
                e.value = s.to_string();
                e
            })?;
            Ok(Self { high, low })
        } else {
            let low = parse_hex_u64(KIND, 32, s)?;
            Ok(Self { high: 0, low })
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, SerializeDisplay, DeserializeFromStr,
)]
pub struct SpanId(pub u64);

impl Display for SpanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for SpanId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_u64("span id", 16, s).map(SpanId)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
}

impl Display for TagValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TagValue::String(s) => write!(f, "{s}"),
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Int64(i) => write!(f, "{i}"),
            TagValue::Float64(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: TagValue,
}

impl KeyValue {
    pub fn string<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: TagValue::String(value.into()),
        }
    }
}

/// A span event.
#[derive(Debug, Clone, PartialEq)]
pub struct Log {
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    ChildOf,
    FollowsFrom,
}

impl FromStr for RefType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "child-of" => Ok(Self::ChildOf),
            "follows-from" => Ok(Self::FollowsFrom),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanRef {
    pub ref_type: RefType,
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Process {
    pub service_name: ServiceName,
    pub tags: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub operation_name: OperationName,
    pub references: Vec<SpanRef>,
    pub flags: u32,
    pub start_time: DateTime<Utc>,
    pub duration: Duration,
    pub tags: Vec<KeyValue>,
    pub logs: Vec<Log>,
    pub process: Process,
}

impl Span {
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.references
            .iter()
            .find(|r| r.ref_type == RefType::ChildOf && r.trace_id == self.trace_id)
            .map(|r| r.span_id)
    }
}

/// Spans sharing one trace id, in the order they were found.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trace {
    pub spans: Vec<Span>,
    pub warnings: Vec<String>,
}

impl Trace {
    pub fn trace_id(&self) -> Option<TraceId> {
        self.spans.first().map(|s| s.trace_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyLink {
    pub parent: ServiceName,
    pub child: ServiceName,
    pub call_count: u64,
}

/// Structured trace search.
///
/// Every optional filter that is `None` (or an empty tag map) is left out of the query.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceQueryParameters {
    pub service_name: ServiceName,
    pub operation_name: Option<OperationName>,
    /// All of these must match. Ordered so the same search always renders the same query.
    pub tags: BTreeMap<String, String>,
    pub start_time_min: DateTime<Utc>,
    /// `None` means "up to now".
    pub start_time_max: Option<DateTime<Utc>>,
    pub duration_min: Option<Duration>,
    pub duration_max: Option<Duration>,
    /// 0 means no limit.
    pub num_traces: usize,
}

impl TraceQueryParameters {
    pub fn new<S: Into<String>>(service_name: S, start_time_min: DateTime<Utc>) -> Self {
        Self {
            service_name: service_name.into(),
            operation_name: None,
            tags: BTreeMap::new(),
            start_time_min,
            start_time_max: None,
            duration_min: None,
            duration_max: None,
            num_traces: 0,
        }
    }
}
