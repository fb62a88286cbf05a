use crate::flux::TableError;
use api_structs::ParseIdError;
use backtraced_error::{ReqwestError, SerdeJsonError};

/// Invalid arguments handed to a query builder.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("a trace query needs at least one trace id")]
    EmptyTraceIds,
    #[error("service name is required to search traces")]
    MissingServiceName,
    #[error("start_time_min is after start_time_max")]
    StartTimeMinGreaterThanMax,
    #[error("duration_min is greater than duration_max")]
    DurationMinGreaterThanMax,
    #[error("lookback reaches before the earliest representable time")]
    LookbackOutOfRange,
    #[error("upper time bound is the last representable time")]
    StopTimeOutOfRange,
    #[error("tag key {0:?} is a reserved column and can't be searched as a tag")]
    ReservedTagKey(String),
}

/// Failures running a query against the remote service.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("request to the query service failed")]
    Http(#[from] ReqwestError),
    #[error("api token can't be used as a header value")]
    InvalidToken,
    #[error("failed to serialize the query request")]
    Serialize(#[from] SerdeJsonError),
    #[error("query service answered {status}: {code} {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },
    #[error("query engine failed: {message} (reference {reference})")]
    Engine { message: String, reference: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed table")]
    Table(#[from] TableError),
    #[error("column {0:?} is missing")]
    MissingColumn(&'static str),
    #[error("column {0:?} is null")]
    MissingValue(&'static str),
    #[error("column {column:?} is {found}, expected {expected}")]
    UnexpectedColumnType {
        column: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("malformed identifier")]
    InvalidId(#[from] ParseIdError),
    #[error("malformed references {0:?}")]
    InvalidReference(String),
    #[error("column {column:?} value {value} is out of range")]
    ValueOutOfRange { column: &'static str, value: i64 },
    #[error("row belongs to unknown measurement {0:?}")]
    UnknownMeasurement(String),
    #[error("one trace was requested but {returned} were returned")]
    MultipleTraces { returned: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("trace not found")]
    TraceNotFound,
    #[error("invalid reader config: {0}")]
    InvalidConfig(String),
    #[error("invalid query")]
    Build(#[from] BuildError),
    #[error("query failed")]
    Query(#[from] QueryError),
    #[error("failed to decode query result")]
    Decode(DecodeError),
    #[error("request was cancelled")]
    Cancelled,
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl From<DecodeError> for ReaderError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Table(TableError::QueryFailed { message, reference }) => {
                ReaderError::Query(QueryError::Engine { message, reference })
            }
            other => ReaderError::Decode(other),
        }
    }
}
