//! Reads traces, span logs and service dependencies stored in an InfluxDB 2 bucket.
//!
//! Each lookup is rendered as Flux by [`query_builder`], run by [`executor`] and turned back
//! into domain values by [`decoder`]. [`Reader`] ties the three together.

pub mod context;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod flux;
pub mod query_builder;
pub mod reader;
pub mod schema;

pub use context::RequestContext;
pub use error::{BuildError, DecodeError, QueryError, ReaderError};
pub use executor::{InfluxQueryService, QueryExecutor, QueryService};
pub use reader::{Reader, ReaderConfig};
