//! Read side of the trace storage: every lookup is one or two Flux queries.

use crate::context::RequestContext;
use crate::decoder::{
    dependency_links_from_result, single_trace_from_result, string_values, trace_ids,
    traces_from_result,
};
use crate::error::{BuildError, ReaderError};
use crate::executor::QueryExecutor;
use crate::query_builder::{
    build_dependency_query, build_operation_list_query, build_service_list_query,
    build_trace_id_query, TraceQuery,
};
use crate::schema::{
    DEFAULT_LOG_MEASUREMENT, DEFAULT_SPAN_MEASUREMENT, OPERATION_NAME_KEY, SERVICE_NAME_KEY,
};
use api_structs::{DependencyLink, Trace, TraceId, TraceQueryParameters};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, instrument};

pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    pub bucket: String,
    pub span_measurement: String,
    pub log_measurement: String,
    /// How far back a lookup by trace id searches.
    pub default_lookback: Duration,
}

impl ReaderConfig {
    pub fn new<S: Into<String>>(bucket: S) -> Self {
        Self {
            bucket: bucket.into(),
            span_measurement: DEFAULT_SPAN_MEASUREMENT.to_string(),
            log_measurement: DEFAULT_LOG_MEASUREMENT.to_string(),
            default_lookback: DEFAULT_LOOKBACK,
        }
    }

    fn validate(&self) -> Result<(), ReaderError> {
        for (name, value) in [
            ("bucket", &self.bucket),
            ("span measurement", &self.span_measurement),
            ("log measurement", &self.log_measurement),
        ] {
            if value.trim().is_empty() {
                return Err(ReaderError::InvalidConfig(format!("{name} can't be empty")));
            }
        }
        if self.span_measurement == self.log_measurement {
            return Err(ReaderError::InvalidConfig(format!(
                "spans and logs can't share the measurement {:?}",
                self.span_measurement
            )));
        }
        Ok(())
    }
}

fn lookback_start(end: DateTime<Utc>, lookback: Duration) -> Result<DateTime<Utc>, BuildError> {
    chrono::Duration::from_std(lookback)
        .ok()
        .and_then(|lookback| end.checked_sub_signed(lookback))
        .ok_or(BuildError::LookbackOutOfRange)
}

/// Holds no per request state, share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Reader {
    executor: QueryExecutor,
    config: ReaderConfig,
}

impl Reader {
    pub fn new(executor: QueryExecutor, config: ReaderConfig) -> Result<Self, ReaderError> {
        config.validate()?;
        Ok(Self { executor, config })
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    #[instrument(skip_all)]
    pub async fn get_services(&self, ctx: &RequestContext) -> Result<Vec<String>, ReaderError> {
        let query = build_service_list_query(
            &self.config.bucket,
            &self.config.span_measurement,
            SERVICE_NAME_KEY,
        );
        let result = self.executor.execute(ctx, &query).await?;
        ctx.check()?;
        let services = string_values(result)?;
        info!(count = services.len(), "Listed services");
        Ok(services)
    }

    #[instrument(skip_all, fields(%service))]
    pub async fn get_operations(
        &self,
        ctx: &RequestContext,
        service: &str,
    ) -> Result<Vec<String>, ReaderError> {
        let query = build_operation_list_query(
            &self.config.bucket,
            &self.config.span_measurement,
            OPERATION_NAME_KEY,
            SERVICE_NAME_KEY,
            service,
        );
        let result = self.executor.execute(ctx, &query).await?;
        ctx.check()?;
        let operations = string_values(result)?;
        info!(count = operations.len(), "Listed operations");
        Ok(operations)
    }

    /// Searches the last `default_lookback`.
    #[instrument(skip_all, fields(%trace_id))]
    pub async fn get_trace(
        &self,
        ctx: &RequestContext,
        trace_id: TraceId,
    ) -> Result<Trace, ReaderError> {
        let start = lookback_start(Utc::now(), self.config.default_lookback)?;
        let query = self
            .trace_query(start)
            .build_trace_query(&[trace_id])?;
        let result = self.executor.execute(ctx, &query).await?;
        ctx.check()?;
        let trace = single_trace_from_result(
            result,
            &self.config.span_measurement,
            &self.config.log_measurement,
        )?
        .ok_or(ReaderError::TraceNotFound)?;
        info!(spans = trace.spans.len(), "Found trace");
        Ok(trace)
    }

    #[instrument(skip_all, fields(service = %params.service_name))]
    pub async fn find_trace_ids(
        &self,
        ctx: &RequestContext,
        params: &TraceQueryParameters,
    ) -> Result<Vec<TraceId>, ReaderError> {
        let query = build_trace_id_query(
            &self.config.bucket,
            &self.config.span_measurement,
            params,
        )?;
        let result = self.executor.execute(ctx, &query).await?;
        ctx.check()?;
        let ids = trace_ids(result)?;
        info!(count = ids.len(), "Found trace ids");
        Ok(ids)
    }

    /// Finds the matching ids first, then loads those traces within the same time bounds.
    #[instrument(skip_all, fields(service = %params.service_name))]
    pub async fn find_traces(
        &self,
        ctx: &RequestContext,
        params: &TraceQueryParameters,
    ) -> Result<Vec<Trace>, ReaderError> {
        let ids = self.find_trace_ids(ctx, params).await?;
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut trace_query = self.trace_query(params.start_time_min);
        if let Some(start_time_max) = params.start_time_max {
            trace_query = trace_query.start_time_max(start_time_max);
        }
        let query = trace_query.build_trace_query(&ids)?;
        let result = self.executor.execute(ctx, &query).await?;
        ctx.check()?;
        let traces = traces_from_result(
            result,
            &self.config.span_measurement,
            &self.config.log_measurement,
        )?;
        info!(count = traces.len(), "Found traces");
        Ok(traces)
    }

    /// Links between services seen in `[end_ts - lookback, end_ts]`.
    #[instrument(skip_all, fields(%end_ts, ?lookback))]
    pub async fn get_dependencies(
        &self,
        ctx: &RequestContext,
        end_ts: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<DependencyLink>, ReaderError> {
        let start = lookback_start(end_ts, lookback)?;
        let query = build_dependency_query(
            &self.config.bucket,
            &self.config.span_measurement,
            start,
            end_ts,
        )?;
        let result = self.executor.execute(ctx, &query).await?;
        ctx.check()?;
        let links = dependency_links_from_result(result)?;
        info!(count = links.len(), "Derived dependency links");
        Ok(links)
    }

    fn trace_query(&self, start_time_min: DateTime<Utc>) -> TraceQuery<'_> {
        TraceQuery::new(
            &self.config.bucket,
            &self.config.span_measurement,
            &self.config.log_measurement,
            start_time_min,
        )
    }
}
