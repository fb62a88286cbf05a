use super::{ApiError, AppState};
use api_structs::time_conversion::{time_from_unix_micros, time_from_unix_millis};
use api_structs::ui::{self, ApiResponse};
use api_structs::{TraceId, TraceQueryParameters};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, instrument};

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn listed<T>(data: Vec<T>) -> Json<ApiResponse<Vec<T>>> {
    let total = data.len();
    Json(ApiResponse::new(data, total))
}

#[instrument(skip_all)]
pub async fn services_get(State(app_state): State<AppState>) -> ApiResult<Vec<String>> {
    let ctx = app_state.request_context();
    Ok(listed(app_state.reader.get_services(&ctx).await?))
}

#[instrument(skip_all, fields(%service))]
pub async fn operations_get(
    State(app_state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<Vec<String>> {
    let ctx = app_state.request_context();
    Ok(listed(app_state.reader.get_operations(&ctx, &service).await?))
}

fn accepts_brotli(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|encoding| encoding.split(';').next().map(str::trim) == Some("br"))
}

fn brotli_compressed(json: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut compressed = vec![];
    brotli::CompressorReader::new(json, 4096, 4, 21)
        .read_to_end(&mut compressed)
        .map_err(|e| ApiError {
            code: axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("failed to compress response: {e}"),
        })?;
    Ok(compressed)
}

/// Traces can be large, so the body is brotli compressed for clients accepting it.
#[instrument(skip_all, fields(%trace_id))]
pub async fn trace_get(
    State(app_state): State<AppState>,
    Path(trace_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let parsed: TraceId = trace_id
        .parse()
        .map_err(|e: api_structs::ParseIdError| ApiError::bad_request(e.to_string()))?;
    let ctx = app_state.request_context();
    let trace = app_state.reader.get_trace(&ctx, parsed).await?;
    let body = ApiResponse::new(vec![ui::Trace::from(&trace)], 1);
    if !accepts_brotli(&headers) {
        return Ok(Json(body).into_response());
    }
    let json = serde_json::to_vec(&body).map_err(|e| ApiError {
        code: axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("failed to serialize trace: {e}"),
    })?;
    let compressed = brotli_compressed(&json)?;
    debug!(
        uncompressed = json.len(),
        compressed = compressed.len(),
        "Compressed trace"
    );
    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            ),
            (header::CONTENT_ENCODING, HeaderValue::from_static("br")),
        ],
        compressed,
    )
        .into_response())
}

/// Search form of the UI. Times and durations are unix microseconds.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSearchParams {
    pub service: String,
    pub operation: Option<String>,
    /// JSON object of tag key to value.
    pub tags: Option<String>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub min_duration: Option<u64>,
    pub max_duration: Option<u64>,
    pub limit: Option<usize>,
}

impl TraceSearchParams {
    pub fn into_query_parameters(
        self,
        default_lookback: Duration,
    ) -> Result<TraceQueryParameters, ApiError> {
        let start_time_min = match self.start {
            Some(start) => time_from_unix_micros(start)
                .ok_or_else(|| ApiError::bad_request(format!("start out of range: {start}")))?,
            None => chrono::Duration::from_std(default_lookback)
                .ok()
                .and_then(|lookback| Utc::now().checked_sub_signed(lookback))
                .ok_or_else(|| ApiError::bad_request("default lookback out of range"))?,
        };
        let start_time_max = self
            .end
            .map(|end| {
                time_from_unix_micros(end)
                    .ok_or_else(|| ApiError::bad_request(format!("end out of range: {end}")))
            })
            .transpose()?;
        let tags: BTreeMap<String, String> = match self.tags.as_deref() {
            None | Some("") => BTreeMap::new(),
            Some(tags) => serde_json::from_str(tags)
                .map_err(|e| ApiError::bad_request(format!("invalid tags {tags:?}: {e}")))?,
        };
        let mut params = TraceQueryParameters::new(self.service, start_time_min);
        params.operation_name = self.operation.filter(|op| !op.is_empty());
        params.tags = tags;
        params.start_time_max = start_time_max;
        params.duration_min = self.min_duration.map(Duration::from_micros);
        params.duration_max = self.max_duration.map(Duration::from_micros);
        params.num_traces = self.limit.unwrap_or(0);
        Ok(params)
    }
}

#[instrument(skip_all, fields(service = %search.service))]
pub async fn traces_get(
    State(app_state): State<AppState>,
    Query(search): Query<TraceSearchParams>,
) -> ApiResult<Vec<ui::Trace>> {
    let params = search.into_query_parameters(app_state.default_lookback)?;
    let ctx = app_state.request_context();
    let traces = app_state.reader.find_traces(&ctx, &params).await?;
    Ok(listed(traces.iter().map(ui::Trace::from).collect()))
}

#[instrument(skip_all, fields(service = %search.service))]
pub async fn trace_ids_get(
    State(app_state): State<AppState>,
    Query(search): Query<TraceSearchParams>,
) -> ApiResult<Vec<String>> {
    let params = search.into_query_parameters(app_state.default_lookback)?;
    let ctx = app_state.request_context();
    let ids = app_state.reader.find_trace_ids(&ctx, &params).await?;
    Ok(listed(ids.iter().map(TraceId::to_string).collect()))
}

/// Milliseconds, like the Jaeger dependency graph sends them.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependenciesParams {
    pub end_ts: Option<u64>,
    pub lookback: Option<u64>,
}

#[instrument(skip_all)]
pub async fn dependencies_get(
    State(app_state): State<AppState>,
    Query(params): Query<DependenciesParams>,
) -> ApiResult<Vec<ui::DependencyLink>> {
    let end_ts = match params.end_ts {
        Some(end_ts) => time_from_unix_millis(end_ts)
            .ok_or_else(|| ApiError::bad_request(format!("endTs out of range: {end_ts}")))?,
        None => Utc::now(),
    };
    let lookback = params
        .lookback
        .map(Duration::from_millis)
        .unwrap_or(app_state.default_lookback);
    let ctx = app_state.request_context();
    let links = app_state
        .reader
        .get_dependencies(&ctx, end_ts, lookback)
        .await?;
    Ok(listed(links.iter().map(ui::DependencyLink::from).collect()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn search(query: &str) -> TraceSearchParams {
        let uri: axum::http::Uri = format!("http://localhost/api/traces?{query}").parse().unwrap();
        Query::<TraceSearchParams>::try_from_uri(&uri).unwrap().0
    }

    #[test]
    fn empty_operation_means_any() {
        let params = search("service=frontend&operation=")
            .into_query_parameters(Duration::from_secs(60))
            .unwrap();
        assert_eq!(params.operation_name, None);
        assert!(params.tags.is_empty());
        assert_eq!(params.num_traces, 0);
        assert!(params.start_time_max.is_none());
        assert!(Utc::now() - params.start_time_min >= chrono::Duration::seconds(60));
    }

    #[test]
    fn micros_become_times_and_durations() {
        let params = search("service=s&start=1000000&end=2000000&minDuration=5&maxDuration=7&limit=3")
            .into_query_parameters(Duration::from_secs(60))
            .unwrap();
        assert_eq!(params.start_time_min, time_from_unix_micros(1_000_000).unwrap());
        assert_eq!(params.start_time_max, time_from_unix_micros(2_000_000));
        assert_eq!(params.duration_min, Some(Duration::from_micros(5)));
        assert_eq!(params.duration_max, Some(Duration::from_micros(7)));
        assert_eq!(params.num_traces, 3);
    }

    #[test]
    fn tags_must_be_a_json_object_of_strings() {
        let params = search("service=s&tags=%7B%22error%22%3A%22true%22%7D")
            .into_query_parameters(Duration::from_secs(60))
            .unwrap();
        assert_eq!(params.tags.get("error").map(String::as_str), Some("true"));

        let err = search("service=s&tags=%5B1%5D")
            .into_query_parameters(Duration::from_secs(60))
            .unwrap_err();
        assert_eq!(err.code, axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn brotli_is_detected_among_other_encodings() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_brotli(&headers));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
        assert!(!accepts_brotli(&headers));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, br;q=0.9"));
        assert!(accepts_brotli(&headers));
    }
}
