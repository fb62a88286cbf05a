use api_structs::ui::{ApiResponse, ApiResponseError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backtraced_error::error_chain_to_pretty_formatted;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use trace_reader::{QueryError, Reader, ReaderError, RequestContext};
use tracing::{error, info, instrument, warn};

mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<Reader>,
    pub default_lookback: Duration,
    pub query_timeout: Duration,
}

impl AppState {
    fn request_context(&self) -> RequestContext {
        RequestContext::with_timeout(self.query_timeout)
    }
}

async fn ready() -> StatusCode {
    StatusCode::OK
}

pub fn router(app_state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/api/ready", axum::routing::get(ready))
        .route("/api/services", axum::routing::get(handlers::services_get))
        .route(
            "/api/services/:service/operations",
            axum::routing::get(handlers::operations_get),
        )
        .route("/api/traces", axum::routing::get(handlers::traces_get))
        .route(
            "/api/traces/:trace_id",
            axum::routing::get(handlers::trace_get),
        )
        .route("/api/trace-ids", axum::routing::get(handlers::trace_ids_get))
        .route(
            "/api/dependencies",
            axum::routing::get(handlers::dependencies_get),
        )
        .with_state(app_state)
        .layer(tower_http::cors::CorsLayer::very_permissive())
}

#[instrument(skip_all)]
pub fn start(
    app_state: AppState,
    api_port: u16,
) -> Result<JoinHandle<()>, Box<dyn std::error::Error>> {
    info!("Starting API on port {api_port}");
    let listener = std::net::TcpListener::bind(("0.0.0.0", api_port))?;
    let server = axum::Server::from_tcp(listener)?;
    Ok(tokio::spawn(async move {
        if let Err(e) = server.serve(router(app_state).into_make_service()).await {
            error!("API server stopped: {}", error_chain_to_pretty_formatted(e));
        }
    }))
}

#[derive(Debug)]
pub struct ApiError {
    pub code: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self {
            code: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            data: (),
            total: 0,
            limit: 0,
            offset: 0,
            errors: vec![ApiResponseError {
                code: self.code.as_u16(),
                msg: self.message,
                trace_id: None,
            }],
        };
        (self.code, Json(body)).into_response()
    }
}

impl From<ReaderError> for ApiError {
    fn from(value: ReaderError) -> Self {
        match value {
            ReaderError::Build(e) => ApiError::bad_request(error_chain_to_pretty_formatted(e)),
            ReaderError::TraceNotFound => ApiError {
                code: StatusCode::NOT_FOUND,
                message: "trace not found".to_string(),
            },
            ReaderError::Query(QueryError::Http(e)) if e.is_timeout() => {
                warn!("Query service timed out: {}", error_chain_to_pretty_formatted(&e));
                ApiError {
                    code: StatusCode::GATEWAY_TIMEOUT,
                    message: e.to_string(),
                }
            }
            ReaderError::Cancelled | ReaderError::DeadlineExceeded => {
                warn!("Request gave up: {value}");
                ApiError {
                    code: StatusCode::SERVICE_UNAVAILABLE,
                    message: value.to_string(),
                }
            }
            other => {
                error!(
                    "Error during api request: {}",
                    error_chain_to_pretty_formatted(&other)
                );
                ApiError {
                    code: StatusCode::INTERNAL_SERVER_ERROR,
                    message: other.to_string(),
                }
            }
        }
    }
}
