//! Runs Flux text on the remote query service.

use crate::context::RequestContext;
use crate::error::{QueryError, ReaderError};
use crate::flux::FluxResult;
use async_trait::async_trait;
use backtraced_error::{ReqwestError, SerdeJsonError};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryDialect {
    pub header: bool,
    pub delimiter: String,
    #[serde(rename = "commentPrefix")]
    pub comment_prefix: String,
    #[serde(rename = "dateTimeFormat")]
    pub date_time_format: String,
    /// The table codec needs all three to type the columns.
    pub annotations: Vec<String>,
}

impl Default for QueryDialect {
    fn default() -> Self {
        Self {
            header: true,
            delimiter: ",".to_string(),
            comment_prefix: "#".to_string(),
            date_time_format: "RFC3339".to_string(),
            annotations: vec![
                "group".to_string(),
                "datatype".to_string(),
                "default".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    #[serde(rename = "type")]
    pub query_type: String,
    pub dialect: QueryDialect,
}

impl QueryRequest {
    pub fn flux<S: Into<String>>(query: S) -> Self {
        Self {
            query: query.into(),
            query_type: "flux".to_string(),
            dialect: QueryDialect::default(),
        }
    }
}

/// Answers a query with the raw annotated CSV body.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn query(&self, org_id: &str, request: &QueryRequest) -> Result<Vec<u8>, QueryError>;
}

/// `/api/v2/query` of an InfluxDB 2 compatible server.
#[derive(Debug, Clone)]
pub struct InfluxQueryService {
    client: reqwest::Client,
    query_url: String,
}

#[derive(Debug, Deserialize)]
struct InfluxErrorBody {
    code: String,
    message: String,
}

impl InfluxQueryService {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self, QueryError> {
        let mut default_headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Token {token}"))
            .map_err(|_| QueryError::InvalidToken)?;
        auth.set_sensitive(true);
        default_headers.insert(AUTHORIZATION, auth);
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/csv"));
        let client = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| ReqwestError::from_reqwest_error(e, "building reqwest client"))?;
        Ok(Self {
            client,
            query_url: format!("{}/api/v2/query", url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl QueryService for InfluxQueryService {
    #[instrument(skip_all)]
    async fn query(&self, org_id: &str, request: &QueryRequest) -> Result<Vec<u8>, QueryError> {
        let body = serde_json::to_vec(request).map_err(|e| {
            SerdeJsonError::from_serde_json_error(
                e,
                "serializing query request",
                request.query.chars().take(256).collect(),
            )
        })?;
        let resp = self
            .client
            .post(&self.query_url)
            .query(&[("orgID", org_id)])
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ReqwestError::from_reqwest_error(e, "sending query"))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ReqwestError::from_reqwest_error(e, "reading query response"))?;
        if !status.is_success() {
            let (code, message) = match serde_json::from_slice::<InfluxErrorBody>(&body) {
                Ok(err) => (err.code, err.message),
                Err(_) => (
                    status.canonical_reason().unwrap_or_default().to_string(),
                    String::from_utf8_lossy(&body).into_owned(),
                ),
            };
            return Err(QueryError::Status {
                status: status.as_u16(),
                code,
                message,
            });
        }
        Ok(body.to_vec())
    }
}

/// Shared by every request, cheap to clone.
#[derive(Clone)]
pub struct QueryExecutor {
    service: Arc<dyn QueryService>,
    org_id: String,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("org_id", &self.org_id)
            .finish_non_exhaustive()
    }
}

impl QueryExecutor {
    pub fn new<S: Into<String>>(service: Arc<dyn QueryService>, org_id: S) -> Self {
        Self {
            service,
            org_id: org_id.into(),
        }
    }

    /// A successful response without tables yields an empty [`FluxResult`].
    #[instrument(skip_all)]
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        query: &str,
    ) -> Result<FluxResult, ReaderError> {
        debug!("Running query:\n{query}");
        let request = QueryRequest::flux(query);
        let body = ctx
            .run(self.service.query(&self.org_id, &request))
            .await??;
        debug!(bytes = body.len(), "Query answered");
        Ok(FluxResult::from_csv(body))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap as AxumHeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    const CSV_BODY: &str = "\
#group,false,false,false
#datatype,string,long,string
#default,_result,,
,result,table,_value
,,0,frontend
";

    #[derive(Debug)]
    struct Captured {
        params: HashMap<String, String>,
        headers: AxumHeaderMap,
        body: serde_json::Value,
    }

    async fn answer_csv(
        State(captured): State<mpsc::UnboundedSender<Captured>>,
        Query(params): Query<HashMap<String, String>>,
        headers: AxumHeaderMap,
        body: String,
    ) -> impl IntoResponse {
        let body = serde_json::from_str(&body).unwrap();
        captured
            .send(Captured {
                params,
                headers,
                body,
            })
            .unwrap();
        CSV_BODY
    }

    async fn answer_error() -> impl IntoResponse {
        (
            StatusCode::BAD_REQUEST,
            r#"{"code":"invalid","message":"compilation failed: undefined identifier"}"#,
        )
    }

    async fn answer_slowly() -> impl IntoResponse {
        tokio::time::sleep(Duration::from_secs(30)).await;
        CSV_BODY
    }

    fn serve(app: axum::Router) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap()
        });
        format!("http://{addr}/")
    }

    fn executor(url: &str) -> QueryExecutor {
        let service = InfluxQueryService::new(url, "secret-token", Duration::from_secs(10)).unwrap();
        QueryExecutor::new(Arc::new(service), "org-1")
    }

    #[tokio::test]
    async fn sends_flux_with_annotations_and_decodes_the_answer() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let app = axum::Router::new()
            .route("/api/v2/query", axum::routing::post(answer_csv))
            .with_state(sender);
        let url = serve(app);

        let tables = executor(&url)
            .execute(&RequestContext::new(), "buckets()")
            .await
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(tables.len(), 1);

        let captured = receiver.recv().await.unwrap();
        assert_eq!(captured.params.get("orgID").map(String::as_str), Some("org-1"));
        assert_eq!(captured.headers["authorization"], "Token secret-token");
        assert_eq!(captured.headers["accept"], "application/csv");
        assert_eq!(captured.headers["content-type"], "application/json");
        assert_eq!(
            captured.body,
            serde_json::json!({
                "query": "buckets()",
                "type": "flux",
                "dialect": {
                    "header": true,
                    "delimiter": ",",
                    "commentPrefix": "#",
                    "dateTimeFormat": "RFC3339",
                    "annotations": ["group", "datatype", "default"]
                }
            })
        );
    }

    #[tokio::test]
    async fn error_status_carries_the_service_message() {
        let app = axum::Router::new().route("/api/v2/query", axum::routing::post(answer_error));
        let url = serve(app);
        let err = executor(&url)
            .execute(&RequestContext::new(), "bad(")
            .await
            .unwrap_err();
        match err {
            ReaderError::Query(QueryError::Status {
                status,
                code,
                message,
            }) => {
                assert_eq!(status, 400);
                assert_eq!(code, "invalid");
                assert_eq!(message, "compilation failed: undefined identifier");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_interrupts_a_slow_service() {
        let app = axum::Router::new().route("/api/v2/query", axum::routing::post(answer_slowly));
        let url = serve(app);
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        let err = executor(&url).execute(&ctx, "buckets()").await.unwrap_err();
        assert!(matches!(err, ReaderError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn unreachable_service_is_an_http_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let err = executor(&url)
            .execute(&RequestContext::new(), "buckets()")
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Query(QueryError::Http(_))));
    }
}
