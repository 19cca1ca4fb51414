use crate::config::{ApiConfig, StorageBackend};
use crate::ingest::{Ingestor, PartialWriteError, RequestContext};
use crate::models::{IngestSummary, StorageKey};
use crate::validation::{parse_batch, FieldError, ValidationErrors};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use metrics::counter;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};
use uuid::Uuid;

/// Correlation id header, echoed on every response
pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub service_name: Arc<str>,
    pub backend: StorageBackend,
    pub region: Arc<str>,
}

/// Correlation id for the current request, set by [`propagate_request_id`]
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub storage_backend: StorageBackend,
    pub region: String,
}

/// Error body for rejected input
#[derive(Debug, Serialize)]
pub struct ValidationErrorResponse {
    pub detail: Vec<FieldError>,
}

/// Error body for a failed storage write
#[derive(Debug, Serialize)]
pub struct StorageErrorResponse {
    pub detail: &'static str,
    pub stored: usize,
    pub keys: Vec<StorageKey>,
}

/// Errors returned by the ingestion endpoint
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationErrors),
    Storage(PartialWriteError),
}

impl From<ValidationErrors> for ApiError {
    fn from(e: ValidationErrors) -> Self {
        ApiError::Validation(e)
    }
}

impl From<PartialWriteError> for ApiError {
    fn from(e: PartialWriteError) -> Self {
        ApiError::Storage(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ValidationErrorResponse { detail: errors.0 }),
            )
                .into_response(),
            ApiError::Storage(err) => {
                let status = if err.source.is_throttled() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (
                    status,
                    Json(StorageErrorResponse {
                        detail: "Storage error",
                        stored: err.stored,
                        keys: err.keys,
                    }),
                )
                    .into_response()
            }
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    // The request id middleware sits outside the trace layer so the request
    // span, and every line logged inside it, carries the id.
    let service_name = state.service_name.clone();
    let trace = TraceLayer::new_for_http().make_span_with(move |request: &Request| {
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.as_str())
            .unwrap_or_default();

        info_span!(
            "request",
            request_id = %request_id,
            service = %service_name,
            method = %request.method(),
            path = %request.uri().path(),
        )
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/ingest", post(ingest))
        .layer(trace)
        .layer(middleware::from_fn(propagate_request_id))
        .layer(cors)
        .with_state(state)
}

/// Read or generate the correlation id, hand it to the inner layers and echo
/// it on the response.
async fn propagate_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), value);
    }

    response
}

/// Health check endpoint. No dependency checks.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.service_name.to_string(),
        storage_backend: state.backend,
        region: state.region.to_string(),
    })
}

/// Validate, transform and store a batch
async fn ingest(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Json<IngestSummary>, ApiError> {
    let ctx = RequestContext::new(request_id);

    let items = parse_batch(&body).map_err(|e| {
        counter!("ingest_requests_total", "outcome" => "rejected").increment(1);
        warn!(
            request_id = %ctx.request_id,
            errors = e.errors().len(),
            "Rejected ingest request"
        );
        e
    })?;

    let summary = state.ingestor.ingest(items, &ctx).await.map_err(|e| {
        counter!("ingest_requests_total", "outcome" => "storage_error").increment(1);
        e
    })?;

    counter!("ingest_requests_total", "outcome" => "stored").increment(1);
    info!(
        request_id = %ctx.request_id,
        stored = summary.stored,
        "Ingest request completed"
    );

    Ok(Json(summary))
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingestion API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnrichedItem;
    use crate::storage::{MockItemStore, StorageError};
    use crate::transform::SystemClock;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn app(store: MockItemStore) -> Router {
        let state = AppState {
            ingestor: Arc::new(Ingestor::new(
                Arc::new(store),
                Arc::new(SystemClock::new()),
            )),
            service_name: Arc::from("ingestor-service"),
            backend: StorageBackend::S3,
            region: Arc::from("us-east-1"),
        };
        create_router(state, &ApiConfig::default())
    }

    fn s3_key(item: &EnrichedItem) -> Result<StorageKey, StorageError> {
        Ok(StorageKey::new(format!("items/{}-{}.json", item.id, item.sk)))
    }

    fn post_ingest(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ingest")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let resp = app(MockItemStore::new())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage_backend"], "s3");
        assert_eq!(body["region"], "us-east-1");
    }

    #[tokio::test]
    async fn test_request_id_echoed() {
        let resp = app(MockItemStore::new())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("X-Request-ID", "test-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.headers()["x-request-id"], "test-123");
    }

    #[tokio::test]
    async fn test_request_id_generated_when_absent() {
        let resp = app(MockItemStore::new())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let id = resp.headers()["x-request-id"].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_ingest_single_item() {
        let captured: Arc<Mutex<Vec<EnrichedItem>>> = Arc::default();
        let sink = captured.clone();

        let mut store = MockItemStore::new();
        store.expect_put().times(1).returning(move |item| {
            sink.lock().unwrap().push(item.clone());
            s3_key(item)
        });

        let resp = app(store)
            .oneshot(post_ingest(json!({
                "items": [{"id": "item-1", "name": "Sample Item", "value": 15.5}]
            })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["stored"], 1);

        let stored = captured.lock().unwrap();
        let item = &stored[0];
        assert_eq!(item.slug, "sample-item");
        assert_eq!(item.name_upper, "SAMPLE ITEM");
        assert_eq!(item.value_times_two, 31.0);
        assert_eq!(
            body["keys"],
            json!([format!("items/item-1-{}.json", item.sk)])
        );
    }

    #[tokio::test]
    async fn test_missing_name_rejected_without_writes() {
        let mut store = MockItemStore::new();
        store.expect_put().never();

        let resp = app(store)
            .oneshot(post_ingest(json!({
                "items": [
                    {"id": "ok", "name": "Fine", "value": 1.0},
                    {"id": "test-1", "value": 10.0}
                ]
            })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(resp).await;
        assert_eq!(body["detail"][0]["loc"], "items[1].name");
        assert_eq!(body["detail"][0]["type"], "missing");
    }

    #[tokio::test]
    async fn test_empty_items_rejected() {
        let mut store = MockItemStore::new();
        store.expect_put().never();

        let resp = app(store)
            .oneshot(post_ingest(json!({"items": []})))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_storage_failure_reports_partial_success() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();

        let mut store = MockItemStore::new();
        store.expect_put().times(2).returning(move |item| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n == 1 {
                s3_key(item)
            } else {
                Err(StorageError::NotFound("NoSuchBucket".to_string()))
            }
        });

        let resp = app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .header("X-Request-ID", "req-fail")
                    .body(Body::from(
                        json!({
                            "items": [
                                {"id": "test-1", "name": "Test Item 1", "value": 10.5},
                                {"id": "test-2", "name": "Another Test Item!", "value": 25.0}
                            ]
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers()["x-request-id"], "req-fail");

        let body = json_body(resp).await;
        assert_eq!(body["detail"], "Storage error");
        assert_eq!(body["stored"], 1);
        assert_eq!(body["keys"].as_array().unwrap().len(), 1);
        assert!(!body.to_string().contains("NoSuchBucket"));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    fn logged_request_id(line: &Value) -> Option<&str> {
        line["fields"]["request_id"]
            .as_str()
            .or_else(|| line["span"]["request_id"].as_str())
    }

    #[tokio::test]
    async fn test_failed_request_logs_carry_request_id() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut store = MockItemStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_| Err(StorageError::AccessDenied("AccessDenied".to_string())));

        let resp = app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .header("X-Request-ID", "req-logged")
                    .body(Body::from(
                        json!({"items": [{"id": "a", "name": "A", "value": 1}]}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let lines = logs.lines();
        assert!(lines.iter().any(|line| line["level"] == "ERROR"));

        let missing: Vec<&Value> = lines
            .iter()
            .filter(|line| logged_request_id(line) != Some("req-logged"))
            .collect();
        assert!(missing.is_empty(), "lines without request_id: {missing:?}");
    }

    #[tokio::test]
    async fn test_throttling_maps_to_503() {
        let mut store = MockItemStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_| Err(StorageError::Throttled("SlowDown".to_string())));

        let resp = app(store)
            .oneshot(post_ingest(json!({
                "items": [{"id": "a", "name": "A", "value": 1}]
            })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(resp).await;
        assert_eq!(body["stored"], 0);
    }
}
