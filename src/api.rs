//! HTTP Management API
//!
//! JSON endpoints over the orchestrator and reconciler, plus server-sent
//! event streams for expose and unexpose. One workflow per service runs at
//! a time; a second request for the same service gets 409.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ExposeError;
use crate::expose::{
    ExposeService, MigrationResult, OperationResult, ProgressEvent, StreamingExposeService,
    WorkflowOp,
};
use crate::providers::SslRetryOutcome;
use crate::store::ServiceStore;
use crate::sync::SyncSummary;
use crate::types::{Scheme, ServiceRecord};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// Another workflow for this service is running
    Conflict(String),
    Expose(ExposeError),
    Internal(String),
}

impl From<ExposeError> for ApiError {
    fn from(err: ExposeError) -> Self {
        ApiError::Expose(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            ApiError::Expose(err) => {
                let (status, error_type) = match &err {
                    ExposeError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    ExposeError::AlreadyExposed { .. } => (StatusCode::CONFLICT, "already_exposed"),
                    ExposeError::NotExposed { .. } => (StatusCode::CONFLICT, "not_exposed"),
                    ExposeError::NoProvidersConfigured => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "no_providers_configured")
                    }
                    ExposeError::NothingToMigrate(_) => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "nothing_to_migrate")
                    }
                    ExposeError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
                    ExposeError::PropagationTimeout(_) => {
                        (StatusCode::BAD_GATEWAY, "propagation_timeout")
                    }
                    ExposeError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
                };
                (status, error_type, err.to_string())
            }
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Service ids with a workflow currently running
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    /// Claim `service_id`; `None` if it is already taken
    pub fn try_claim(&self, service_id: &str) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if !ids.insert(service_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            ids: self.ids.clone(),
            service_id: service_id.to_string(),
        })
    }

    fn claim(&self, service_id: &str) -> ApiResult<InFlightGuard> {
        self.try_claim(service_id).ok_or_else(|| {
            ApiError::Conflict(format!("A workflow for service {} is already running", service_id))
        })
    }
}

/// Releases the claim on drop
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    service_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(&self.service_id);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub expose: Arc<ExposeService>,
    pub streaming: StreamingExposeService,
    pub store: Arc<dyn ServiceStore>,
    pub in_flight: InFlight,
}

impl AppState {
    pub fn new(expose: Arc<ExposeService>, store: Arc<dyn ServiceStore>) -> Self {
        Self {
            streaming: StreamingExposeService::new(expose.clone()),
            expose,
            store,
            in_flight: InFlight::default(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/services", get(list_services).post(create_service))
        .route("/api/services/:id", get(get_service))
        .route("/api/services/:id/expose", post(expose))
        .route("/api/services/:id/expose/stream", get(expose_stream))
        .route("/api/services/:id/expose/dns", post(expose_dns))
        .route("/api/services/:id/expose/proxy", post(expose_proxy))
        .route("/api/services/:id/unexpose", post(unexpose))
        .route("/api/services/:id/unexpose/stream", get(unexpose_stream))
        .route("/api/services/:id/migrate", post(migrate))
        .route("/api/services/:id/ssl/retry", post(retry_ssl))
        .route("/api/services/:id/sync", post(sync_service))
        .route("/api/sync", post(sync_all))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "expose-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn list_services(State(state): State<AppState>) -> ApiResult<Json<Vec<ServiceRecord>>> {
    let services = state
        .store
        .list()
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok(Json(services))
}

async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceRecord>> {
    let service = state
        .store
        .get(&id)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?
        .ok_or(ExposeError::NotFound(id))?;
    Ok(Json(service))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceRequest {
    pub name: String,
    pub subdomain: String,
    pub port: u16,
    #[serde(default)]
    pub scheme: Option<Scheme>,
}

async fn create_service(
    State(state): State<AppState>,
    Json(req): Json<CreateServiceRequest>,
) -> ApiResult<(StatusCode, Json<ServiceRecord>)> {
    let subdomain = req.subdomain.trim().to_ascii_lowercase();
    if req.name.trim().is_empty() || subdomain.is_empty() || req.port == 0 {
        return Err(ApiError::BadRequest(
            "name, subdomain and a non-zero port are required".to_string(),
        ));
    }
    if !subdomain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(ApiError::BadRequest(format!("Invalid subdomain: {}", req.subdomain)));
    }

    let mut service = ServiceRecord::new(req.name.trim(), &subdomain, req.port);
    service.scheme = req.scheme;

    state
        .store
        .insert(service.clone())
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;

    info!(service_id = %service.id, subdomain = %service.subdomain, "Service added");
    Ok((StatusCode::CREATED, Json(service)))
}

async fn expose(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OperationResult>> {
    let _guard = state.in_flight.claim(&id)?;
    Ok(Json(state.expose.expose(&id).await?))
}

async fn expose_dns(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OperationResult>> {
    let _guard = state.in_flight.claim(&id)?;
    Ok(Json(state.expose.expose_dns_only(&id).await?))
}

async fn expose_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OperationResult>> {
    let _guard = state.in_flight.claim(&id)?;
    Ok(Json(state.expose.expose_proxy_only(&id).await?))
}

async fn unexpose(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OperationResult>> {
    let _guard = state.in_flight.claim(&id)?;
    Ok(Json(state.expose.unexpose(&id).await?))
}

async fn migrate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MigrationResult>> {
    let _guard = state.in_flight.claim(&id)?;
    Ok(Json(state.expose.migrate_subdomain(&id).await?))
}

async fn retry_ssl(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SslRetryOutcome>> {
    let _guard = state.in_flight.claim(&id)?;
    Ok(Json(state.expose.retry_ssl(&id).await?))
}

async fn sync_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceRecord>> {
    Ok(Json(state.expose.sync().sync_service(&id).await?))
}

async fn sync_all(State(state): State<AppState>) -> ApiResult<Json<SyncSummary>> {
    Ok(Json(state.expose.sync().sync_all().await?))
}

async fn expose_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    start_stream(&state, WorkflowOp::Expose, &id)
}

async fn unexpose_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    start_stream(&state, WorkflowOp::Unexpose, &id)
}

fn start_stream(
    state: &AppState,
    op: WorkflowOp,
    service_id: &str,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let guard = state.in_flight.claim(service_id)?;
    let rx = state.streaming.start_guarded(op, service_id, guard);

    // Ends when the workflow drops its sender after the terminal event
    let events = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok::<_, Infallible>(to_sse(&event)), rx))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn to_sse(event: &ProgressEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!(service_id = %event.service_id, error = %e, "Failed to encode progress event");
            Event::default().comment("unencodable event")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(h: &Harness) -> (Router, AppState) {
        let state = AppState::new(Arc::new(h.service()), h.store.clone());
        (router(state.clone()), state)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new(vec![]);
        let (status, body) = call(app(&h).0, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_expose_endpoint() {
        let service = ServiceRecord::new("grafana", "grafana", 3000);
        let h = Harness::new(vec![service.clone()]);

        let uri = format!("/api/services/{}/expose", service.id);
        let (status, body) = call(app(&h).0, "POST", &uri).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["domain"], "grafana.example.com");
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let mut service = ServiceRecord::new("grafana", "grafana", 3000);
        service.dns_record_id = Some("dns-9".to_string());
        let h = Harness::new(vec![service.clone()]);

        let (status, body) = call(app(&h).0, "POST", "/api/services/missing/expose").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let uri = format!("/api/services/{}/expose/dns", service.id);
        let (status, body) = call(app(&h).0, "POST", &uri).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_exposed");

        let uri = format!("/api/services/{}/migrate", service.id);
        let (status, _) = call(app(&h).0, "POST", &uri).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_busy_service_is_rejected() {
        let service = ServiceRecord::new("grafana", "grafana", 3000);
        let h = Harness::new(vec![service.clone()]);
        let (router, state) = app(&h);

        let _held = state.in_flight.try_claim(&service.id).unwrap();
        let uri = format!("/api/services/{}/unexpose", service.id);
        let (status, body) = call(router, "POST", &uri).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let in_flight = InFlight::default();
        let guard = in_flight.try_claim("svc-1").unwrap();
        assert!(in_flight.try_claim("svc-1").is_none());
        assert!(in_flight.try_claim("svc-2").is_some());

        drop(guard);
        assert!(in_flight.try_claim("svc-1").is_some());
    }

    #[tokio::test]
    async fn test_create_service_validates_input() {
        let h = Harness::new(vec![]);
        let (router, _) = app(&h);

        let request = Request::builder()
            .method("POST")
            .uri("/api/services")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"grafana","subdomain":"bad name","port":3000}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_expose_stream_sends_events() {
        let service = ServiceRecord::new("grafana", "grafana", 3000);
        let h = Harness::new(vec![service.clone()]);
        let (router, _) = app(&h);

        let uri = format!("/api/services/{}/expose/stream", service.id);
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"type\":\"progress\""));
        assert!(text.contains("\"type\":\"complete\""));
        assert!(h.stored(&service.id).await.enabled);
    }
}
