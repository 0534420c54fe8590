use std::sync::Arc;

use axum::extract::{FromRequest, FromRequestParts, Query, Request, State};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::context::StoreContext;
use crate::domains::sync::service::{parse_period, SyncService};
use crate::domains::sync::types::{ConflictResolutionRequest, QueueItemRequest, RetryRequest, SyncItem};

const STORE_ID_HEADER: &str = "x-store-id";
const TERMINAL_ID_HEADER: &str = "x-terminal-id";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn SyncService>,
}

impl AppState {
    pub fn new(service: Arc<dyn SyncService>) -> Self {
        Self { service }
    }
}

/// Extract the calling store's identity from request headers. Every sync
/// endpoint is store-scoped; a missing or malformed header is a 400.
impl<S: Send + Sync> FromRequestParts<S> for StoreContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(STORE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::bad_request("missing X-Store-Id header"))?;
        let store_id = Uuid::parse_str(raw)
            .map_err(|_| ApiError::bad_request("X-Store-Id is not a valid UUID"))?;

        let terminal_id = parts
            .headers
            .get(TERMINAL_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(match terminal_id {
            Some(terminal) => StoreContext::with_terminal(store_id, terminal),
            None => StoreContext::new(store_id),
        })
    }
}

/// JSON body extractor whose rejection carries the standard envelope.
///
/// axum's stock `Json` rejection replies with plain text, which would leave
/// malformed bodies and bad enum values outside the envelope contract; this
/// wrapper turns the serde path message into an `ApiError` instead.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        Ok(ApiJson(value))
    }
}

fn envelope<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": data,
        "error": serde_json::Value::Null,
    }))
}

pub fn app_router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/sync/batch", post(process_batch))
        .route("/sync/status", post(get_status))
        .route("/sync/stats", get(get_stats))
        .route("/sync/conflicts/resolve", post(resolve_conflicts))
        .route("/sync/retry", post(retry_failed))
        .route("/sync/queue", post(queue_sync))
        .route("/sync/queue/status", get(get_queue_status))
        .route("/sync/queue/requeue", post(requeue_failed));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", sync_routes)
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    batch_id: Option<String>,
    items: Vec<SyncItem>,
}

async fn process_batch(
    State(state): State<AppState>,
    ctx: StoreContext,
    ApiJson(request): ApiJson<BatchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = state
        .service
        .process_batch(&ctx, request.batch_id, request.items)
        .await?;
    Ok(envelope(response))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    idempotency_keys: Vec<String>,
}

async fn get_status(
    State(state): State<AppState>,
    ctx: StoreContext,
    ApiJson(request): ApiJson<StatusRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let statuses = state.service.get_status(&ctx, request.idempotency_keys).await?;
    Ok(envelope(json!({ "statuses": statuses })))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default)]
    period: Option<String>,
}

async fn get_stats(
    State(state): State<AppState>,
    ctx: StoreContext,
    Query(query): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let period = parse_period(query.period.as_deref().unwrap_or("24h"))?;
    let stats = state.service.get_stats(&ctx, period).await?;
    Ok(envelope(stats))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    resolutions: Vec<ConflictResolutionRequest>,
}

async fn resolve_conflicts(
    State(state): State<AppState>,
    ctx: StoreContext,
    ApiJson(request): ApiJson<ResolveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = state
        .service
        .resolve_conflicts(&ctx, request.resolutions)
        .await?;
    Ok(envelope(response))
}

async fn retry_failed(
    State(state): State<AppState>,
    ctx: StoreContext,
    ApiJson(request): ApiJson<RetryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = state.service.retry_failed(&ctx, request).await?;
    Ok(envelope(response))
}

#[derive(Debug, Deserialize)]
struct QueueRequest {
    #[serde(default)]
    batch_id: Option<String>,
    items: Vec<QueueItemRequest>,
}

async fn queue_sync(
    State(state): State<AppState>,
    ctx: StoreContext,
    ApiJson(request): ApiJson<QueueRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = state
        .service
        .queue_sync(&ctx, request.batch_id, request.items)
        .await?;
    Ok(envelope(response))
}

#[derive(Debug, Deserialize)]
struct QueueStatusQuery {
    #[serde(default)]
    batch_id: Option<String>,
}

async fn get_queue_status(
    State(state): State<AppState>,
    ctx: StoreContext,
    Query(query): Query<QueueStatusQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = state
        .service
        .get_queue_status(&ctx, query.batch_id.as_deref())
        .await?;
    Ok(envelope(response))
}

#[derive(Debug, Deserialize)]
struct RequeueRequest {
    #[serde(default)]
    batch_id: Option<String>,
}

async fn requeue_failed(
    State(state): State<AppState>,
    ctx: StoreContext,
    ApiJson(request): ApiJson<RequeueRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requeued = state
        .service
        .requeue_failed(&ctx, request.batch_id.as_deref())
        .await?;
    Ok(envelope(json!({ "requeued_count": requeued })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;

    fn json_request(body: &str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/api/v1/sync/batch")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_through_the_envelope() {
        let err = ApiJson::<BatchRequest>::from_request(json_request("not json"), &())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "bad_request");
    }

    #[tokio::test]
    async fn unknown_enum_value_reports_the_offending_field() {
        let body = r#"{"items": [{
            "idempotency_key": "k-1",
            "sync_type": "invoice",
            "operation": "create",
            "entity_type": "invoice",
            "data": {}
        }]}"#;
        let err = ApiJson::<BatchRequest>::from_request(json_request(body), &())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("sync_type"), "message: {}", err.message);
    }

    #[tokio::test]
    async fn missing_required_field_is_a_bad_request() {
        let body = r#"{"items": [{"sync_type": "order", "operation": "create"}]}"#;
        let err = ApiJson::<BatchRequest>::from_request(json_request(body), &())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn well_formed_body_parses() {
        let body = r#"{"batch_id": "b-1", "items": [{
            "idempotency_key": "k-1",
            "sync_type": "order",
            "operation": "create",
            "entity_type": "order",
            "data": {"fields": {"total_amount": "10"}}
        }]}"#;
        let ApiJson(request) = ApiJson::<BatchRequest>::from_request(json_request(body), &())
            .await
            .unwrap();
        assert_eq!(request.batch_id.as_deref(), Some("b-1"));
        assert_eq!(request.items.len(), 1);
    }

    #[tokio::test]
    async fn store_context_requires_a_valid_store_header() {
        let (mut parts, _) = json_request("{}").into_parts();
        let err = StoreContext::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/v1/sync/batch")
            .header("x-store-id", "not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let (mut parts, _) = request.into_parts();
        let err = StoreContext::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
