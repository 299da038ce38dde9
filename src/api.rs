//! Entitlement HTTP API
//!
//! Endpoints:
//! - GET /v1/health - Liveness
//! - GET /v1/tiers - Active tier limit table
//! - GET /v1/quota/:user_id - Usage snapshot
//! - POST /v1/quota/check - Read-only quota check (200 even when denied)
//! - POST /v1/quota/consume - Consume one unit (402 when denied)
//! - GET /v1/nutrition/access/:user_id - Nutrition access status
//! - POST /v1/nutrition/access/regenerate - Start a new nutrition window
//! - POST /v1/nutrition/access/unlock - Remove any nutrition lock
//! - POST /v1/nutrition/access/extend - Extend a freemium window
//! - POST /v1/nutrition/access/revoke - Close a freemium window now
//! - GET /v1/nutrition/stats - Per-tier nutrition access counts
//! - POST /v1/events - Billing / content collaborator events

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::evaluator::{QuotaAction, QuotaEvaluation, Remaining};
use crate::events::EntitlementEvent;
use crate::limits::TierLimitTable;
use crate::nutrition::{NutritionAccessStats, NutritionPayload};
use crate::record::{QuotaSnapshot, UsageSnapshot};
use crate::service::{QuotaService, ServiceError};
use crate::store::StoreError;
use crate::tier::SubscriptionTier;

/// Shared application state
pub struct AppState {
    pub service: QuotaService,
}

impl AppState {
    pub fn new(service: QuotaService) -> Self {
        Self { service }
    }
}

/// Create API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health_check))
        .route("/v1/tiers", get(get_tiers))
        .route("/v1/quota/:user_id", get(get_quota))
        .route("/v1/quota/check", post(check_quota))
        .route("/v1/quota/consume", post(consume_quota))
        .route("/v1/nutrition/access/:user_id", get(get_nutrition_access))
        .route("/v1/nutrition/access/regenerate", post(regenerate_nutrition_access))
        .route("/v1/nutrition/access/unlock", post(unlock_nutrition_access))
        .route("/v1/nutrition/access/extend", post(extend_nutrition_access))
        .route("/v1/nutrition/access/revoke", post(revoke_nutrition_access))
        .route("/v1/nutrition/stats", get(get_nutrition_stats))
        .route("/v1/events", post(handle_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
            retryable: false,
        }),
    )
}

fn service_error(e: ServiceError) -> ApiError {
    let status = match &e {
        ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ServiceError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Storage(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        ServiceError::Storage(StoreError::Unavailable(_)) | ServiceError::Storage(StoreError::Conflict(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ServiceError::Storage(StoreError::Corrupt(_)) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            retryable: e.is_retryable(),
            error: e.to_string(),
        }),
    )
}

fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

fn parse_action(action: &str) -> Result<QuotaAction, ApiError> {
    action.parse().map_err(bad_request)
}

// === Handlers ===

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "Entitlement Engine".to_string(),
        version: crate::VERSION.to_string(),
    })
}

async fn get_tiers(State(state): State<Arc<AppState>>) -> Json<TierLimitTable> {
    Json(state.service.limits().clone())
}

async fn get_quota(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<QuotaSnapshot> {
    let snapshot = state.service.snapshot(&user_id).await.map_err(service_error)?;
    Ok(Json(snapshot))
}

async fn check_quota(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<QuotaRequest>, JsonRejection>,
) -> ApiResult<QuotaEvaluation> {
    let request = parse_body(payload)?;
    let action = parse_action(&request.action)?;
    let evaluation = state
        .service
        .check_only(&request.user_id, action)
        .await
        .map_err(service_error)?;
    Ok(Json(evaluation))
}

async fn consume_quota(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<QuotaRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = parse_body(payload)?;
    let action = parse_action(&request.action)?;
    let result = state
        .service
        .consume_detailed_at(&request.user_id, action, Utc::now())
        .await
        .map_err(service_error)?;

    if result.evaluation.allowed {
        return Ok(Json(result.evaluation).into_response());
    }

    let record = result.record;
    let body = UpgradeRequired {
        error: "upgrade_required".to_string(),
        reason: result.evaluation.reason.unwrap_or_default(),
        remaining: result.evaluation.remaining,
        current_tier: record.tier,
        required_tier: state.service.required_tier(&record, action),
        usage: record.snapshot(state.service.limits().get(record.tier)).usage,
    };
    Ok((StatusCode::PAYMENT_REQUIRED, Json(body)).into_response())
}

async fn get_nutrition_access(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<NutritionPayload> {
    let payload = state
        .service
        .get_nutrition_access(&user_id)
        .await
        .map_err(service_error)?;
    Ok(Json(payload))
}

async fn regenerate_nutrition_access(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegenerateRequest>, JsonRejection>,
) -> ApiResult<NutritionPayload> {
    let request = parse_body(payload)?;
    let now = Utc::now();
    let record = state
        .service
        .regenerate_nutrition_access_at(&request.user_id, request.tier, now)
        .await
        .map_err(service_error)?;
    Ok(Json(state.service.nutrition_payload(&record, now)))
}

async fn unlock_nutrition_access(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UserRequest>, JsonRejection>,
) -> ApiResult<NutritionPayload> {
    let request = parse_body(payload)?;
    let now = Utc::now();
    let record = state
        .service
        .unlock_nutrition_access_at(&request.user_id, now)
        .await
        .map_err(service_error)?;
    Ok(Json(state.service.nutrition_payload(&record, now)))
}

async fn extend_nutrition_access(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExtendRequest>, JsonRejection>,
) -> ApiResult<NutritionPayload> {
    let request = parse_body(payload)?;
    let now = Utc::now();
    let record = state
        .service
        .extend_nutrition_window_at(&request.user_id, request.days, now)
        .await
        .map_err(service_error)?;
    Ok(Json(state.service.nutrition_payload(&record, now)))
}

async fn revoke_nutrition_access(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UserRequest>, JsonRejection>,
) -> ApiResult<NutritionPayload> {
    let request = parse_body(payload)?;
    let now = Utc::now();
    let record = state
        .service
        .revoke_nutrition_access_at(&request.user_id, now)
        .await
        .map_err(service_error)?;
    Ok(Json(state.service.nutrition_payload(&record, now)))
}

async fn get_nutrition_stats(State(state): State<Arc<AppState>>) -> ApiResult<Vec<NutritionAccessStats>> {
    let stats = state.service.nutrition_access_stats().await.map_err(service_error)?;
    Ok(Json(stats))
}

async fn handle_event(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EntitlementEvent>, JsonRejection>,
) -> ApiResult<QuotaSnapshot> {
    let event = parse_body(payload)?;
    let record = state.service.handle_event(event).await.map_err(service_error)?;
    Ok(Json(record.snapshot(state.service.limits().get(record.tier))))
}

// === Request/Response types ===

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

/// 402 body for a denied consume
#[derive(Debug, Serialize, Deserialize)]
pub struct UpgradeRequired {
    pub error: String,
    pub reason: String,
    pub remaining: Remaining,
    pub current_tier: SubscriptionTier,
    /// Lowest tier that would allow the action; `None` when no tier does
    pub required_tier: Option<SubscriptionTier>,
    pub usage: UsageSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuotaRequest {
    pub user_id: String,
    pub action: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegenerateRequest {
    pub user_id: String,
    #[serde(default)]
    pub tier: Option<SubscriptionTier>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtendRequest {
    pub user_id: String,
    pub days: u32,
}
