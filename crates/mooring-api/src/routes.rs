use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use http::header::HeaderName;
use mooring_core::models::{ConflictResolution, NewOperation, OperationType};
use mooring_core::sync::{
    ApplyOutcome, CleanupReport, DeltaRequest, DeltaResponse, SubmitOutcome, SyncStatus,
    VersionedUpdate,
};
use mooring_core::util::fingerprint;
use mooring_core::{EntityId, EntityKind, LockVersion, OperationId, Replayable, SyncService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, verify_internal_key, AuthenticatedClient, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{EndpointRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot};

pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");
pub const IDEMPOTENT_REPLAYED: HeaderName = HeaderName::from_static("idempotent-replayed");

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
const SECS_PER_DAY: u64 = 86_400;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    service: SyncService,
    jwt_verifier: Arc<JwtVerifier>,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, service: SyncService) -> Self {
        Self {
            jwt_verifier: Arc::new(JwtVerifier::new(config.clone())),
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            service,
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let client_routes = Router::new()
        .route("/sync/delta", post(delta_sync))
        .route("/sync/operations", post(submit_operation))
        .route("/sync/status", get(sync_status))
        .route(
            "/entities/{entity_type}/{entity_id}/versioned-update",
            post(versioned_update),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let internal_routes = Router::new()
        .route("/operations/{operation_id}/apply", post(apply_operation))
        .route("/operations/{operation_id}/resolve", post(resolve_operation))
        .route("/cleanup", post(cleanup))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_key,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", client_routes)
        .nest("/internal", internal_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let client = state.jwt_verifier.verify_access_token(token)?;
    request.extensions_mut().insert(client);
    Ok(next.run(request).await)
}

async fn require_internal_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    verify_internal_key(request.headers(), &state.config.internal_api_key)?;
    Ok(next.run(request).await)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaSyncBody {
    #[serde(default)]
    entity_types: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn delta_sync(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
    Json(body): Json<DeltaSyncBody>,
) -> Result<Json<DeltaResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::DeltaSync, &client.client_id)
        .await?;

    let entity_types = parse_kinds(&body.entity_types)?;
    let request = DeltaRequest {
        entity_types,
        limit: body.limit,
    };
    let response = state.service.delta_sync(&client.client_id, request).await?;
    tracing::info!(
        endpoint = "delta_sync",
        client = fingerprint(&client.client_id),
        session = client.session_id.as_deref().unwrap_or("none"),
        total_changes = response.stats.total_changes,
        has_more = response.has_more(),
        "Served delta"
    );
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitOperationBody {
    op_type: OperationType,
    entity_type: String,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    payload: Value,
    client_timestamp: i64,
}

async fn submit_operation(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
    headers: HeaderMap,
    Json(body): Json<SubmitOperationBody>,
) -> Result<Response, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::Write, &client.client_id)
        .await?;

    let idempotency_key = idempotency_key(&headers)?;
    let operation = NewOperation {
        client_id: client.client_id.clone(),
        op_type: body.op_type,
        entity_kind: body.entity_type.parse::<EntityKind>()?,
        entity_id: body
            .entity_id
            .as_deref()
            .map(str::parse::<EntityId>)
            .transpose()?,
        payload: body.payload,
        client_timestamp: body.client_timestamp,
    };

    let outcome: Replayable<SubmitOutcome> = state
        .service
        .submit_operation(operation, idempotency_key)
        .await?;
    tracing::info!(
        endpoint = "submit_operation",
        client = fingerprint(&client.client_id),
        operation_id = %outcome.value.operation_id,
        accepted = outcome.value.accepted,
        replayed = outcome.replayed,
        "Accepted pending operation"
    );
    Ok(replayable_response(StatusCode::OK, outcome))
}

async fn sync_status(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
) -> Result<Json<SyncStatus>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::DeltaSync, &client.client_id)
        .await?;

    Ok(Json(state.service.sync_status(&client.client_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionedUpdateBody {
    expected_version: LockVersion,
    changes: Value,
}

async fn versioned_update(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<VersionedUpdateBody>,
) -> Result<Response, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::Write, &client.client_id)
        .await?;

    let kind = entity_type.parse::<EntityKind>()?;
    let id = entity_id.parse::<EntityId>()?;
    let idempotency_key = idempotency_key(&headers)?;

    if let Some(existing) = state.service.get_entity(kind, id.clone()).await? {
        if existing.owner_id != client.client_id {
            return Err(AppError::forbidden("Entity belongs to another client"));
        }
    }

    let outcome = state
        .service
        .update_with_version_check(
            &client.client_id,
            kind,
            id,
            body.expected_version,
            body.changes,
            idempotency_key,
        )
        .await?;
    let status = match outcome.value {
        VersionedUpdate::Updated { .. } => StatusCode::OK,
        VersionedUpdate::VersionConflict { .. } => StatusCode::CONFLICT,
        VersionedUpdate::NotFound => StatusCode::NOT_FOUND,
    };
    tracing::info!(
        endpoint = "versioned_update",
        client = fingerprint(&client.client_id),
        entity_type = kind.as_str(),
        success = outcome.value.is_success(),
        replayed = outcome.replayed,
        "Handled versioned update"
    );
    Ok(replayable_response(status, outcome))
}

async fn apply_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<Json<ApplyOutcome>, AppError> {
    let operation_id = operation_id.parse::<OperationId>()?;
    Ok(Json(state.service.apply_operation(operation_id).await?))
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    strategy: ConflictResolution,
}

async fn resolve_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<ApplyOutcome>, AppError> {
    let operation_id = operation_id.parse::<OperationId>()?;
    Ok(Json(
        state
            .service
            .resolve_operation(operation_id, body.strategy)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupBody {
    #[serde(default)]
    retention_days: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanupResponse {
    abandoned_operations: usize,
    #[serde(flatten)]
    report: CleanupReport,
}

async fn cleanup(
    State(state): State<AppState>,
    body: Option<Json<CleanupBody>>,
) -> Result<Json<CleanupResponse>, AppError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let settings = state.service.settings();
    let retention = match body.retention_days {
        Some(0) => return Err(AppError::bad_request("retentionDays must be at least 1")),
        Some(days) => Duration::from_secs(days.saturating_mul(SECS_PER_DAY)),
        None => settings.retention,
    };
    let abandon_after = settings.abandon_after;

    let abandoned_operations = state.service.abandon_stale(abandon_after).await?;
    let report = state.service.cleanup(retention).await?;
    Ok(Json(CleanupResponse {
        abandoned_operations,
        report,
    }))
}

fn parse_kinds(names: &[String]) -> Result<Vec<EntityKind>, AppError> {
    names
        .iter()
        .map(|name| name.parse::<EntityKind>().map_err(AppError::from))
        .collect()
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(&IDEMPOTENCY_KEY) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| AppError::bad_request("Idempotency-Key must be visible ASCII"))?
        .trim();
    if key.is_empty() {
        return Ok(None);
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(AppError::bad_request(format!(
            "Idempotency-Key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    Ok(Some(key.to_string()))
}

fn replayable_response<T: Serialize>(status: StatusCode, outcome: Replayable<T>) -> Response {
    let mut response = (status, Json(outcome.value)).into_response();
    if outcome.replayed {
        response
            .headers_mut()
            .insert(IDEMPOTENT_REPLAYED, HeaderValue::from_static("true"));
    }
    response
}
