use std::net::SocketAddr;

use crate::{
    app_state::AppState,
    auth::{extract_bearer, require_caller, require_device, DeviceIdentity},
    error::{ApiResult, AppError},
    metrics::HttpMetricsLayer,
    persistence as db,
    services::{
        self,
        credentials::VerifiedCredential,
        sessions::RequestContext,
    },
};
use axum::{
    body::Body,
    extract::{ConnectInfo, Extension, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    Json, Router,
};
use chrono::{DateTime, Utc};
use common::api;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::warn;
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use uuid::Uuid;

mod agent;
mod auth;
mod commands;
mod devices;
mod error_mapper;
mod system;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Permission names enforced on the caller channel.
pub mod permissions {
    pub const CREDENTIALS_MANAGE: &str = "credentials.manage";
    pub const DEVICES_REGISTER: &str = "devices.register";
    pub const DEVICES_READ: &str = "devices.read";
    pub const DEVICES_WRITE: &str = "devices.write";
    pub const COMMANDS_CREATE: &str = "commands.create";
    pub const COMMANDS_READ: &str = "commands.read";
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub(crate) struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub dirty: bool,
    pub built_at: &'static str,
    pub schema_version: Option<i64>,
    pub target_schema_version: Option<i64>,
    pub pending_migrations: usize,
}

pub fn build_router(state: AppState) -> Router<AppState> {
    let request_id_header =
        axum::http::HeaderName::from_static(REQUEST_ID_HEADER);
    let middleware_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            request_id_header.clone(),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header))
        .layer(HttpMetricsLayer)
        .layer(RequestBodyLimitLayer::new(
            state.limits.request_body_bytes as usize,
        ));

    Router::<AppState>::new()
        .merge(system::router())
        .merge(auth::router(state.clone()))
        .merge(devices::router(state.clone()))
        .merge(commands::router(state.clone()))
        .merge(agent::router(state))
        .layer(middleware_stack)
}

pub fn build_metrics_router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/metrics", axum::routing::get(metrics))
        .route("/healthz", axum::routing::get(healthz))
}

fn context_from(parts: &Parts) -> RequestContext {
    RequestContext {
        ip_address: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string()),
        user_agent: parts
            .headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string()),
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Health check", body = HealthResponse)),
    tag = "system"
)]
pub(crate) async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: crate::version::VERSION,
            git_sha: crate::version::GIT_SHA,
            dirty: crate::version::GIT_DIRTY,
            built_at: crate::version::BUILD_TIMESTAMP,
            schema_version: state.schema.latest_applied,
            target_schema_version: state.schema.latest_available,
            pending_migrations: state.schema.pending.len(),
        }),
    )
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain")),
    tag = "system"
)]
pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateKeyRequest {
    pub name: String,
    pub caller_class: api::CallerClass,
    /// Caller-chosen secret; only its hash is stored.
    pub secret: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Days until expiry; absent means no expiry.
    #[serde(default)]
    pub expires_in_days: Option<u32>,
}

impl From<CreateKeyRequest> for services::credentials::CreateCredentialRequest {
    fn from(value: CreateKeyRequest) -> Self {
        Self {
            name: value.name,
            caller_class: value.caller_class,
            secret: value.secret,
            permissions: value.permissions,
            expires_in_days: value.expires_in_days,
        }
    }
}

#[derive(Clone, Deserialize, utoipa::ToSchema)]
pub(crate) struct UpdateKeyRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: Option<Vec<String>>,
    #[serde(default)]
    pub active: Option<bool>,
    /// Present-and-null clears the expiry; absent leaves it untouched.
    #[serde(
        default,
        deserialize_with = "deserialize_expiry_patch"
    )]
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

fn deserialize_expiry_patch<'de, D>(
    de: D,
) -> std::result::Result<Option<Option<DateTime<Utc>>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<DateTime<Utc>>::deserialize(de).map(Some)
}

impl From<UpdateKeyRequest> for services::credentials::UpdateCredentialRequest {
    fn from(value: UpdateKeyRequest) -> Self {
        Self {
            name: value.name,
            permissions: value.permissions,
            active: value.active,
            expires_at: value.expires_at,
        }
    }
}

#[derive(Clone, Deserialize, utoipa::IntoParams)]
pub(crate) struct ListKeysQuery {
    pub caller_class: Option<api::CallerClass>,
    pub active: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/keys",
    request_body = CreateKeyRequest,
    responses(
        (status = 201, description = "Credential created; key shown once", body = api::CredentialCreated),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 409, description = "Name already exists", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "auth"
)]
pub(crate) async fn create_key(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Json(req): Json<CreateKeyRequest>,
) -> ApiResult<(StatusCode, Json<api::CredentialCreated>)> {
    crate::auth::require_class(&caller, &[api::CallerClass::Web])?;
    crate::auth::require_permission(&caller, permissions::CREDENTIALS_MANAGE)?;

    let created = services::credentials::create_credential(&state, req.into()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/keys",
    params(ListKeysQuery),
    responses(
        (status = 200, description = "Credential page", body = api::CredentialPage),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "auth"
)]
pub(crate) async fn list_keys(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Query(query): Query<ListKeysQuery>,
) -> ApiResult<Json<api::CredentialPage>> {
    crate::auth::require_class(&caller, &[api::CallerClass::Web])?;
    crate::auth::require_permission(&caller, permissions::CREDENTIALS_MANAGE)?;

    let page = services::credentials::list_credentials(
        &state,
        services::credentials::ListCredentialsRequest {
            caller_class: query.caller_class,
            active: query.active,
            limit: crate::validation::clamp_list_limit(query.limit, &state.limits),
            offset: query.offset.unwrap_or(0),
        },
    )
    .await?;
    Ok(Json(page))
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/keys/{key_id}",
    params(("key_id" = Uuid, Path, description = "Credential id")),
    responses(
        (status = 200, description = "Credential", body = api::CredentialSummary),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "auth"
)]
pub(crate) async fn get_key(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<api::CredentialSummary>> {
    crate::auth::require_class(&caller, &[api::CallerClass::Web])?;
    crate::auth::require_permission(&caller, permissions::CREDENTIALS_MANAGE)?;

    let summary = services::credentials::get_credential(&state, key_id).await?;
    Ok(Json(summary))
}

#[utoipa::path(
    put,
    path = "/api/v1/auth/keys/{key_id}",
    params(("key_id" = Uuid, Path, description = "Credential id")),
    request_body = UpdateKeyRequest,
    responses(
        (status = 200, description = "Updated credential", body = api::CredentialSummary),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Name already exists", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "auth"
)]
pub(crate) async fn update_key(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Path(key_id): Path<Uuid>,
    Json(req): Json<UpdateKeyRequest>,
) -> ApiResult<Json<api::CredentialSummary>> {
    crate::auth::require_class(&caller, &[api::CallerClass::Web])?;
    crate::auth::require_permission(&caller, permissions::CREDENTIALS_MANAGE)?;

    let summary = services::credentials::update_credential(&state, key_id, req.into()).await?;
    Ok(Json(summary))
}

#[utoipa::path(
    delete,
    path = "/api/v1/auth/keys/{key_id}",
    params(("key_id" = Uuid, Path, description = "Credential id")),
    responses(
        (status = 204, description = "Credential deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "auth"
)]
pub(crate) async fn delete_key(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Path(key_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    crate::auth::require_class(&caller, &[api::CallerClass::Web])?;
    crate::auth::require_permission(&caller, permissions::CREDENTIALS_MANAGE)?;

    services::credentials::delete_credential(&state, key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize, utoipa::ToSchema)]
pub(crate) struct LoginRequest {
    pub key: String,
    pub secret: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/sessions",
    request_body = LoginRequest,
    responses(
        (status = 201, description = "Session opened; token shown once", body = api::SessionCreated),
        (status = 401, description = "Authentication failed", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub(crate) async fn login(
    State(state): State<AppState>,
    parts: Parts,
    Json(req): Json<LoginRequest>,
) -> ApiResult<(StatusCode, Json<api::SessionCreated>)> {
    let ctx = context_from(&parts);
    let session = services::sessions::login(
        &state,
        services::sessions::LoginRequest {
            key: req.key,
            secret: req.secret,
            device_id: req.device_id,
        },
        ctx,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/sessions/refresh",
    responses(
        (status = 200, description = "Session extended", body = api::SessionCreated),
        (status = 401, description = "Session invalid or expired", body = ErrorResponse)
    ),
    security(("sessionBearer" = [])),
    tag = "auth"
)]
pub(crate) async fn refresh_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<api::SessionCreated>> {
    let token = extract_bearer(&headers).ok_or_else(AppError::unauthorized)?;
    let session = services::sessions::refresh(&state, &token).await?;
    Ok(Json(session))
}

#[utoipa::path(
    delete,
    path = "/api/v1/auth/sessions",
    responses(
        (status = 204, description = "Session closed"),
        (status = 401, description = "Missing bearer token", body = ErrorResponse)
    ),
    security(("sessionBearer" = [])),
    tag = "auth"
)]
pub(crate) async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let token = extract_bearer(&headers).ok_or_else(AppError::unauthorized)?;
    services::sessions::logout(&state, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Clone, Deserialize, utoipa::IntoParams)]
pub(crate) struct ListSessionsQuery {
    pub credential_id: Option<Uuid>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/sessions",
    params(ListSessionsQuery),
    responses(
        (status = 200, description = "Active session page", body = api::SessionPage),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "auth"
)]
pub(crate) async fn list_sessions(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<api::SessionPage>> {
    crate::auth::require_class(&caller, &[api::CallerClass::Web])?;
    crate::auth::require_permission(&caller, permissions::CREDENTIALS_MANAGE)?;

    let page = services::sessions::list_active(
        &state,
        query.credential_id,
        crate::validation::clamp_list_limit(query.limit, &state.limits),
        query.offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(page))
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize, utoipa::ToSchema)]
pub(crate) struct RegisterDeviceRequest {
    pub hostname: String,
    pub address: String,
    pub os_type: String,
    pub os_version: String,
    pub agent_version: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl From<RegisterDeviceRequest> for services::devices::RegisterDeviceRequest {
    fn from(value: RegisterDeviceRequest) -> Self {
        Self {
            hostname: value.hostname,
            address: value.address,
            os_type: value.os_type,
            os_version: value.os_version,
            agent_version: value.agent_version,
            metadata: value.metadata.unwrap_or_else(|| serde_json::json!({})),
        }
    }
}

#[derive(Clone, Deserialize, utoipa::ToSchema)]
pub(crate) struct UpdateDeviceRequest {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
}

#[derive(Clone, Deserialize, utoipa::IntoParams)]
pub(crate) struct ListDevicesQuery {
    pub status: Option<api::DeviceStatus>,
    pub os_type: Option<String>,
    /// One of `created_at`, `last_seen_at`, `hostname`.
    pub sort: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[utoipa::path(
    post,
    path = "/api/v1/devices/register",
    request_body = RegisterDeviceRequest,
    responses(
        (status = 201, description = "Device registered; token present on first registration only", body = api::DeviceRegistered),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "devices"
)]
pub(crate) async fn register_device(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    parts: Parts,
    Json(req): Json<RegisterDeviceRequest>,
) -> ApiResult<(StatusCode, Json<api::DeviceRegistered>)> {
    crate::auth::require_permission(&caller, permissions::DEVICES_REGISTER)?;

    let ctx = context_from(&parts);
    let registered = services::devices::register_device(&state, req.into(), ctx).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

#[utoipa::path(
    get,
    path = "/api/v1/devices",
    params(ListDevicesQuery),
    responses(
        (status = 200, description = "Device page", body = api::DeviceSummaryPage),
        (status = 400, description = "Invalid sort column", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "devices"
)]
pub(crate) async fn list_devices(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Query(query): Query<ListDevicesQuery>,
) -> ApiResult<Json<api::DeviceSummaryPage>> {
    crate::auth::require_permission(&caller, permissions::DEVICES_READ)?;

    let sort = match query.sort.as_deref() {
        None => db::DeviceSortColumn::CreatedAt,
        Some(raw) => db::DeviceSortColumn::parse(raw)
            .ok_or_else(|| AppError::bad_request("unknown sort column"))?,
    };

    let page = services::devices::list_devices(
        &state,
        services::devices::ListDevicesRequest {
            status: query.status.map(Into::into),
            os_type: query.os_type,
            sort,
            limit: crate::validation::clamp_list_limit(query.limit, &state.limits),
            offset: query.offset.unwrap_or(0),
        },
    )
    .await?;
    Ok(Json(page))
}

#[utoipa::path(
    get,
    path = "/api/v1/devices/statistics",
    responses(
        (status = 200, description = "Fleet statistics", body = api::FleetStatistics),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "devices"
)]
pub(crate) async fn device_statistics(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
) -> ApiResult<Json<api::FleetStatistics>> {
    crate::auth::require_permission(&caller, permissions::DEVICES_READ)?;

    let stats = services::liveness::fleet_statistics(&state).await?;
    Ok(Json(stats))
}

#[utoipa::path(
    get,
    path = "/api/v1/devices/{device_id}",
    params(("device_id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Device", body = api::DeviceSummary),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "devices"
)]
pub(crate) async fn get_device(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<api::DeviceSummary>> {
    crate::auth::require_permission(&caller, permissions::DEVICES_READ)?;

    let summary = services::devices::get_device(&state, &device_id).await?;
    Ok(Json(summary))
}

#[utoipa::path(
    put,
    path = "/api/v1/devices/{device_id}",
    params(("device_id" = String, Path, description = "Device id")),
    request_body = UpdateDeviceRequest,
    responses(
        (status = 200, description = "Updated device", body = api::DeviceSummary),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "devices"
)]
pub(crate) async fn update_device(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Path(device_id): Path<String>,
    Json(req): Json<UpdateDeviceRequest>,
) -> ApiResult<Json<api::DeviceSummary>> {
    crate::auth::require_permission(&caller, permissions::DEVICES_WRITE)?;

    let max = state.limits.max_field_len;
    crate::validation::validate_opt_str("hostname", req.hostname.as_deref(), max)?;
    crate::validation::validate_opt_str("os_type", req.os_type.as_deref(), max)?;
    crate::validation::validate_opt_str("os_version", req.os_version.as_deref(), max)?;
    crate::validation::validate_opt_str("agent_version", req.agent_version.as_deref(), max)?;

    let changed = db::devices::update_display_fields(
        &state.db,
        &device_id,
        req.hostname.as_deref(),
        req.os_type.as_deref(),
        req.os_version.as_deref(),
        req.agent_version.as_deref(),
    )
    .await?;
    if changed == 0 {
        return Err(AppError::not_found("device not found"));
    }

    let summary = services::devices::get_device(&state, &device_id).await?;
    Ok(Json(summary))
}

#[utoipa::path(
    delete,
    path = "/api/v1/devices/{device_id}",
    params(("device_id" = String, Path, description = "Device id")),
    responses(
        (status = 204, description = "Device deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "devices"
)]
pub(crate) async fn delete_device(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Path(device_id): Path<String>,
) -> ApiResult<StatusCode> {
    crate::auth::require_class(&caller, &[api::CallerClass::Web, api::CallerClass::Internal])?;
    crate::auth::require_permission(&caller, permissions::DEVICES_WRITE)?;

    services::devices::delete_device(&state, &device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/v1/devices/{device_id}/liveness",
    params(("device_id" = String, Path, description = "Device id")),
    responses(
        (status = 200, description = "Liveness report", body = api::LivenessReport),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "devices"
)]
pub(crate) async fn device_liveness(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<api::LivenessReport>> {
    crate::auth::require_permission(&caller, permissions::DEVICES_READ)?;

    let report = services::liveness::liveness_report(&state, &device_id).await?;
    Ok(Json(report))
}

#[derive(Clone, Deserialize, utoipa::IntoParams)]
pub(crate) struct DeviceCommandsQuery {
    pub status: Option<api::CommandStatus>,
    pub limit: Option<u32>,
}

#[utoipa::path(
    get,
    path = "/api/v1/devices/{device_id}/commands",
    params(
        ("device_id" = String, Path, description = "Device id"),
        DeviceCommandsQuery
    ),
    responses(
        (status = 200, description = "Commands for the device, newest first", body = [api::CommandView]),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "commands"
)]
pub(crate) async fn list_device_commands(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Path(device_id): Path<String>,
    Query(query): Query<DeviceCommandsQuery>,
) -> ApiResult<Json<Vec<api::CommandView>>> {
    crate::auth::require_permission(&caller, permissions::COMMANDS_READ)?;

    let views = services::commands::list_commands_for_device(
        &state,
        &device_id,
        query.status,
        crate::validation::clamp_list_limit(query.limit, &state.limits),
    )
    .await?;
    Ok(Json(views))
}

// ---------------------------------------------------------------------------
// Agent channel
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize, utoipa::ToSchema)]
pub(crate) struct HeartbeatRequest {
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
}

#[utoipa::path(
    post,
    path = "/api/v1/devices/{device_id}/heartbeat",
    params(("device_id" = String, Path, description = "Device id")),
    request_body = HeartbeatRequest,
    responses(
        (status = 200, description = "Heartbeat accepted", body = api::HeartbeatAck),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Path and token identity mismatch", body = ErrorResponse)
    ),
    security(("deviceToken" = [])),
    tag = "agent"
)]
pub(crate) async fn heartbeat(
    State(state): State<AppState>,
    Extension(device): Extension<DeviceIdentity>,
    Path(device_id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<api::HeartbeatAck>> {
    if device.device_id != device_id {
        return Err(AppError::forbidden("device token does not match path"));
    }

    let ack = services::liveness::process_heartbeat(
        &state,
        &device_id,
        services::liveness::HeartbeatRequest {
            metadata: req.metadata,
            metrics: req.metrics,
        },
    )
    .await?;
    Ok(Json(ack))
}

#[derive(Clone, Default, Deserialize, utoipa::ToSchema, utoipa::IntoParams)]
pub(crate) struct PullRequest {
    /// Claim batch size; capped by the server default.
    #[serde(default)]
    pub batch: Option<u32>,
}

#[utoipa::path(
    post,
    path = "/api/v1/commands/pull",
    request_body = PullRequest,
    responses(
        (status = 200, description = "Claimed commands, oldest first", body = [api::CommandView]),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("deviceToken" = [])),
    tag = "agent"
)]
pub(crate) async fn pull_commands(
    State(state): State<AppState>,
    Extension(device): Extension<DeviceIdentity>,
    body: Option<Json<PullRequest>>,
) -> ApiResult<Json<Vec<api::CommandView>>> {
    let batch = body.and_then(|Json(req)| req.batch);
    let views = services::commands::claim_commands(&state, &device.device_id, batch).await?;
    Ok(Json(views))
}

#[utoipa::path(
    get,
    path = "/api/v1/commands/pull",
    params(PullRequest),
    responses(
        (status = 200, description = "Newline-delimited JSON stream of claimed commands", content_type = "application/x-ndjson"),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    security(("deviceToken" = [])),
    tag = "agent"
)]
pub(crate) async fn stream_commands(
    State(state): State<AppState>,
    Extension(device): Extension<DeviceIdentity>,
    Query(query): Query<PullRequest>,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<std::result::Result<String, std::convert::Infallible>>(16);
    let device_id = device.device_id;
    let batch = query.batch;
    let wait = std::time::Duration::from_secs(state.commands.stream_wait_secs.max(1));

    tokio::spawn(async move {
        let notify = state.command_signals.for_device(&device_id);
        loop {
            let views =
                match services::commands::claim_commands(&state, &device_id, batch).await {
                    Ok(views) => views,
                    Err(err) => {
                        warn!(?err, device_id, "command stream claim failed");
                        break;
                    }
                };

            for view in views {
                let line = match serde_json::to_string(&view) {
                    Ok(mut line) => {
                        line.push('\n');
                        line
                    }
                    Err(err) => {
                        warn!(?err, device_id, "failed to encode command for stream");
                        continue;
                    }
                };
                // A closed receiver means the agent hung up.
                if tx.send(Ok(line)).await.is_err() {
                    return;
                }
            }

            // Wake on enqueue, or poll as a safety net.
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }

            if tx.is_closed() {
                return;
            }
        }
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Clone, Deserialize, utoipa::ToSchema)]
pub(crate) struct ReportResultRequest {
    pub status: api::CommandStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/api/v1/commands/{command_id}/result",
    params(("command_id" = Uuid, Path, description = "Command id")),
    request_body = ReportResultRequest,
    responses(
        (status = 200, description = "Result recorded, or ignored when already terminal", body = api::ResultAck),
        (status = 400, description = "Non-terminal status", body = ErrorResponse),
        (status = 403, description = "Command belongs to another device", body = ErrorResponse),
        (status = 404, description = "Unknown command", body = ErrorResponse)
    ),
    security(("deviceToken" = [])),
    tag = "agent"
)]
pub(crate) async fn report_result(
    State(state): State<AppState>,
    Extension(device): Extension<DeviceIdentity>,
    Path(command_id): Path<Uuid>,
    Json(req): Json<ReportResultRequest>,
) -> ApiResult<Json<api::ResultAck>> {
    let ack = services::commands::report_result(
        &state,
        &device.device_id,
        command_id,
        services::commands::ReportResultRequest {
            status: req.status,
            exit_code: req.exit_code,
            stdout: req.stdout,
            stderr: req.stderr,
            duration_ms: req.duration_ms,
        },
    )
    .await?;
    Ok(Json(ack))
}

// ---------------------------------------------------------------------------
// Commands (caller channel)
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateCommandRequest {
    pub device_id: String,
    pub command_type: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

impl From<CreateCommandRequest> for services::commands::CreateCommandRequest {
    fn from(value: CreateCommandRequest) -> Self {
        Self {
            device_id: value.device_id,
            command_type: value.command_type,
            payload: value.payload.unwrap_or_else(|| serde_json::json!({})),
            timeout_seconds: value.timeout_seconds,
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/commands",
    request_body = CreateCommandRequest,
    responses(
        (status = 201, description = "Command enqueued", body = api::CommandCreated),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Unknown device", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "commands"
)]
pub(crate) async fn create_command(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Json(req): Json<CreateCommandRequest>,
) -> ApiResult<(StatusCode, Json<api::CommandCreated>)> {
    crate::auth::require_permission(&caller, permissions::COMMANDS_CREATE)?;

    let created = services::commands::create_command(&state, req.into()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/api/v1/commands/{command_id}",
    params(("command_id" = Uuid, Path, description = "Command id")),
    responses(
        (status = 200, description = "Command", body = api::CommandView),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("sessionBearer" = []), ("apiKey" = [])),
    tag = "commands"
)]
pub(crate) async fn get_command(
    State(state): State<AppState>,
    Extension(caller): Extension<VerifiedCredential>,
    Path(command_id): Path<Uuid>,
) -> ApiResult<Json<api::CommandView>> {
    crate::auth::require_permission(&caller, permissions::COMMANDS_READ)?;

    let view = services::commands::get_command(&state, command_id).await?;
    Ok(Json(view))
}

// ---------------------------------------------------------------------------
// OpenAPI
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        healthz,
        metrics,
        create_key,
        list_keys,
        get_key,
        update_key,
        delete_key,
        login,
        refresh_session,
        logout,
        list_sessions,
        register_device,
        list_devices,
        device_statistics,
        get_device,
        update_device,
        delete_device,
        device_liveness,
        list_device_commands,
        heartbeat,
        pull_commands,
        stream_commands,
        report_result,
        create_command,
        get_command,
    ),
    components(schemas(
        api::CallerClass,
        api::DeviceStatus,
        api::CommandStatus,
        api::DeviceSummary,
        api::DeviceSummaryPage,
        api::DeviceRegistered,
        api::HeartbeatAck,
        api::LivenessReport,
        api::FleetStatistics,
        api::CredentialSummary,
        api::CredentialPage,
        api::CredentialCreated,
        api::SessionCreated,
        api::SessionSummary,
        api::SessionPage,
        api::CommandView,
        api::CommandCreated,
        api::ResultAck,
        CreateKeyRequest,
        UpdateKeyRequest,
        LoginRequest,
        RegisterDeviceRequest,
        UpdateDeviceRequest,
        HeartbeatRequest,
        PullRequest,
        ReportResultRequest,
        CreateCommandRequest,
        HealthResponse,
        ErrorResponse,
    )),
    tags(
        (name = "system", description = "Health and metrics"),
        (name = "auth", description = "Credential management and sessions"),
        (name = "devices", description = "Device registry and liveness"),
        (name = "commands", description = "Command dispatch"),
        (name = "agent", description = "Device agent channel"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.info.title = "Device Fleet Control Plane API".to_string();
        openapi.info.version = crate::version::FULL_VERSION.to_string();

        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_schemes_from_iter([
            (
                "sessionBearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("opaque")
                        .description(Some(
                            "Bearer session token from POST /api/v1/auth/sessions.",
                        ))
                        .build(),
                ),
            ),
            (
                "apiKey",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    crate::auth::HEADER_API_KEY,
                    "API key; pair with the X-Api-Secret header.",
                ))),
            ),
            (
                "deviceToken",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    crate::auth::HEADER_DEVICE_TOKEN,
                    "Device agent token; pair with the X-Device-Id header.",
                ))),
            ),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    mod common {
        use super::*;
        use crate::app_state::CommandSignals;

        pub(super) async fn setup_state() -> AppState {
            let db = crate::persistence::migrations::init_pool("sqlite::memory:")
                .await
                .unwrap();
            let outcome = crate::persistence::migrations::run_migrations(&db)
                .await
                .unwrap();
            let metrics_handle = crate::metrics::init_metrics_recorder();

            AppState {
                db,
                auth: crate::config::AuthConfig {
                    pepper: "test-pepper".to_string(),
                    break_glass: crate::config::BreakGlassConfig::default(),
                },
                sessions: crate::config::SessionConfig {
                    default_ttl_hours: 72,
                    cleanup_interval_secs: 900,
                },
                liveness: crate::config::LivenessConfig {
                    timeout_secs: 300,
                    sweep_interval_secs: 60,
                    heartbeat_interval_secs: 60,
                },
                commands: crate::config::CommandConfig {
                    default_batch: 10,
                    lease_secs: 300,
                    max_retries: 3,
                    lease_sweep_interval_secs: 30,
                    stream_wait_secs: 1,
                },
                limits: crate::config::LimitsConfig::default(),
                metrics_handle,
                schema: outcome.snapshot,
                command_signals: CommandSignals::new(),
            }
        }

        pub(super) fn app(state: AppState) -> Router {
            build_router(state.clone()).with_state(state)
        }

        pub(super) const SEED_SECRET: &str = "ops-secret-0123456789";

        pub(super) async fn seed_web_credential(state: &AppState) -> (String, String) {
            let created = services::credentials::create_credential(
                state,
                services::credentials::CreateCredentialRequest {
                    name: "ops".to_string(),
                    caller_class: api::CallerClass::Web,
                    secret: SEED_SECRET.to_string(),
                    permissions: vec!["*".to_string()],
                    expires_in_days: None,
                },
            )
            .await
            .unwrap();
            (created.key, SEED_SECRET.to_string())
        }

        pub(super) async fn body_json(response: Response) -> serde_json::Value {
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            serde_json::from_slice(&bytes).unwrap()
        }
    }

    fn keyed_request(
        method: &str,
        uri: &str,
        key: &str,
        secret: &str,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(crate::auth::HEADER_API_KEY, key)
            .header(crate::auth::HEADER_API_SECRET, secret)
            .header(axum::http::header::CONTENT_TYPE, "application/json");
        match body {
            Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn healthz_reports_ok_and_schema() {
        let state = common::setup_state().await;
        let app = common::app(state);

        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = common::body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["schema_version"].as_i64().unwrap() >= 1);
        assert_eq!(body["pending_migrations"], 0);
    }

    #[tokio::test]
    async fn unauthenticated_caller_gets_uniform_401() {
        let state = common::setup_state().await;
        let app = common::app(state);

        let response = app
            .oneshot(
                Request::get("/api/v1/devices")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = common::body_json(response).await;
        assert_eq!(body["error"], crate::error::AUTH_FAILED_MESSAGE);
    }

    #[tokio::test]
    async fn wrong_secret_is_indistinguishable_from_unknown_key() {
        let state = common::setup_state().await;
        let (key, _secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let wrong_secret = app
            .clone()
            .oneshot(keyed_request("GET", "/api/v1/devices", &key, "bad", None))
            .await
            .unwrap();
        let unknown_key = app
            .oneshot(keyed_request("GET", "/api/v1/devices", "missing", "bad", None))
            .await
            .unwrap();

        assert_eq!(wrong_secret.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown_key.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            common::body_json(wrong_secret).await,
            common::body_json(unknown_key).await
        );
    }

    #[tokio::test]
    async fn stale_bearer_falls_back_to_api_key() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        // A dead session token alone fails.
        let bearer_only = app
            .clone()
            .oneshot(
                Request::get("/api/v1/devices")
                    .header(axum::http::header::AUTHORIZATION, "Bearer bogus-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bearer_only.status(), StatusCode::UNAUTHORIZED);

        // With the key/secret pair alongside, the caller still gets through.
        let with_key = app
            .oneshot(
                Request::get("/api/v1/devices")
                    .header(axum::http::header::AUTHORIZATION, "Bearer bogus-token")
                    .header(crate::auth::HEADER_API_KEY, &key)
                    .header(crate::auth::HEADER_API_SECRET, &secret)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(with_key.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn short_secret_is_rejected_at_creation() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let response = app
            .oneshot(keyed_request(
                "POST",
                "/api/v1/auth/keys",
                &key,
                &secret,
                Some(json!({
                    "name": "weak",
                    "caller_class": "external",
                    "secret": "short"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn active_sessions_are_listed_without_tokens() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let login = app
            .clone()
            .oneshot(
                Request::post("/api/v1/auth/sessions")
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({"key": key, "secret": secret}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::CREATED);

        let listed = app
            .oneshot(keyed_request(
                "GET",
                "/api/v1/auth/sessions",
                &key,
                &secret,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        let page = common::body_json(listed).await;
        assert_eq!(page["total"], 1);
        let items = page["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0]["credential_id"].is_string());
        assert!(items[0].get("token").is_none());
        assert!(items[0].get("token_hash").is_none());
    }

    #[tokio::test]
    async fn key_lifecycle_create_list_update_delete() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let created = app
            .clone()
            .oneshot(keyed_request(
                "POST",
                "/api/v1/auth/keys",
                &key,
                &secret,
                Some(json!({
                    "name": "integration",
                    "caller_class": "external",
                    "secret": "integration-secret-1",
                    "permissions": ["devices.read"],
                    "expires_in_days": 30
                })),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let created = common::body_json(created).await;
        assert_eq!(created["credential"]["caller_class"], "external");
        assert_eq!(created["key"].as_str().unwrap().len(), 64);
        // Expiry materializes from the day count; the secret is never echoed.
        assert!(created["credential"]["expires_at"].is_string());
        assert!(created.get("secret").is_none());
        let id = created["credential"]["id"].as_str().unwrap().to_string();

        // Duplicate name conflicts.
        let duplicate = app
            .clone()
            .oneshot(keyed_request(
                "POST",
                "/api/v1/auth/keys",
                &key,
                &secret,
                Some(json!({
                    "name": "integration",
                    "caller_class": "external",
                    "secret": "integration-secret-2"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let listed = app
            .clone()
            .oneshot(keyed_request(
                "GET",
                "/api/v1/auth/keys?caller_class=external",
                &key,
                &secret,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        let listed = common::body_json(listed).await;
        assert_eq!(listed["items"].as_array().unwrap().len(), 1);

        let updated = app
            .clone()
            .oneshot(keyed_request(
                "PUT",
                &format!("/api/v1/auth/keys/{id}"),
                &key,
                &secret,
                Some(json!({"active": false})),
            ))
            .await
            .unwrap();
        assert_eq!(updated.status(), StatusCode::OK);
        let updated = common::body_json(updated).await;
        assert_eq!(updated["active"], false);

        let deleted = app
            .oneshot(keyed_request(
                "DELETE",
                &format!("/api/v1/auth/keys/{id}"),
                &key,
                &secret,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn non_web_caller_cannot_manage_keys() {
        let state = common::setup_state().await;
        let (web_key, web_secret) = common::seed_web_credential(&state).await;
        let app = common::app(state.clone());

        let created = services::credentials::create_credential(
            &state,
            services::credentials::CreateCredentialRequest {
                name: "automation".to_string(),
                caller_class: api::CallerClass::Internal,
                secret: "automation-secret-1".to_string(),
                permissions: vec!["*".to_string()],
                expires_in_days: None,
            },
        )
        .await
        .unwrap();

        let denied = app
            .clone()
            .oneshot(keyed_request(
                "GET",
                "/api/v1/auth/keys",
                &created.key,
                "automation-secret-1",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let allowed = app
            .oneshot(keyed_request(
                "GET",
                "/api/v1/auth/keys",
                &web_key,
                &web_secret,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn session_login_grants_bearer_access() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let login = app
            .clone()
            .oneshot(
                Request::post("/api/v1/auth/sessions")
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({"key": key, "secret": secret}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::CREATED);
        let session = common::body_json(login).await;
        let token = session["token"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 128);

        let listed = app
            .clone()
            .oneshot(
                Request::get("/api/v1/devices")
                    .header(
                        axum::http::header::AUTHORIZATION,
                        format!("Bearer {token}"),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);

        let logout = app
            .clone()
            .oneshot(
                Request::delete("/api/v1/auth/sessions")
                    .header(
                        axum::http::header::AUTHORIZATION,
                        format!("Bearer {token}"),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(logout.status(), StatusCode::NO_CONTENT);

        // The token is dead after logout.
        let after = app
            .oneshot(
                Request::get("/api/v1/devices")
                    .header(
                        axum::http::header::AUTHORIZATION,
                        format!("Bearer {token}"),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn registration_is_idempotent_and_token_is_single_shot() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let payload = json!({
            "hostname": "edge-1",
            "address": "10.0.0.1",
            "os_type": "linux",
            "os_version": "6.1",
            "agent_version": "1.2.3",
            "metadata": {"rack": "a1"}
        });

        let first = app
            .clone()
            .oneshot(keyed_request(
                "POST",
                "/api/v1/devices/register",
                &key,
                &secret,
                Some(payload.clone()),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let first = common::body_json(first).await;
        let device_id = first["device"]["device_id"].as_str().unwrap().to_string();
        assert!(first["device_token"].is_string());

        let second = app
            .oneshot(keyed_request(
                "POST",
                "/api/v1/devices/register",
                &key,
                &secret,
                Some(payload),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        let second = common::body_json(second).await;
        assert_eq!(second["device"]["device_id"], device_id.as_str());
        // Same identity, no fresh token.
        assert!(second["device_token"].is_null());
    }

    #[tokio::test]
    async fn heartbeat_requires_matching_device_token() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let registered = app
            .clone()
            .oneshot(keyed_request(
                "POST",
                "/api/v1/devices/register",
                &key,
                &secret,
                Some(json!({
                    "hostname": "edge-2",
                    "address": "10.0.0.2",
                    "os_type": "linux",
                    "os_version": "6.1",
                    "agent_version": "1.2.3"
                })),
            ))
            .await
            .unwrap();
        let registered = common::body_json(registered).await;
        let device_id = registered["device"]["device_id"].as_str().unwrap().to_string();
        let device_token = registered["device_token"].as_str().unwrap().to_string();

        let beat = app
            .clone()
            .oneshot(
                Request::post(format!("/api/v1/devices/{device_id}/heartbeat"))
                    .header(crate::auth::HEADER_DEVICE_ID, &device_id)
                    .header(crate::auth::HEADER_DEVICE_TOKEN, &device_token)
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({"metrics": {"cpu": 0.4}}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(beat.status(), StatusCode::OK);
        let ack = common::body_json(beat).await;
        assert_eq!(ack["status"], "online");
        assert_eq!(ack["next_interval_seconds"], 60);

        let bad_token = app
            .oneshot(
                Request::post(format!("/api/v1/devices/{device_id}/heartbeat"))
                    .header(crate::auth::HEADER_DEVICE_ID, &device_id)
                    .header(crate::auth::HEADER_DEVICE_TOKEN, "wrong")
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bad_token.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn command_dispatch_round_trip() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let registered = app
            .clone()
            .oneshot(keyed_request(
                "POST",
                "/api/v1/devices/register",
                &key,
                &secret,
                Some(json!({
                    "hostname": "edge-3",
                    "address": "10.0.0.3",
                    "os_type": "linux",
                    "os_version": "6.1",
                    "agent_version": "1.2.3"
                })),
            ))
            .await
            .unwrap();
        let registered = common::body_json(registered).await;
        let device_id = registered["device"]["device_id"].as_str().unwrap().to_string();
        let device_token = registered["device_token"].as_str().unwrap().to_string();

        let created = app
            .clone()
            .oneshot(keyed_request(
                "POST",
                "/api/v1/commands",
                &key,
                &secret,
                Some(json!({
                    "device_id": device_id,
                    "command_type": "shell",
                    "payload": {"script": "uptime"}
                })),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let command_id = common::body_json(created).await["command_id"]
            .as_str()
            .unwrap()
            .to_string();

        let pulled = app
            .clone()
            .oneshot(
                Request::post("/api/v1/commands/pull")
                    .header(crate::auth::HEADER_DEVICE_ID, &device_id)
                    .header(crate::auth::HEADER_DEVICE_TOKEN, &device_token)
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({"batch": 5}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(pulled.status(), StatusCode::OK);
        let pulled = common::body_json(pulled).await;
        assert_eq!(pulled.as_array().unwrap().len(), 1);
        assert_eq!(pulled[0]["id"], command_id.as_str());
        assert_eq!(pulled[0]["status"], "running");

        let reported = app
            .clone()
            .oneshot(
                Request::post(format!("/api/v1/commands/{command_id}/result"))
                    .header(crate::auth::HEADER_DEVICE_ID, &device_id)
                    .header(crate::auth::HEADER_DEVICE_TOKEN, &device_token)
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({
                            "status": "completed",
                            "exit_code": 0,
                            "stdout": "up 4 days",
                            "duration_ms": 12
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(reported.status(), StatusCode::OK);
        let ack = common::body_json(reported).await;
        assert_eq!(ack["applied"], true);
        assert_eq!(ack["status"], "completed");

        // Duplicate report is ignored, the first result stands.
        let repeat = app
            .clone()
            .oneshot(
                Request::post(format!("/api/v1/commands/{command_id}/result"))
                    .header(crate::auth::HEADER_DEVICE_ID, &device_id)
                    .header(crate::auth::HEADER_DEVICE_TOKEN, &device_token)
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({"status": "failed", "exit_code": 1}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(repeat.status(), StatusCode::OK);
        let repeat = common::body_json(repeat).await;
        assert_eq!(repeat["applied"], false);
        assert_eq!(repeat["status"], "completed");

        let fetched = app
            .oneshot(keyed_request(
                "GET",
                &format!("/api/v1/commands/{command_id}"),
                &key,
                &secret,
                None,
            ))
            .await
            .unwrap();
        let fetched = common::body_json(fetched).await;
        assert_eq!(fetched["status"], "completed");
        assert_eq!(fetched["exit_code"], 0);
    }

    #[tokio::test]
    async fn restricted_permissions_map_to_forbidden() {
        let state = common::setup_state().await;
        let created = services::credentials::create_credential(
            &state,
            services::credentials::CreateCredentialRequest {
                name: "read-only".to_string(),
                caller_class: api::CallerClass::External,
                secret: "read-only-secret-1".to_string(),
                permissions: vec!["devices.read".to_string()],
                expires_in_days: None,
            },
        )
        .await
        .unwrap();
        let app = common::app(state);

        let read = app
            .clone()
            .oneshot(keyed_request(
                "GET",
                "/api/v1/devices",
                &created.key,
                "read-only-secret-1",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(read.status(), StatusCode::OK);

        let write = app
            .oneshot(keyed_request(
                "POST",
                "/api/v1/commands",
                &created.key,
                "read-only-secret-1",
                Some(json!({"device_id": "device-x", "command_type": "shell"})),
            ))
            .await
            .unwrap();
        assert_eq!(write.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn statistics_route_wins_over_device_id() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let response = app
            .oneshot(keyed_request(
                "GET",
                "/api/v1/devices/statistics",
                &key,
                &secret,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = common::body_json(response).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn unknown_sort_column_is_rejected() {
        let state = common::setup_state().await;
        let (key, secret) = common::seed_web_credential(&state).await;
        let app = common::app(state);

        let response = app
            .oneshot(keyed_request(
                "GET",
                "/api/v1/devices?sort=secret_hash",
                &key,
                &secret,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
