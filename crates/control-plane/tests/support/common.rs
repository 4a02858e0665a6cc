#![allow(dead_code)]

use axum::{body::Body, http::Request as HttpRequest, Router};
use common::api;
use control_plane::{
    app_state::{AppState, CommandSignals},
    config::{
        AuthConfig, BreakGlassConfig, CommandConfig, LimitsConfig, LivenessConfig, SessionConfig,
    },
    metrics::{init_metrics_recorder, record_build_info},
    persistence as db,
    persistence::migrations,
    routes::{build_metrics_router, build_router},
    services,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

pub const TEST_PEPPER: &str = "test-pepper";
pub const BREAK_GLASS_KEY: &str = "recovery-key";
pub const BREAK_GLASS_SECRET: &str = "recovery-secret";

#[derive(Clone)]
pub struct TestAppConfig {
    pub break_glass_enabled: bool,
    pub session_ttl_hours: i64,
    pub liveness_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub command_batch: u32,
    pub lease_secs: u64,
    pub max_retries: u32,
    pub request_body_bytes: u64,
    pub max_list_limit: u32,
}

impl Default for TestAppConfig {
    fn default() -> Self {
        Self {
            break_glass_enabled: false,
            session_ttl_hours: 72,
            liveness_timeout_secs: 300,
            heartbeat_interval_secs: 60,
            command_batch: 10,
            lease_secs: 300,
            max_retries: 3,
            request_body_bytes: 256 * 1024,
            max_list_limit: 500,
        }
    }
}

pub async fn setup_app() -> (Router, AppState) {
    setup_app_with_config(TestAppConfig::default()).await
}

pub async fn setup_app_with_config(config: TestAppConfig) -> (Router, AppState) {
    let db = migrations::init_pool("sqlite::memory:")
        .await
        .expect("db init");
    let migration_outcome = migrations::run_migrations(&db).await.expect("migrations");
    let state = make_state(db, &config, migration_outcome.snapshot);
    let app = build_router(state.clone()).with_state(state.clone());
    (app, state)
}

pub async fn setup_apps() -> (Router, Router, AppState) {
    let db = migrations::init_pool("sqlite::memory:")
        .await
        .expect("db init");
    let migration_outcome = migrations::run_migrations(&db).await.expect("migrations");
    let state = make_state(db, &TestAppConfig::default(), migration_outcome.snapshot);
    let app = build_router(state.clone()).with_state(state.clone());
    let metrics_app = build_metrics_router().with_state(state.clone());
    (app, metrics_app, state)
}

pub fn make_state(db: db::Db, config: &TestAppConfig, schema: db::MigrationSnapshot) -> AppState {
    let metrics_handle = init_metrics_recorder();
    record_build_info(&schema);

    AppState {
        db,
        auth: AuthConfig {
            pepper: TEST_PEPPER.into(),
            break_glass: BreakGlassConfig {
                enabled: config.break_glass_enabled,
                key: BREAK_GLASS_KEY.into(),
                secret: BREAK_GLASS_SECRET.into(),
            },
        },
        sessions: SessionConfig {
            default_ttl_hours: config.session_ttl_hours,
            cleanup_interval_secs: 900,
        },
        liveness: LivenessConfig {
            timeout_secs: config.liveness_timeout_secs,
            sweep_interval_secs: 60,
            heartbeat_interval_secs: config.heartbeat_interval_secs,
        },
        commands: CommandConfig {
            default_batch: config.command_batch,
            lease_secs: config.lease_secs,
            max_retries: config.max_retries,
            lease_sweep_interval_secs: 30,
            stream_wait_secs: 1,
        },
        limits: LimitsConfig {
            request_body_bytes: config.request_body_bytes,
            max_field_len: 255,
            max_list_limit: config.max_list_limit,
        },
        metrics_handle,
        schema,
        command_signals: CommandSignals::new(),
    }
}

pub const ADMIN_SECRET: &str = "admin-secret-0123456789";

/// Seeds a wildcard web credential and returns its plaintext key/secret pair.
pub async fn seed_admin_credential(state: &AppState) -> (String, String) {
    let created = services::credentials::create_credential(
        state,
        services::credentials::CreateCredentialRequest {
            name: "admin".into(),
            caller_class: api::CallerClass::Web,
            secret: ADMIN_SECRET.into(),
            permissions: vec!["*".into()],
            expires_in_days: None,
        },
    )
    .await
    .expect("seed credential");
    (created.key, ADMIN_SECRET.into())
}

pub fn keyed_request(
    method: &str,
    uri: &str,
    key: &str,
    secret: &str,
    body: Option<serde_json::Value>,
) -> HttpRequest<Body> {
    let builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header("x-api-key", key)
        .header("x-api-secret", secret)
        .header("content-type", "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn bearer_request(
    method: &str,
    uri: &str,
    token: &str,
    body: Option<serde_json::Value>,
) -> HttpRequest<Body> {
    let builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn device_request(
    method: &str,
    uri: &str,
    device_id: &str,
    device_token: &str,
    body: Option<serde_json::Value>,
) -> HttpRequest<Body> {
    let builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header("x-device-id", device_id)
        .header("x-device-token", device_token)
        .header("content-type", "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("parse json body")
}

/// Registers a device through the API and returns (device_id, device_token).
pub async fn register_device(app: &Router, key: &str, secret: &str, hostname: &str) -> (String, String) {
    let response = app
        .clone()
        .oneshot(keyed_request(
            "POST",
            "/api/v1/devices/register",
            key,
            secret,
            Some(serde_json::json!({
                "hostname": hostname,
                "address": format!("10.1.0.{}", hostname.len()),
                "os_type": "linux",
                "os_version": "6.1",
                "agent_version": "1.0.0"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::CREATED);

    let body = body_json(response).await;
    let device_id = body["device"]["device_id"].as_str().unwrap().to_string();
    let device_token = body["device_token"].as_str().unwrap().to_string();
    (device_id, device_token)
}

pub fn legacy_hash(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
