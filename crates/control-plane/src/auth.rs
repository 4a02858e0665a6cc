use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
};
use tracing::warn;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    persistence::NewAuditLog,
    services::credentials::{self, VerifiedCredential},
    services::devices,
    services::sessions,
    telemetry,
};
use common::api::CallerClass;

pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_API_SECRET: &str = "x-api-secret";
pub const HEADER_DEVICE_ID: &str = "x-device-id";
pub const HEADER_DEVICE_TOKEN: &str = "x-device-token";

/// Authenticated agent channel identity.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub device_id: String,
}

/// Layered caller gate: a bearer session token is tried first, then the
/// API key/secret header pair. Every failure collapses into the same
/// unauthorized response so callers cannot tell key-not-found from
/// bad-secret from expired-session.
pub async fn require_caller(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    // Owned copies up front; the request body must not be borrowed across
    // the awaits below.
    let request_id = telemetry::request_id_from_request(&req);
    let route = format!("{} {}", req.method(), req.uri().path());

    let identity = match resolve_caller(&state, req.headers()).await {
        Ok(identity) => identity,
        Err(err) => {
            log_auth_failure(&state, request_id, &route, "caller").await;
            return Err(err);
        }
    };

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// Agent channel gate driven by the device id/token header pair.
pub async fn require_device(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    let request_id = telemetry::request_id_from_request(&req);
    let route = format!("{} {}", req.method(), req.uri().path());

    let device_id = header_value(req.headers(), HEADER_DEVICE_ID);
    let token = header_value(req.headers(), HEADER_DEVICE_TOKEN);

    let (Some(device_id), Some(token)) = (device_id, token) else {
        log_auth_failure(&state, request_id, &route, "device").await;
        return Err(AppError::unauthorized());
    };

    match devices::verify_device_token(&state, &device_id, &token).await {
        Ok(_) => {}
        Err(err) => {
            log_auth_failure(&state, request_id, &route, "device").await;
            return Err(err);
        }
    }

    req.extensions_mut().insert(DeviceIdentity { device_id });
    Ok(next.run(req).await)
}

/// A bad session token does not end the attempt: when the key/secret pair
/// is also present it is verified next, so callers holding both a stale
/// session and a live key keep working.
async fn resolve_caller(state: &AppState, headers: &HeaderMap) -> ApiResult<VerifiedCredential> {
    let session_failure = match extract_bearer(headers) {
        Some(token) => match sessions::resolve_session(state, &token).await {
            Ok(identity) => return Ok(identity),
            Err(err) => Some(err),
        },
        None => None,
    };

    let key = header_value(headers, HEADER_API_KEY);
    let secret = header_value(headers, HEADER_API_SECRET);
    if let (Some(key), Some(secret)) = (key, secret) {
        return credentials::verify_key_secret(state, &key, &secret).await;
    }

    Err(session_failure.unwrap_or_else(AppError::unauthorized))
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Handler-side permission check against the verified caller.
pub fn require_permission(caller: &VerifiedCredential, permission: &str) -> ApiResult<()> {
    if caller.grants(permission) {
        return Ok(());
    }
    warn!(caller = %caller.name, permission, "permission denied");
    Err(AppError::forbidden(format!(
        "missing permission '{permission}'"
    )))
}

/// Handler-side caller class check.
pub fn require_class(caller: &VerifiedCredential, allowed: &[CallerClass]) -> ApiResult<()> {
    if caller.break_glass || allowed.contains(&caller.caller_class) {
        return Ok(());
    }
    warn!(
        caller = %caller.name,
        class = caller.caller_class.as_str(),
        "caller class denied"
    );
    Err(AppError::forbidden("caller class not permitted"))
}

async fn log_auth_failure(state: &AppState, request_id: Option<String>, route: &str, channel: &str) {
    let detail = format!(
        r#"{{"channel":"{channel}","path":"{route}","request_id":{}}}"#,
        request_id
            .map(|id| format!(r#""{id}""#))
            .unwrap_or_else(|| "null".to_string()),
    );
    telemetry::audit(
        state,
        NewAuditLog {
            device_id: None,
            action: "auth.failed".to_string(),
            details: Some(detail),
            ip_address: None,
            user_agent: None,
        },
    )
    .await;
    ::metrics::counter!("auth_failures_total", "channel" => channel.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn caller(class: CallerClass, permissions: &[&str]) -> VerifiedCredential {
        VerifiedCredential {
            credential_id: Some(uuid::Uuid::new_v4()),
            name: "test".to_string(),
            caller_class: class,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            break_glass: false,
        }
    }

    #[test]
    fn bearer_extraction_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Token abc"));
        assert!(extract_bearer(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(extract_bearer(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn class_gate_honors_break_glass() {
        let mut recovery = caller(CallerClass::Web, &["*"]);
        recovery.break_glass = true;

        assert!(require_class(&recovery, &[CallerClass::Internal]).is_ok());
        assert!(require_class(&caller(CallerClass::Web, &[]), &[CallerClass::Internal]).is_err());
        assert!(require_class(&caller(CallerClass::Web, &[]), &[CallerClass::Web]).is_ok());
    }

    #[test]
    fn permission_gate_maps_to_forbidden() {
        let c = caller(CallerClass::External, &["devices.read"]);
        assert!(require_permission(&c, "devices.read").is_ok());

        let err = require_permission(&c, "commands.create").unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::FORBIDDEN);
    }
}
