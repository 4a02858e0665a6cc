use chrono::{Duration, Utc};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{self as db, sessions};
use crate::services::credentials::{self, VerifiedCredential};
use crate::telemetry;
use crate::tokens::{generate_session_token, session_token_digest};
use common::api::{SessionCreated, SessionPage, SessionSummary};
use uuid::Uuid;

#[derive(Clone, Debug, serde::Deserialize)]
pub struct LoginRequest {
    pub key: String,
    pub secret: String,
    /// Binds the session to one device when set; informational today.
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Exchanges a key/secret pair for a bearer session token. The plaintext
/// token is returned once; only its digest is stored.
pub async fn login(
    state: &AppState,
    req: LoginRequest,
    ctx: RequestContext,
) -> ApiResult<SessionCreated> {
    let verified = credentials::verify_key_secret(state, &req.key, &req.secret).await?;

    // Break-glass callers authenticate per request; no stored session.
    let Some(credential_id) = verified.credential_id else {
        return Err(AppError::forbidden(
            "break-glass credential cannot open sessions",
        ));
    };

    let token = generate_session_token();
    let digest = session_token_digest(&token, &state.auth.pepper);
    let expires_at = Utc::now() + Duration::hours(state.sessions.default_ttl_hours);

    sessions::create_session(
        &state.db,
        db::NewSession {
            token_hash: digest,
            credential_id,
            device_id: req.device_id.clone(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            expires_at,
        },
    )
    .await?;

    telemetry::audit(
        state,
        db::NewAuditLog {
            device_id: req.device_id,
            action: "session.created".to_string(),
            details: Some(format!(r#"{{"credential":"{}"}}"#, verified.name)),
            ip_address: ctx.ip_address,
            user_agent: ctx.user_agent,
        },
    )
    .await;

    ::metrics::counter!("sessions_created_total").increment(1);

    Ok(SessionCreated { token, expires_at })
}

/// Resolves a bearer token to its caller identity, touching activity.
/// Invalid, expired, and deactivated-credential sessions all resolve to the
/// same uniform unauthorized error.
pub async fn resolve_session(state: &AppState, token: &str) -> ApiResult<VerifiedCredential> {
    let digest = session_token_digest(token, &state.auth.pepper);
    let session = sessions::get_session_with_credential(&state.db, &digest)
        .await?
        .ok_or_else(AppError::unauthorized)?;

    if !session.is_valid(Utc::now()) {
        return Err(AppError::unauthorized());
    }

    let _ = sessions::touch_session_activity(&state.db, &digest).await;

    Ok(VerifiedCredential {
        credential_id: Some(session.credential_id),
        name: session.credential_name,
        caller_class: session.caller_class.into(),
        permissions: session.permissions.0,
        break_glass: false,
    })
}

/// Extends a live session by the configured TTL.
pub async fn refresh(state: &AppState, token: &str) -> ApiResult<SessionCreated> {
    let digest = session_token_digest(token, &state.auth.pepper);
    let expires_at = Utc::now() + Duration::hours(state.sessions.default_ttl_hours);

    let refreshed = sessions::refresh_session(&state.db, &digest, expires_at).await?;
    if refreshed == 0 {
        return Err(AppError::unauthorized());
    }

    Ok(SessionCreated {
        token: token.to_string(),
        expires_at,
    })
}

/// Deletes the session; missing tokens are treated as already logged out.
pub async fn logout(state: &AppState, token: &str) -> ApiResult<()> {
    let digest = session_token_digest(token, &state.auth.pepper);
    let _ = sessions::delete_session(&state.db, &digest).await?;
    Ok(())
}

/// Unexpired sessions, optionally scoped to one credential, token digests
/// withheld.
pub async fn list_active(
    state: &AppState,
    credential_id: Option<Uuid>,
    limit: u32,
    offset: u32,
) -> ApiResult<SessionPage> {
    let total = sessions::count_active_sessions(&state.db, credential_id).await?;
    let records = sessions::list_active_sessions(&state.db, credential_id, limit, offset).await?;

    Ok(SessionPage {
        limit,
        offset,
        total,
        items: records
            .into_iter()
            .map(|record| SessionSummary {
                credential_id: record.credential_id,
                device_id: record.device_id,
                ip_address: record.ip_address,
                user_agent: record.user_agent,
                expires_at: record.expires_at,
                last_activity_at: record.last_activity_at,
                created_at: record.created_at,
            })
            .collect(),
    })
}

pub async fn cleanup_expired(state: &AppState) -> crate::Result<u64> {
    let removed = sessions::delete_expired_sessions(&state.db).await?;
    if removed > 0 {
        ::metrics::counter!("sessions_expired_total").increment(removed);
    }
    Ok(removed)
}
