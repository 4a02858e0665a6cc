use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{self as db, credentials, sessions};
use crate::tokens::{fixed_eq, generate_key, hash_secret, match_secret, TokenMatch};
use crate::validation;
use common::api::{CallerClass, CredentialCreated, CredentialPage, CredentialSummary};

/// Shortest secret accepted at creation time.
pub const MIN_SECRET_LEN: usize = 12;

#[derive(Clone, Debug, serde::Deserialize)]
pub struct CreateCredentialRequest {
    pub name: String,
    pub caller_class: CallerClass,
    /// Caller-chosen secret, stored only as a hash.
    pub secret: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Days until expiry, counted from creation; absent means no expiry.
    #[serde(default)]
    pub expires_in_days: Option<u32>,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct UpdateCredentialRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: Option<Vec<String>>,
    #[serde(default)]
    pub active: Option<bool>,
    /// `Some(None)` clears the expiry; absent leaves it untouched.
    #[serde(default, with = "double_option")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

mod double_option {
    use super::*;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<DateTime<Utc>>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<DateTime<Utc>>::deserialize(de).map(Some)
    }
}

#[derive(Clone, Debug)]
pub struct ListCredentialsRequest {
    pub caller_class: Option<CallerClass>,
    pub active: Option<bool>,
    pub limit: u32,
    pub offset: u32,
}

/// Verified caller identity resolved from a key/secret pair or a session.
#[derive(Clone, Debug)]
pub struct VerifiedCredential {
    pub credential_id: Option<Uuid>,
    pub name: String,
    pub caller_class: CallerClass,
    pub permissions: Vec<String>,
    pub break_glass: bool,
}

impl VerifiedCredential {
    /// Wildcard and legacy empty-permission credentials grant everything.
    pub fn grants(&self, permission: &str) -> bool {
        if self.permissions.is_empty() {
            return true;
        }
        self.permissions
            .iter()
            .any(|p| p == "*" || p == permission)
    }
}

pub fn to_summary(record: &db::CredentialRecord) -> CredentialSummary {
    CredentialSummary {
        id: record.id,
        name: record.name.clone(),
        key: record.key.clone(),
        caller_class: record.caller_class.into(),
        permissions: record.permissions.0.clone(),
        active: record.active,
        expires_at: record.expires_at,
        last_used_at: record.last_used_at,
        created_at: record.created_at,
    }
}

pub async fn create_credential(
    state: &AppState,
    req: CreateCredentialRequest,
) -> ApiResult<CredentialCreated> {
    validation::validate_required_str("name", &req.name, state.limits.max_field_len)?;
    validation::validate_required_str("secret", &req.secret, state.limits.max_field_len)?;
    validation::validate_permissions(&req.permissions, &state.limits)?;
    if req.secret.len() < MIN_SECRET_LEN {
        return Err(AppError::bad_request(format!(
            "secret must be at least {MIN_SECRET_LEN} characters"
        )));
    }
    let expires_at = match req.expires_in_days {
        Some(0) => return Err(AppError::bad_request("expires_in_days must be at least 1")),
        Some(days) => Some(Utc::now() + chrono::Duration::days(days as i64)),
        None => None,
    };

    let key = generate_key();
    let secret_hash = hash_secret(&req.secret, &state.auth.pepper)?;

    let record = credentials::create_credential(
        &state.db,
        db::NewCredential {
            id: Uuid::new_v4(),
            name: req.name.trim().to_string(),
            key: key.clone(),
            secret_hash,
            caller_class: req.caller_class.into(),
            permissions: req.permissions,
            expires_at,
        },
    )
    .await
    .map_err(|err| {
        if crate::error::is_unique_violation(&err) {
            AppError::conflict("credential name already exists")
        } else {
            AppError::from(err)
        }
    })?;

    Ok(CredentialCreated {
        credential: to_summary(&record),
        key,
    })
}

pub async fn get_credential(state: &AppState, id: Uuid) -> ApiResult<CredentialSummary> {
    let record = credentials::get_credential(&state.db, id)
        .await?
        .ok_or_else(|| AppError::not_found("credential not found"))?;
    Ok(to_summary(&record))
}

pub async fn list_credentials(
    state: &AppState,
    req: ListCredentialsRequest,
) -> ApiResult<CredentialPage> {
    let records = credentials::list_credentials(
        &state.db,
        req.caller_class.map(Into::into),
        req.active,
        req.limit,
        req.offset,
    )
    .await?;

    Ok(CredentialPage {
        limit: req.limit,
        offset: req.offset,
        items: records.iter().map(to_summary).collect(),
    })
}

pub async fn update_credential(
    state: &AppState,
    id: Uuid,
    req: UpdateCredentialRequest,
) -> ApiResult<CredentialSummary> {
    if let Some(name) = &req.name {
        validation::validate_required_str("name", name, state.limits.max_field_len)?;
    }
    if let Some(permissions) = &req.permissions {
        validation::validate_permissions(permissions, &state.limits)?;
    }

    let deactivated = req.active == Some(false);
    let update = db::CredentialUpdate {
        name: req.name.map(|n| n.trim().to_string()),
        permissions: req.permissions,
        active: req.active,
        expires_at: req.expires_at,
    };

    let changed = credentials::update_credential(&state.db, id, update)
        .await
        .map_err(|err| {
            if crate::error::is_unique_violation(&err) {
                AppError::conflict("credential name already exists")
            } else {
                AppError::from(err)
            }
        })?;
    if changed == 0 {
        return Err(AppError::not_found("credential not found"));
    }

    // Deactivation kills every session minted from the credential.
    if deactivated {
        sessions::delete_sessions_for_credential(&state.db, id).await?;
    }

    get_credential(state, id).await
}

pub async fn delete_credential(state: &AppState, id: Uuid) -> ApiResult<()> {
    let deleted = credentials::delete_credential(&state.db, id).await?;
    if deleted == 0 {
        return Err(AppError::not_found("credential not found"));
    }
    Ok(())
}

/// Resolves a key/secret pair to a caller identity.
///
/// The break-glass pair is checked first and never touches the store, so a
/// corrupted credentials table cannot lock operators out. Legacy sha256
/// hashes that still verify are upgraded to argon2 in place.
pub async fn verify_key_secret(
    state: &AppState,
    key: &str,
    secret: &str,
) -> ApiResult<VerifiedCredential> {
    if state.auth.break_glass.enabled
        && fixed_eq(key, &state.auth.break_glass.key)
        && fixed_eq(secret, &state.auth.break_glass.secret)
    {
        ::tracing::warn!("break-glass credential used");
        ::metrics::counter!("auth_break_glass_used_total").increment(1);
        return Ok(VerifiedCredential {
            credential_id: None,
            name: "break-glass".to_string(),
            caller_class: CallerClass::Web,
            permissions: vec!["*".to_string()],
            break_glass: true,
        });
    }

    let record = credentials::get_credential_by_key(&state.db, key)
        .await?
        .ok_or_else(AppError::unauthorized)?;

    if !record.is_usable(Utc::now()) {
        return Err(AppError::unauthorized());
    }

    let matched = match_secret(secret, &record.secret_hash, &state.auth.pepper)?
        .ok_or_else(AppError::unauthorized)?;

    if matches!(matched, TokenMatch::Legacy) {
        match hash_secret(secret, &state.auth.pepper) {
            Ok(new_hash) => {
                if let Err(err) =
                    credentials::update_secret_hash(&state.db, record.id, new_hash).await
                {
                    ::tracing::warn!(?err, credential = %record.id, "failed to upgrade secret hash");
                } else {
                    ::tracing::info!(credential = %record.id, "upgraded secret hash to argon2");
                }
            }
            Err(err) => {
                ::tracing::warn!(?err, credential = %record.id, "failed to rehash secret");
            }
        }
    }

    let _ = credentials::touch_credential_last_used(&state.db, record.id).await;

    Ok(VerifiedCredential {
        credential_id: Some(record.id),
        name: record.name.clone(),
        caller_class: record.caller_class.into(),
        permissions: record.permissions.0.clone(),
        break_glass: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verified(permissions: &[&str]) -> VerifiedCredential {
        VerifiedCredential {
            credential_id: Some(Uuid::new_v4()),
            name: "test".to_string(),
            caller_class: CallerClass::Web,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            break_glass: false,
        }
    }

    #[test]
    fn wildcard_and_empty_grant_everything() {
        assert!(verified(&["*"]).grants("devices.read"));
        assert!(verified(&[]).grants("commands.create"));
    }

    #[test]
    fn explicit_permissions_are_exact() {
        let id = verified(&["devices.read", "commands.create"]);
        assert!(id.grants("devices.read"));
        assert!(id.grants("commands.create"));
        assert!(!id.grants("credentials.manage"));
    }
}
