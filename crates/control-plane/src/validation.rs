use crate::config::LimitsConfig;
use crate::error::{ApiResult, AppError};

pub fn validate_required_str(field: &str, value: &str, max_len: usize) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::bad_request(format!("{field} cannot be empty")));
    }
    if value.len() > max_len {
        return Err(AppError::bad_request(format!("{field} too long")));
    }
    Ok(())
}

pub fn validate_opt_str(field: &str, value: Option<&str>, max_len: usize) -> ApiResult<()> {
    if let Some(val) = value {
        validate_required_str(field, val, max_len)?;
    }
    Ok(())
}

/// Permission entries are dotted lowercase words, or the `*` wildcard.
pub fn validate_permissions(permissions: &[String], limits: &LimitsConfig) -> ApiResult<()> {
    for perm in permissions {
        if perm == "*" {
            continue;
        }
        validate_required_str("permission", perm, limits.max_field_len)?;
        let well_formed = perm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_');
        if !well_formed || perm.starts_with('.') || perm.ends_with('.') {
            return Err(AppError::bad_request(format!(
                "permission '{perm}' is malformed"
            )));
        }
    }
    Ok(())
}

/// Metadata rides along as a JSON object; anything else is rejected before
/// it reaches storage.
pub fn validate_metadata_object(value: &serde_json::Value) -> ApiResult<()> {
    if !value.is_object() {
        return Err(AppError::bad_request("metadata must be a JSON object"));
    }
    Ok(())
}

pub fn clamp_list_limit(requested: Option<u32>, limits: &LimitsConfig) -> u32 {
    let fallback = limits.max_list_limit.min(100);
    requested
        .unwrap_or(fallback)
        .clamp(1, limits.max_list_limit)
}
