use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{self as db, devices};
use crate::services::sessions::RequestContext;
use crate::telemetry;
use crate::tokens::{generate_device_token, hash_secret, match_secret, TokenMatch};
use crate::validation;
use common::api::{DeviceRegistered, DeviceSummary, DeviceSummaryPage};

#[derive(Clone, Debug, serde::Deserialize)]
pub struct RegisterDeviceRequest {
    pub hostname: String,
    pub address: String,
    pub os_type: String,
    pub os_version: String,
    pub agent_version: String,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Clone, Debug)]
pub struct ListDevicesRequest {
    pub status: Option<db::DeviceStatus>,
    pub os_type: Option<String>,
    pub sort: db::DeviceSortColumn,
    pub limit: u32,
    pub offset: u32,
}

/// Identity is derived, not assigned: the same address/hostname pair always
/// maps to the same device id, making registration idempotent.
pub fn derive_device_id(address: &str, hostname: &str) -> String {
    let digest = Sha256::digest(format!("{address}:{hostname}").as_bytes());
    let hex = format!("{digest:x}");
    format!("device-{}", &hex[..16])
}

pub fn to_summary(record: &db::DeviceRecord) -> DeviceSummary {
    let metadata: HashMap<String, serde_json::Value> = record
        .metadata
        .0
        .as_object()
        .map(|map| map.clone().into_iter().collect())
        .unwrap_or_default();

    DeviceSummary {
        device_id: record.device_id.clone(),
        hostname: record.hostname.clone(),
        address: record.address.clone(),
        os_type: record.os_type.clone(),
        os_version: record.os_version.clone(),
        agent_version: record.agent_version.clone(),
        status: record.status.into(),
        last_seen_at: record.last_seen_at,
        metadata,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

/// Registers a device, or refreshes it when the derived id already exists.
/// The agent token is minted on first registration only; re-registration
/// keeps the stored hash so a restarted agent does not invalidate itself.
pub async fn register_device(
    state: &AppState,
    req: RegisterDeviceRequest,
    ctx: RequestContext,
) -> ApiResult<DeviceRegistered> {
    let max = state.limits.max_field_len;
    validation::validate_required_str("hostname", &req.hostname, max)?;
    validation::validate_required_str("address", &req.address, max)?;
    validation::validate_required_str("os_type", &req.os_type, max)?;
    validation::validate_required_str("os_version", &req.os_version, max)?;
    validation::validate_required_str("agent_version", &req.agent_version, max)?;
    validation::validate_metadata_object(&req.metadata)?;

    let device_id = derive_device_id(req.address.trim(), req.hostname.trim());
    let existing = devices::get_device(&state.db, &device_id).await?;

    let (record, device_token, action) = match existing {
        Some(current) => {
            let mut metadata = current.metadata.0.clone();
            merge_metadata(&mut metadata, &req.metadata);
            let upsert = db::DeviceUpsert {
                device_id: device_id.clone(),
                hostname: req.hostname.trim().to_string(),
                address: req.address.trim().to_string(),
                os_type: req.os_type.trim().to_string(),
                os_version: req.os_version.trim().to_string(),
                agent_version: req.agent_version.trim().to_string(),
                token_hash: current.token_hash.clone(),
                metadata,
            };
            devices::update_registration(&state.db, &upsert).await?;
            let record = devices::get_device(&state.db, &device_id)
                .await?
                .ok_or_else(|| AppError::not_found("device not found"))?;
            (record, None, "device.reregistered")
        }
        None => {
            let token = generate_device_token();
            let token_hash = hash_secret(&token, &state.auth.pepper)?;
            let record = devices::insert_device(
                &state.db,
                db::DeviceUpsert {
                    device_id: device_id.clone(),
                    hostname: req.hostname.trim().to_string(),
                    address: req.address.trim().to_string(),
                    os_type: req.os_type.trim().to_string(),
                    os_version: req.os_version.trim().to_string(),
                    agent_version: req.agent_version.trim().to_string(),
                    token_hash,
                    metadata: req.metadata.clone(),
                },
            )
            .await?;
            ::metrics::counter!("devices_registered_total").increment(1);
            (record, Some(token), "device.registered")
        }
    };

    telemetry::audit(
        state,
        db::NewAuditLog {
            device_id: Some(device_id),
            action: action.to_string(),
            details: Some(format!(r#"{{"hostname":"{}"}}"#, record.hostname)),
            ip_address: ctx.ip_address,
            user_agent: ctx.user_agent,
        },
    )
    .await;

    Ok(DeviceRegistered {
        device: to_summary(&record),
        device_token,
    })
}

pub async fn get_device(state: &AppState, device_id: &str) -> ApiResult<DeviceSummary> {
    let record = devices::get_device(&state.db, device_id)
        .await?
        .ok_or_else(|| AppError::not_found("device not found"))?;
    Ok(to_summary(&record))
}

pub async fn list_devices(
    state: &AppState,
    req: ListDevicesRequest,
) -> ApiResult<DeviceSummaryPage> {
    let filters = db::DeviceListFilters {
        status: req.status,
        os_type: req.os_type,
    };

    let total = devices::count_devices(&state.db, &filters).await?;
    let records =
        devices::list_devices(&state.db, &filters, req.sort, req.limit, req.offset).await?;

    Ok(DeviceSummaryPage {
        limit: req.limit,
        offset: req.offset,
        total,
        items: records.iter().map(to_summary).collect(),
    })
}

pub async fn delete_device(state: &AppState, device_id: &str) -> ApiResult<()> {
    let deleted = devices::delete_device(&state.db, device_id).await?;
    if deleted == 0 {
        return Err(AppError::not_found("device not found"));
    }
    Ok(())
}

/// Verifies the agent-channel token for a device, upgrading legacy hashes.
pub async fn verify_device_token(
    state: &AppState,
    device_id: &str,
    token: &str,
) -> ApiResult<db::DeviceRecord> {
    let record = devices::get_device(&state.db, device_id)
        .await?
        .ok_or_else(AppError::unauthorized)?;

    let matched = match_secret(token, &record.token_hash, &state.auth.pepper)?
        .ok_or_else(AppError::unauthorized)?;

    if matches!(matched, TokenMatch::Legacy) {
        match hash_secret(token, &state.auth.pepper) {
            Ok(new_hash) => {
                if let Err(err) =
                    devices::update_device_token_hash(&state.db, device_id, new_hash).await
                {
                    ::tracing::warn!(?err, device_id, "failed to upgrade device token hash");
                } else {
                    ::tracing::info!(device_id, "upgraded device token hash to argon2");
                }
            }
            Err(err) => {
                ::tracing::warn!(?err, device_id, "failed to rehash device token");
            }
        }
    }

    Ok(record)
}

/// Shallow merge of reported metadata over the stored blob. Top-level keys
/// win wholesale; nested objects are replaced, not merged.
pub fn merge_metadata(stored: &mut serde_json::Value, incoming: &serde_json::Value) {
    let Some(incoming) = incoming.as_object() else {
        return;
    };
    if !stored.is_object() {
        *stored = serde_json::json!({});
    }
    if let Some(target) = stored.as_object_mut() {
        for (key, value) in incoming {
            target.insert(key.clone(), value.clone());
        }
    }
}
