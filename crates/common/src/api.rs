//! Shared API DTOs used by the control-plane, device agents, and tests.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

/// Device liveness state (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device has heartbeated within the liveness window.
    Online,
    /// Device missed the liveness window.
    Offline,
}

impl DeviceStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

/// Command lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Created, waiting to be claimed by the device.
    Pending,
    /// Claimed by the device and executing under a lease.
    Running,
    /// Reported back with a successful result.
    Completed,
    /// Reported back with a failure, or retries exhausted.
    Failed,
}

impl CommandStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    /// Completed and failed commands accept no further writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

/// Coarse caller category used for class-gated operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CallerClass {
    /// Operator UI and interactive callers.
    Web,
    /// External integrations.
    External,
    /// Internal automation.
    Internal,
}

impl CallerClass {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerClass::Web => "web",
            CallerClass::External => "external",
            CallerClass::Internal => "internal",
        }
    }
}

/// Device record as returned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceSummary {
    /// Deterministic device identifier.
    pub device_id: String,
    /// Reported host name.
    pub hostname: String,
    /// Network address the device registered from.
    pub address: String,
    /// Operating system family.
    pub os_type: String,
    /// Operating system version string.
    pub os_version: String,
    /// Agent build running on the device.
    pub agent_version: String,
    /// Current liveness state.
    pub status: DeviceStatus,
    /// Last heartbeat or registration time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Free-form metadata, deep-merged on every heartbeat.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Paginated device list response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceSummaryPage {
    /// Requested page size.
    pub limit: u32,
    /// Requested offset.
    pub offset: u32,
    /// Total devices matching the filter.
    pub total: u64,
    /// Devices on this page.
    pub items: Vec<DeviceSummary>,
}

/// Registration response; the agent token is only present the first time a
/// device registers and is never recoverable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceRegistered {
    /// The registered (or refreshed) device record.
    pub device: DeviceSummary,
    /// Agent-channel bearer token, present on first registration only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}

/// Heartbeat acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "online",
    "last_seen_at": "2026-01-10T12:00:00Z",
    "next_interval_seconds": 60
}))]
pub struct HeartbeatAck {
    /// Liveness state after the heartbeat (always online).
    pub status: DeviceStatus,
    /// Recorded heartbeat time.
    pub last_seen_at: DateTime<Utc>,
    /// Interval the agent should wait before the next heartbeat.
    pub next_interval_seconds: u64,
}

/// Point-in-time liveness report for one device.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LivenessReport {
    /// Current liveness state.
    pub status: DeviceStatus,
    /// Last heartbeat time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Seconds since the last heartbeat, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_duration_seconds: Option<i64>,
    /// Whether the device has exceeded the liveness timeout.
    pub is_timed_out: bool,
}

/// Fleet-wide liveness statistics.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FleetStatistics {
    /// All registered devices.
    pub total: u64,
    /// Devices currently online.
    pub online: u64,
    /// Devices currently offline.
    pub offline: u64,
    /// Devices seen within the last five minutes.
    pub recently_active: u64,
}

/// Credential record with the secret hash stripped.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CredentialSummary {
    /// Credential identifier.
    pub id: Uuid,
    /// Unique display name.
    pub name: String,
    /// Opaque lookup key.
    pub key: String,
    /// Caller category this credential authenticates as.
    pub caller_class: CallerClass,
    /// Granted permissions; `"*"` grants everything.
    pub permissions: Vec<String>,
    /// Whether the credential can currently authenticate.
    pub active: bool,
    /// Optional hard expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Paginated credential list response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CredentialPage {
    /// Requested page size.
    pub limit: u32,
    /// Requested offset.
    pub offset: u32,
    /// Credentials on this page.
    pub items: Vec<CredentialSummary>,
}

/// Creation response; the generated key is shown exactly once. The secret
/// was chosen by the caller and only its hash is stored.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CredentialCreated {
    /// The stored credential, hash stripped.
    pub credential: CredentialSummary,
    /// Plaintext lookup key.
    pub key: String,
}

/// Session issued against a credential.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionCreated {
    /// Opaque bearer token for `Authorization: Bearer`.
    pub token: String,
    /// Session expiry.
    pub expires_at: DateTime<Utc>,
}

/// Live session as listed for operators; the token itself is never shown.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionSummary {
    /// Credential the session was minted from.
    pub credential_id: Uuid,
    /// Device the session is scoped to, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Address the session was opened from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// User agent captured at login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Session expiry.
    pub expires_at: DateTime<Utc>,
    /// Last request authenticated by this session.
    pub last_activity_at: DateTime<Utc>,
    /// Login time.
    pub created_at: DateTime<Utc>,
}

/// Paginated active-session list response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionPage {
    /// Requested page size.
    pub limit: u32,
    /// Requested offset.
    pub offset: u32,
    /// Active sessions in total, across all pages.
    pub total: u64,
    /// Sessions on this page.
    pub items: Vec<SessionSummary>,
}

/// Command as tracked by the control-plane.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommandView {
    /// Command identifier.
    pub id: Uuid,
    /// Owning device.
    pub device_id: String,
    /// Command type tag interpreted by the agent.
    pub command_type: String,
    /// Opaque payload passed through to the agent.
    pub payload: serde_json::Value,
    /// Execution timeout in seconds.
    pub timeout_seconds: u32,
    /// Lifecycle state.
    pub status: CommandStatus,
    /// Process exit code, once reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured stdout, once reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Captured stderr, once reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Reported execution duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Times the command was requeued after an expired lease.
    pub retry_count: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the most recent claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Time the terminal result was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Command creation response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommandCreated {
    /// Identifier of the pending command.
    pub command_id: Uuid,
}

/// Acknowledgement for a reported command result.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResultAck {
    /// False when the command was already terminal and the report was ignored.
    pub applied: bool,
    /// Lifecycle state after the report.
    pub status: CommandStatus,
}
