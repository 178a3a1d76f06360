//! Public types for the connection manager.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hostlink_protocol::ToolInfo;
use hostlink_protocol::api::CredentialData;
use hostlink_protocol::constants::{
    CANDIDATE_REFRESH_DEBOUNCE, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY, TOOL_CONNECT_TIMEOUT,
};
use hostlink_settings::LogEntry;

/// Connection status of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// No usable credential. Requires a new pairing.
    AuthExpired,
    /// Transport failure; eligible for scheduled retry.
    RelayUnreachable,
}

impl HostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::AuthExpired => "auth_expired",
            Self::RelayUnreachable => "relay_unreachable",
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// User-initiated; preserved across scheduled retries.
    pub manual: bool,
    /// Clears the retry count and the manual-reconnect latch first.
    pub reset_retry: bool,
}

impl ConnectOptions {
    pub fn manual() -> Self {
        Self {
            manual: true,
            reset_retry: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectOptions {
    /// Re-arm reconnect scheduling after the disconnect.
    pub trigger_reconnect: bool,
}

/// Per-send correlation fields.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub trace_id: Option<String>,
    pub tool_id: Option<String>,
    pub action: Option<String>,
}

/// Timing used by the orchestrator and the ingestion timers.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub tool_connect_timeout: Duration,
    pub candidate_debounce: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            delay: RECONNECT_DELAY,
            tool_connect_timeout: TOOL_CONNECT_TIMEOUT,
            candidate_debounce: CANDIDATE_REFRESH_DEBOUNCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing message raised by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
}

impl Notice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            code: None,
            tool_id: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_tool(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }
}

/// Events forwarded by [`ChannelHooks`](crate::hooks::ChannelHooks).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged { host_id: String, status: HostStatus },
    Notice { host_id: String, notice: Notice },
    ToolsChanged { host_id: String },
    CandidatesChanged { host_id: String },
    PairingFailed(PairingFailure),
    Log(LogEntry),
}

/// Device session stored per `(systemId, deviceId)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential_id: String,
}

impl SessionCredential {
    /// Whether a socket connection can be attempted with this credential.
    pub fn can_connect(&self) -> bool {
        !self.access_token.is_empty() && !self.key_id.is_empty()
    }

    /// Copies the non-empty fields of a relay response over this credential.
    pub fn merge(&mut self, data: &CredentialData) {
        fn take(dst: &mut String, src: &str) {
            if !src.is_empty() {
                *dst = src.to_string();
            }
        }
        take(&mut self.access_token, &data.access_token);
        take(&mut self.refresh_token, &data.refresh_token);
        take(&mut self.key_id, &data.key_id);
        take(&mut self.credential_id, &data.credential_id);
    }
}

/// Public half of the device signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKey {
    pub key_id: String,
    /// Base64url-encoded public key.
    pub public_key: String,
}

/// Why a token refresh did not produce a new credential.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("refresh failed ({code}): {message}")]
pub struct RefreshFailure {
    pub code: String,
    pub message: String,
}

impl RefreshFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Channel a pairing request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingSource {
    Paste,
    Manual,
    Scan,
    DeepLink,
    LaunchUrl,
}

/// Parsed pairing input.
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub relay_url: String,
    pub system_id: String,
    pub pair_ticket: String,
    /// Bare token from older pairing links. Not supported on its own.
    pub pair_token: String,
    pub display_name: String,
    pub source: PairingSource,
}

/// Pairing failure for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingFailure {
    pub code: String,
    pub message: String,
    pub suggestion: Option<String>,
    pub source: PairingSource,
}

impl std::fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pairing failed ({}): {}", self.code, self.message)
    }
}

// Not derived: `source` names the pairing channel, not an underlying error.
impl std::error::Error for PairingFailure {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchResult {
    pub ok: bool,
    pub request_id: String,
}

/// Read-only view of a host's runtime state.
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    pub host_id: String,
    pub status: HostStatus,
    pub connecting: bool,
    pub connected: bool,
    pub epoch: u64,
    pub retry_count: u32,
    pub manual_reconnect_required: bool,
    pub reconnect_pending: bool,
    pub last_error: Option<String>,
    pub sidecar_status: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub inbound_count: u64,
    pub outbound_count: u64,
    pub connected_tools: Vec<ToolInfo>,
    pub candidate_tools: Vec<ToolInfo>,
    pub connecting_tools: Vec<String>,
    pub pending_detail_refresh: Option<String>,
}
