use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::EventType;
use crate::envelope::Envelope;

// ---------------------------------------------------------------------------
// Shared records
// ---------------------------------------------------------------------------

/// Whitelist action on a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolAction {
    Connect,
    Disconnect,
}

impl ToolAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolAction::Connect => "connect",
            ToolAction::Disconnect => "disconnect",
        }
    }
}

impl std::fmt::Display for ToolAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coding-tool agent discovered on a host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Runtime id; may change across host restarts.
    pub tool_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tool_type: String,
    /// Stable id the host assigns across restarts, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    #[serde(default, alias = "status")]
    pub sidecar_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsSnapshotPayload {
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCandidatesPayload {
    #[serde(default, alias = "tools")]
    pub candidates: Vec<ToolInfo>,
}

/// Receipt for a [`ToolWhitelistUpdateRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolWhitelistUpdatedPayload {
    #[serde(default)]
    pub tool_id: String,
    pub action: ToolAction,
    #[serde(default)]
    pub ok: bool,
    /// Free-text failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Stable failure reason, when the relay provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

impl Default for ToolWhitelistUpdatedPayload {
    fn default() -> Self {
        Self {
            tool_id: String::new(),
            action: ToolAction::Connect,
            ok: false,
            reason: None,
            reason_code: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDetail {
    pub tool_id: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDetailsSnapshotPayload {
    /// Echo of the `refreshId` from the request this snapshot answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_id: Option<String>,
    #[serde(default)]
    pub details: Vec<ToolDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerBindUpdatedPayload {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Metrics for the host's primary tool, used before a full snapshot exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryToolMetric {
    pub tool_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tool_type: String,
    #[serde(default)]
    pub metrics: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshotPayload {
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub sidecar: Option<Value>,
    #[serde(default)]
    pub tools: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_tool: Option<PrimaryToolMetric>,
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsRefreshRequest {
    pub reason: String,
}

/// Scheduling hint for detail collection on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailsPriority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDetailsRefreshRequest {
    pub refresh_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    pub force: bool,
    pub priority: DetailsPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRebindRequest {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolWhitelistUpdateRequest {
    pub tool_id: String,
    pub action: ToolAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolLaunchRequest {
    pub request_id: String,
    pub tool_name: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// An inbound envelope decoded into its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Heartbeat(HeartbeatPayload),
    ToolsSnapshot(ToolsSnapshotPayload),
    ToolsCandidates(ToolsCandidatesPayload),
    ToolWhitelistUpdated(ToolWhitelistUpdatedPayload),
    ToolDetailsSnapshot(ToolDetailsSnapshotPayload),
    ControllerBindUpdated(ControllerBindUpdatedPayload),
    MetricsSnapshot(MetricsSnapshotPayload),
    /// A known outbound type echoed back, or a type this client does not handle.
    Other(EventType),
}

impl InboundEvent {
    /// Decodes the envelope payload according to its `type`.
    ///
    /// A missing payload decodes to the payload's default value.
    pub fn decode(env: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(match env.event_type {
            EventType::Heartbeat => Self::Heartbeat(payload_or_default(env)?),
            EventType::ToolsSnapshot => Self::ToolsSnapshot(payload_or_default(env)?),
            EventType::ToolsCandidates => Self::ToolsCandidates(payload_or_default(env)?),
            EventType::ToolWhitelistUpdated => {
                Self::ToolWhitelistUpdated(payload_or_default(env)?)
            }
            EventType::ToolDetailsSnapshot => Self::ToolDetailsSnapshot(payload_or_default(env)?),
            EventType::ControllerBindUpdated => {
                Self::ControllerBindUpdated(payload_or_default(env)?)
            }
            EventType::MetricsSnapshot => Self::MetricsSnapshot(payload_or_default(env)?),
            other => Self::Other(other),
        })
    }
}

fn payload_or_default<T>(env: &Envelope) -> Result<T, serde_json::Error>
where
    T: Default + for<'de> Deserialize<'de>,
{
    Ok(env.parse_payload::<T>()?.unwrap_or_default())
}
