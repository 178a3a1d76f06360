use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Envelope format version stamped into every outbound event.
pub const PROTOCOL_VERSION: u32 = 1;

/// `clientType` query value identifying this side of the link.
pub const CLIENT_TYPE: &str = "app";

/// Unexpected closes tolerated before a manual reconnect is required.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Fixed delay between scheduled reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// How long a tool-connect request may wait for its whitelist receipt.
pub const TOOL_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Debounce applied before candidate-list changes are announced.
pub const CANDIDATE_REFRESH_DEBOUNCE: Duration = Duration::from_millis(250);

/// Automatic retries allowed per (tool, action) after a recoverable failure.
pub const TOOL_AUTO_RETRY_LIMIT: u32 = 1;

/// How often to send pings on an idle socket.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Read deadline: if nothing arrives within this window the socket is dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Maximum inbound text frame size in bytes (8 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Envelope `type` identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Relay/host to client
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "tools_snapshot")]
    ToolsSnapshot,
    #[serde(rename = "tools_candidates")]
    ToolsCandidates,
    #[serde(rename = "tool_whitelist_updated")]
    ToolWhitelistUpdated,
    #[serde(rename = "tool_details_snapshot")]
    ToolDetailsSnapshot,
    #[serde(rename = "controller_bind_updated")]
    ControllerBindUpdated,
    #[serde(rename = "metrics_snapshot")]
    MetricsSnapshot,

    // Client to host
    #[serde(rename = "tools_refresh_request")]
    ToolsRefreshRequest,
    #[serde(rename = "tool_details_refresh_request")]
    ToolDetailsRefreshRequest,
    #[serde(rename = "controller_rebind_request")]
    ControllerRebindRequest,
    #[serde(rename = "tool_whitelist_update_request")]
    ToolWhitelistUpdateRequest,
    #[serde(rename = "tool_launch_request")]
    ToolLaunchRequest,

    /// Forward compatibility: unknown event types deserialize here.
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Heartbeat => "heartbeat",
            EventType::ToolsSnapshot => "tools_snapshot",
            EventType::ToolsCandidates => "tools_candidates",
            EventType::ToolWhitelistUpdated => "tool_whitelist_updated",
            EventType::ToolDetailsSnapshot => "tool_details_snapshot",
            EventType::ControllerBindUpdated => "controller_bind_updated",
            EventType::MetricsSnapshot => "metrics_snapshot",
            EventType::ToolsRefreshRequest => "tools_refresh_request",
            EventType::ToolDetailsRefreshRequest => "tool_details_refresh_request",
            EventType::ControllerRebindRequest => "controller_rebind_request",
            EventType::ToolWhitelistUpdateRequest => "tool_whitelist_update_request",
            EventType::ToolLaunchRequest => "tool_launch_request",
            EventType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Relay error codes.
pub const CODE_SYSTEM_NOT_REGISTERED: &str = "SYSTEM_NOT_REGISTERED";
pub const CODE_DEVICE_REVOKED: &str = "DEVICE_REVOKED";
pub const CODE_DEVICE_NOT_FOUND: &str = "DEVICE_NOT_FOUND";
pub const CODE_REFRESH_TOKEN_INVALID: &str = "REFRESH_TOKEN_INVALID";
pub const CODE_REFRESH_TOKEN_EXPIRED: &str = "REFRESH_TOKEN_EXPIRED";

// Client-side pairing codes.
pub const CODE_PAIR_TOKEN_NOT_SUPPORTED: &str = "PAIR_TOKEN_NOT_SUPPORTED";
pub const CODE_PAIR_LINK_INVALID: &str = "PAIR_LINK_INVALID";
pub const CODE_PAIRING_BUSY: &str = "PAIRING_BUSY";
pub const CODE_RELAY_UNREACHABLE: &str = "RELAY_UNREACHABLE";
pub const CODE_RESPONSE_NOT_JSON: &str = "RESPONSE_NOT_JSON";
pub const CODE_DEVICE_KEY_UNAVAILABLE: &str = "DEVICE_KEY_UNAVAILABLE";

/// Relay codes after which a device grant can never be used again.
pub const TERMINAL_AUTH_CODES: [&str; 5] = [
    CODE_SYSTEM_NOT_REGISTERED,
    CODE_DEVICE_REVOKED,
    CODE_DEVICE_NOT_FOUND,
    CODE_REFRESH_TOKEN_INVALID,
    CODE_REFRESH_TOKEN_EXPIRED,
];

/// Returns `true` for codes in [`TERMINAL_AUTH_CODES`].
pub fn is_terminal_auth_code(code: &str) -> bool {
    TERMINAL_AUTH_CODES.contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serialization() {
        assert_eq!(
            serde_json::to_string(&EventType::ToolWhitelistUpdated).unwrap(),
            "\"tool_whitelist_updated\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::ToolLaunchRequest).unwrap(),
            "\"tool_launch_request\""
        );
    }

    #[test]
    fn event_type_as_str_matches_serde() {
        for ty in [
            EventType::Heartbeat,
            EventType::ToolsSnapshot,
            EventType::MetricsSnapshot,
            EventType::ControllerRebindRequest,
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn unknown_event_type() {
        let ty: EventType = serde_json::from_str("\"some_future_type\"").unwrap();
        assert_eq!(ty, EventType::Unknown);
    }

    #[test]
    fn terminal_codes() {
        assert!(is_terminal_auth_code("DEVICE_REVOKED"));
        assert!(is_terminal_auth_code("REFRESH_TOKEN_EXPIRED"));
        assert!(!is_terminal_auth_code("RATE_LIMITED"));
        assert!(!is_terminal_auth_code(""));
    }
}
