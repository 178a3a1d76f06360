//! Relay HTTP request and response bodies.

use serde::{Deserialize, Serialize};

pub const PATH_PAIR_PREFLIGHT: &str = "/pair/preflight";
pub const PATH_PAIR_EXCHANGE: &str = "/pair/exchange";
pub const PATH_AUTH_REFRESH: &str = "/auth/refresh";
pub const PATH_AUTH_REVOKE_DEVICE: &str = "/auth/revoke-device";

/// Common relay response shape: `{ok, code, message, suggestion, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Failure code, or an empty string.
    pub fn code_str(&self) -> &str {
        self.code.as_deref().unwrap_or_default()
    }

    /// Failure message, or an empty string.
    pub fn message_str(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// Credential material returned by exchange and refresh.
///
/// Fields the relay leaves out deserialize as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialData {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub credential_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightRequest {
    pub system_id: String,
    pub device_id: String,
    pub pair_ticket: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    pub system_id: String,
    pub device_id: String,
    pub device_name: String,
    pub pair_ticket: String,
    pub key_id: String,
    pub device_pub_key: String,
    pub proof: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub system_id: String,
    pub device_id: String,
    pub refresh_token: String,
    pub key_id: String,
    pub ts: i64,
    pub nonce: String,
    pub sig: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeDeviceRequest {
    pub system_id: String,
    pub device_id: String,
    pub target_device_id: String,
    pub access_token: String,
    pub key_id: String,
    pub ts: i64,
    pub nonce: String,
    pub sig: String,
}
