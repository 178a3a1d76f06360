//! Persisted records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of this client device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
}

impl DeviceIdentity {
    /// Generates a fresh identity named after the local hostname.
    pub fn generate() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: default_device_name(),
        }
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "hostlink device".into())
}

/// A paired remote host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostProfile {
    pub host_id: String,
    pub system_id: String,
    pub relay_url: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub note: String,
    pub paired_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

fn default_true() -> bool {
    true
}

impl HostProfile {
    /// Creates a profile for a freshly paired host.
    pub fn new(system_id: &str, relay_url: &str, display_name: &str) -> Self {
        let now = Utc::now();
        Self {
            host_id: uuid::Uuid::new_v4().to_string(),
            system_id: system_id.to_string(),
            relay_url: relay_url.to_string(),
            display_name: display_name.to_string(),
            note: String::new(),
            paired_at: now,
            updated_at: now,
            auto_connect: true,
        }
    }

    /// Name for display: the configured name, or the system id.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.system_id
        } else {
            &self.display_name
        }
    }

    /// Whether this profile is the host at `(system_id, relay_url)`.
    pub fn matches(&self, system_id: &str, relay_url: &str) -> bool {
        self.system_id == system_id && same_relay(&self.relay_url, relay_url)
    }
}

/// Compares relay URLs ignoring surrounding whitespace and trailing slashes.
pub fn same_relay(a: &str, b: &str) -> bool {
    a.trim().trim_end_matches('/') == b.trim().trim_end_matches('/')
}

/// A queued delete-compensation item.
///
/// The host profile is already gone; the item keeps what is needed to
/// revoke the device grant on the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingHostDelete {
    pub host_id: String,
    pub system_id: String,
    pub relay_url: String,
    pub device_id: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_credential_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_key_id: Option<String>,
}
