//! Error types for the connection core.

use hostlink_protocol::constants::{CODE_RELAY_UNREACHABLE, CODE_RESPONSE_NOT_JSON};
use hostlink_relay::RelayError;
use hostlink_settings::SettingsError;

/// Errors from the credential store bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("device key error: {0}")]
    Key(String),
}

/// Errors from connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("credentials missing for host {0}")]
    CredentialsMissing(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("credential store error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Stable failure code for a relay client error.
pub(crate) fn relay_error_code(err: &RelayError) -> &'static str {
    match err {
        RelayError::NotJson { .. } => CODE_RESPONSE_NOT_JSON,
        RelayError::InvalidUrl(_) | RelayError::Unreachable(_) => CODE_RELAY_UNREACHABLE,
    }
}
