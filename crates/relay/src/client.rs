//! Relay HTTP client.
//!
//! Async JSON client using `reqwest`. Every request is tried against each
//! derived API base in turn; only transport failures move on to the next
//! base, an HTTP response of any status ends the attempt.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use hostlink_protocol::api::{
    ApiResponse, CredentialData, ExchangeRequest, PATH_AUTH_REFRESH, PATH_AUTH_REVOKE_DEVICE,
    PATH_PAIR_EXCHANGE, PATH_PAIR_PREFLIGHT, PreflightRequest, RefreshRequest,
    RevokeDeviceRequest,
};

use crate::base::api_bases;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Body excerpt kept in [`RelayError::NotJson`].
const BODY_EXCERPT_LEN: usize = 200;

/// Errors from the relay client.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("relay unreachable: {0}")]
    Unreachable(String),

    #[error("relay response not JSON (HTTP {status}): {excerpt}")]
    NotJson { status: u16, excerpt: String },
}

/// Relay endpoints used by the connection core.
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn preflight(
        &self,
        relay_url: &str,
        req: &PreflightRequest,
    ) -> Result<ApiResponse<serde_json::Value>, RelayError>;

    async fn exchange(
        &self,
        relay_url: &str,
        req: &ExchangeRequest,
    ) -> Result<ApiResponse<CredentialData>, RelayError>;

    async fn refresh(
        &self,
        relay_url: &str,
        req: &RefreshRequest,
    ) -> Result<ApiResponse<CredentialData>, RelayError>;

    async fn revoke_device(
        &self,
        relay_url: &str,
        req: &RevokeDeviceRequest,
    ) -> Result<ApiResponse<serde_json::Value>, RelayError>;
}

/// Relay HTTP client.
pub struct RelayClient {
    http: reqwest::Client,
}

impl RelayClient {
    /// Creates a new client.
    pub fn new() -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Unreachable(e.to_string()))?;
        Ok(Self { http })
    }

    /// POSTs `body` to `path` under the relay's API base(s).
    pub async fn post_json<B, T>(
        &self,
        relay_url: &str,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse<T>, RelayError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let bases = api_bases(relay_url)?;
        self.post_to_bases(&bases, path, body).await
    }

    async fn post_to_bases<B, T>(
        &self,
        bases: &[String],
        path: &str,
        body: &B,
    ) -> Result<ApiResponse<T>, RelayError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let mut last_error = String::from("no API base");
        for base in bases {
            let url = format!("{base}{path}");
            match self.http.post(&url).json(body).send().await {
                Ok(resp) => return decode_response(resp).await,
                Err(e) => {
                    debug!(url = %url, error = %e, "relay request failed");
                    last_error = e.to_string();
                }
            }
        }
        warn!(path, error = %last_error, "relay unreachable on every base");
        Err(RelayError::Unreachable(last_error))
    }
}

/// Parses a relay response, keeping HTTP failures as application failures.
async fn decode_response<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<ApiResponse<T>, RelayError> {
    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| RelayError::Unreachable(e.to_string()))?;

    let mut parsed: ApiResponse<T> =
        serde_json::from_slice(&body).map_err(|_| RelayError::NotJson {
            status: status.as_u16(),
            excerpt: String::from_utf8_lossy(&body)
                .chars()
                .take(BODY_EXCERPT_LEN)
                .collect(),
        })?;

    if !status.is_success() {
        parsed.ok = false;
        if parsed.code.is_none() {
            parsed.code = Some(format!("HTTP_{}", status.as_u16()));
        }
    }
    Ok(parsed)
}

#[async_trait]
impl RelayApi for RelayClient {
    async fn preflight(
        &self,
        relay_url: &str,
        req: &PreflightRequest,
    ) -> Result<ApiResponse<serde_json::Value>, RelayError> {
        self.post_json(relay_url, PATH_PAIR_PREFLIGHT, req).await
    }

    async fn exchange(
        &self,
        relay_url: &str,
        req: &ExchangeRequest,
    ) -> Result<ApiResponse<CredentialData>, RelayError> {
        self.post_json(relay_url, PATH_PAIR_EXCHANGE, req).await
    }

    async fn refresh(
        &self,
        relay_url: &str,
        req: &RefreshRequest,
    ) -> Result<ApiResponse<CredentialData>, RelayError> {
        self.post_json(relay_url, PATH_AUTH_REFRESH, req).await
    }

    async fn revoke_device(
        &self,
        relay_url: &str,
        req: &RevokeDeviceRequest,
    ) -> Result<ApiResponse<serde_json::Value>, RelayError> {
        self.post_json(relay_url, PATH_AUTH_REVOKE_DEVICE, req).await
    }
}
