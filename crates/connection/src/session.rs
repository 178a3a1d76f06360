//! Device sessions: load, store, clear and signed token refresh.

use tracing::{debug, warn};

use hostlink_protocol::api::RefreshRequest;
use hostlink_protocol::auth::refresh_payload;
use hostlink_protocol::constants::CODE_DEVICE_KEY_UNAVAILABLE;
use hostlink_settings::{LogEntry, LogLevel};

use crate::error::{ConnectionError, relay_error_code};
use crate::manager::ConnectionManager;
use crate::signing::{new_nonce, now_secs};
use crate::types::{RefreshFailure, SessionCredential};

/// Refresh attempted without the fields it needs.
pub const CODE_CREDENTIALS_INCOMPLETE: &str = "CREDENTIALS_INCOMPLETE";

impl ConnectionManager {
    /// Reads the stored session for a host into its runtime state.
    ///
    /// Bridge failures are logged and reported as no session.
    pub fn load_session(&self, host_id: &str) -> Option<SessionCredential> {
        let host = self.host(host_id)?;
        match self
            .bridge
            .load_session(&host.system_id, &self.device.device_id)
        {
            Ok(Some(credential)) => {
                let public_key = self.bridge.device_key().map(|k| k.public_key).ok();
                self.registry.with(host_id, |s| {
                    s.credential = credential.clone();
                    if let Some(key) = public_key {
                        s.device_public_key = key;
                    }
                });
                Some(credential)
            }
            Ok(None) => None,
            Err(e) => {
                self.record(
                    LogEntry::new(LogLevel::Warn, "session", "load_session", "failed")
                        .host(host_id)
                        .detail(e.to_string()),
                );
                None
            }
        }
    }

    /// Writes the host's runtime credential through the bridge.
    pub fn store_session(&self, host_id: &str) -> Result<(), ConnectionError> {
        let host = self.host_profile(host_id)?;
        let credential = self
            .registry
            .with_existing(host_id, |s| s.credential.clone())
            .unwrap_or_default();
        self.bridge
            .store_session(&host.system_id, &self.device.device_id, &credential)?;
        debug!(host = %host_id, "session stored");
        Ok(())
    }

    pub fn clear_session(&self, system_id: &str, device_id: &str) -> Result<(), ConnectionError> {
        self.bridge.clear_session(system_id, device_id)?;
        debug!(system_id, device_id, "session cleared");
        Ok(())
    }

    /// Best-effort access-token refresh for a host.
    ///
    /// Returns `false` on any failure; callers carry on with the stored
    /// token and let the relay decide.
    pub async fn refresh_access_token(&self, host_id: &str) -> bool {
        let Some(host) = self.host(host_id) else {
            return false;
        };
        let Some((epoch, current)) = self
            .registry
            .with_existing(host_id, |s| (s.epoch, s.credential.clone()))
        else {
            return false;
        };

        match self
            .refresh_credential(&host.system_id, &host.relay_url, &current)
            .await
        {
            Ok(refreshed) => {
                // A disconnect or a new pairing may have landed during the call.
                let applied = self
                    .registry
                    .with_existing(host_id, |s| {
                        let unchanged = s.epoch == epoch
                            && s.credential.credential_id == current.credential_id
                            && s.credential.key_id == current.key_id;
                        if unchanged {
                            s.credential = refreshed;
                        }
                        unchanged
                    })
                    .unwrap_or(false);
                if !applied {
                    debug!(host = %host_id, epoch, "refresh result dropped, session superseded");
                    return false;
                }
                if let Err(e) = self.store_session(host_id) {
                    warn!(host = %host_id, error = %e, "refreshed session not persisted");
                }
                self.record(
                    LogEntry::new(LogLevel::Info, "session", "refresh_access_token", "refreshed")
                        .host(host_id),
                );
                true
            }
            Err(failure) if failure.code == CODE_CREDENTIALS_INCOMPLETE => {
                debug!(host = %host_id, "refresh skipped: {}", failure.message);
                false
            }
            Err(failure) => {
                self.record(
                    LogEntry::new(LogLevel::Warn, "session", "refresh_access_token", "failed")
                        .host(host_id)
                        .detail(failure.to_string()),
                );
                false
            }
        }
    }

    /// Signed refresh of `credential` against the relay.
    ///
    /// Never touches runtime state. The returned credential keeps every
    /// field the response leaves empty.
    pub(crate) async fn refresh_credential(
        &self,
        system_id: &str,
        relay_url: &str,
        credential: &SessionCredential,
    ) -> Result<SessionCredential, RefreshFailure> {
        let device_id = &self.device.device_id;
        if credential.refresh_token.is_empty()
            || credential.key_id.is_empty()
            || system_id.is_empty()
            || device_id.is_empty()
        {
            return Err(RefreshFailure::new(
                CODE_CREDENTIALS_INCOMPLETE,
                "refresh token, key id, system id and device id are required",
            ));
        }

        let ts = now_secs();
        let nonce = new_nonce();
        let sig = self
            .bridge
            .sign(&refresh_payload(
                system_id,
                device_id,
                &credential.key_id,
                ts,
                &nonce,
            ))
            .map_err(|e| RefreshFailure::new(CODE_DEVICE_KEY_UNAVAILABLE, e.to_string()))?;

        let req = RefreshRequest {
            system_id: system_id.to_string(),
            device_id: device_id.clone(),
            refresh_token: credential.refresh_token.clone(),
            key_id: credential.key_id.clone(),
            ts,
            nonce,
            sig,
        };
        let resp = self
            .relay
            .refresh(relay_url, &req)
            .await
            .map_err(|e| RefreshFailure::new(relay_error_code(&e), e.to_string()))?;
        if !resp.ok {
            return Err(RefreshFailure::new(resp.code_str(), resp.message_str()));
        }

        let mut refreshed = credential.clone();
        if let Some(data) = &resp.data {
            refreshed.merge(data);
        }
        Ok(refreshed)
    }
}
