//! Pairing exchange: preflight, signed proof, credential exchange.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{info, warn};

use hostlink_protocol::api::{ExchangeRequest, PreflightRequest};
use hostlink_protocol::auth::pair_proof_payload;
use hostlink_protocol::constants::{
    CODE_DEVICE_KEY_UNAVAILABLE, CODE_PAIR_LINK_INVALID, CODE_PAIR_TOKEN_NOT_SUPPORTED,
    CODE_PAIRING_BUSY,
};
use hostlink_settings::{HostProfile, LogEntry, LogLevel};

use crate::error::relay_error_code;
use crate::manager::ConnectionManager;
use crate::types::{
    ConnectOptions, DisconnectOptions, PairingFailure, PairingRequest, SessionCredential,
};

pub const CODE_PREFLIGHT_REJECTED: &str = "PREFLIGHT_REJECTED";
pub const CODE_EXCHANGE_REJECTED: &str = "EXCHANGE_REJECTED";
pub const CODE_EXCHANGE_INCOMPLETE: &str = "EXCHANGE_INCOMPLETE";
pub const CODE_CREDENTIAL_STORE_FAILED: &str = "CREDENTIAL_STORE_FAILED";

/// Releases the single-flight flag when pairing ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConnectionManager {
    /// Pairs with a host and connects to it. Returns the host id.
    ///
    /// Only one pairing runs at a time; a concurrent call fails with
    /// `PAIRING_BUSY`.
    pub async fn pair(&self, req: PairingRequest) -> Result<String, PairingFailure> {
        if self
            .pairing_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.pairing_failed(PairingFailure {
                code: CODE_PAIRING_BUSY.into(),
                message: "Another pairing is already in progress".into(),
                suggestion: Some("Wait for it to finish, then try again".into()),
                source: req.source,
            }));
        }
        let _busy = BusyGuard(&self.pairing_busy);

        self.run_pairing(&req)
            .await
            .map_err(|failure| self.pairing_failed(failure))
    }

    fn pairing_failed(&self, failure: PairingFailure) -> PairingFailure {
        self.record(
            LogEntry::new(LogLevel::Error, "pairing", "pair", "failed")
                .detail(failure.to_string()),
        );
        self.hooks.pairing_failed(&failure);
        failure
    }

    async fn run_pairing(&self, req: &PairingRequest) -> Result<String, PairingFailure> {
        let fail = |code: &str, message: String, suggestion: Option<String>| PairingFailure {
            code: code.to_string(),
            message,
            suggestion,
            source: req.source,
        };

        let relay_url = req.relay_url.trim();
        let system_id = req.system_id.trim();
        let ticket = req.pair_ticket.trim();
        if ticket.is_empty() || system_id.is_empty() || relay_url.is_empty() {
            return Err(if req.pair_token.trim().is_empty() {
                fail(
                    CODE_PAIR_LINK_INVALID,
                    "Pairing link is missing the relay, system id or ticket".into(),
                    Some("Copy the full pairing link from the host".into()),
                )
            } else {
                fail(
                    CODE_PAIR_TOKEN_NOT_SUPPORTED,
                    "Pairing tokens without a ticket are no longer supported".into(),
                    Some("Update the host and generate a new pairing link".into()),
                )
            });
        }
        let device_id = self.device.device_id.as_str();

        let preflight = self
            .relay
            .preflight(
                relay_url,
                &PreflightRequest {
                    system_id: system_id.into(),
                    device_id: device_id.into(),
                    pair_ticket: ticket.into(),
                },
            )
            .await
            .map_err(|e| {
                fail(
                    relay_error_code(&e),
                    e.to_string(),
                    Some("Check the relay address and your network".into()),
                )
            })?;
        if !preflight.ok {
            return Err(fail(
                non_empty_or(preflight.code_str(), CODE_PREFLIGHT_REJECTED),
                preflight.message_str().to_string(),
                preflight.suggestion.clone(),
            ));
        }

        let key = self
            .bridge
            .device_key()
            .map_err(|e| fail(CODE_DEVICE_KEY_UNAVAILABLE, e.to_string(), None))?;
        let proof = self
            .bridge
            .sign(&pair_proof_payload(system_id, device_id, &key.key_id))
            .map_err(|e| fail(CODE_DEVICE_KEY_UNAVAILABLE, e.to_string(), None))?;

        let exchange = self
            .relay
            .exchange(
                relay_url,
                &ExchangeRequest {
                    system_id: system_id.into(),
                    device_id: device_id.into(),
                    device_name: self.device.device_name.clone(),
                    pair_ticket: ticket.into(),
                    key_id: key.key_id.clone(),
                    device_pub_key: key.public_key.clone(),
                    proof,
                },
            )
            .await
            .map_err(|e| {
                fail(
                    relay_error_code(&e),
                    e.to_string(),
                    Some("Check the relay address and your network".into()),
                )
            })?;
        if !exchange.ok {
            return Err(fail(
                non_empty_or(exchange.code_str(), CODE_EXCHANGE_REJECTED),
                exchange.message_str().to_string(),
                exchange.suggestion.clone(),
            ));
        }
        let mut credential = SessionCredential {
            key_id: key.key_id.clone(),
            ..Default::default()
        };
        if let Some(data) = &exchange.data {
            credential.merge(data);
        }
        if !credential.can_connect() || credential.refresh_token.is_empty() {
            return Err(fail(
                CODE_EXCHANGE_INCOMPLETE,
                "Relay returned an incomplete credential".into(),
                Some("Generate a new pairing link and try again".into()),
            ));
        }

        let host_id = {
            let mut store = self.config();
            let config = store.config_mut();
            let mut host = config
                .find_host(system_id, relay_url)
                .cloned()
                .unwrap_or_else(|| HostProfile::new(system_id, relay_url, ""));
            if !req.display_name.trim().is_empty() {
                host.display_name = req.display_name.trim().to_string();
            }
            host.updated_at = Utc::now();
            let host_id = host.host_id.clone();
            config.upsert_host(host);
            host_id
        };

        self.registry.with(&host_id, |s| {
            s.credential = credential;
            s.device_public_key = key.public_key.clone();
        });
        self.store_session(&host_id)
            .map_err(|e| fail(CODE_CREDENTIAL_STORE_FAILED, e.to_string(), None))?;

        let superseded = {
            let mut store = self.config();
            let removed = store
                .config_mut()
                .remove_pending_deletes_for(system_id, relay_url);
            if let Err(e) = store.save() {
                warn!(error = %e, "failed to save config after pairing");
            }
            removed
        };

        info!(host = %host_id, system_id, superseded, "paired");
        let mut entry = LogEntry::new(LogLevel::Info, "pairing", "pair", "paired").host(&host_id);
        if superseded > 0 {
            entry = entry.detail(format!("superseded {superseded} pending delete(s)"));
        }
        self.record(entry);

        self.disconnect_host(&host_id, DisconnectOptions::default());
        if let Err(e) = self
            .connect_host(&host_id, ConnectOptions::manual())
            .await
        {
            warn!(host = %host_id, error = %e, "connect after pairing failed");
        }
        Ok(host_id)
    }
}

fn non_empty_or<'a>(code: &'a str, fallback: &'a str) -> &'a str {
    if code.is_empty() { fallback } else { code }
}
