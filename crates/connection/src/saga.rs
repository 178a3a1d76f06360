//! Delete compensation: revoke a removed host's device grant on the relay,
//! then clear the local session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use hostlink_protocol::api::RevokeDeviceRequest;
use hostlink_protocol::auth::revoke_payload;
use hostlink_protocol::constants::is_terminal_auth_code;
use hostlink_settings::{LogEntry, LogLevel, PendingHostDelete};

use crate::error::relay_error_code;
use crate::manager::ConnectionManager;
use crate::signing::{new_nonce, now_secs};
use crate::types::SessionCredential;

/// First retry delay for a retryable compensation failure.
pub const DELETE_RETRY_BASE: Duration = Duration::from_secs(5);
/// Upper bound on the retry delay.
pub const DELETE_RETRY_CAP: Duration = Duration::from_secs(10 * 60);

pub const CODE_NO_SESSION: &str = "NO_SESSION";
pub const CODE_SESSION_STALE: &str = "SESSION_STALE";
pub const CODE_SESSION_INCOMPLETE: &str = "SESSION_INCOMPLETE";
pub const CODE_CREDENTIAL_STORE_UNAVAILABLE: &str = "CREDENTIAL_STORE_UNAVAILABLE";
pub const CODE_REVOKE_FAILED: &str = "REVOKE_FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaFailureKind {
    /// The stored session belongs to a newer pairing.
    Stale,
    /// The grant is already unusable; nothing left to revoke.
    Terminal,
    NoSession,
    Retryable,
}

impl SagaFailureKind {
    /// Whether the queued item is dropped after this failure.
    pub fn is_final(self) -> bool {
        self != Self::Retryable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} ({code}): {message}")]
pub struct SagaFailure {
    pub kind: SagaFailureKind,
    pub code: String,
    pub message: String,
}

impl SagaFailure {
    fn new(kind: SagaFailureKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Counts from one [`ConnectionManager::process_pending_deletes`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SagaReport {
    /// Revoked and cleared.
    pub resolved: usize,
    /// Dropped without a revoke (stale, terminal, no session).
    pub dropped: usize,
    /// Left queued for a later attempt.
    pub retrying: usize,
}

/// Delay before retry number `retry_count` (1-based).
pub fn retry_delay(retry_count: u32) -> Duration {
    let exp = retry_count.saturating_sub(1).min(16);
    DELETE_RETRY_BASE
        .saturating_mul(1u32 << exp)
        .min(DELETE_RETRY_CAP)
}

impl ConnectionManager {
    /// One compensation attempt for a queued delete.
    pub async fn revoke_and_clear(&self, item: &PendingHostDelete) -> Result<(), SagaFailure> {
        use SagaFailureKind::*;

        let session = self
            .bridge
            .load_session(&item.system_id, &item.device_id)
            .map_err(|e| {
                SagaFailure::new(Retryable, CODE_CREDENTIAL_STORE_UNAVAILABLE, e.to_string())
            })?
            .ok_or_else(|| SagaFailure::new(NoSession, CODE_NO_SESSION, "no stored session"))?;

        let mismatch = |expected: &Option<String>, actual: &str| {
            expected.as_deref().is_some_and(|e| !e.is_empty() && e != actual)
        };
        if mismatch(&item.expected_credential_id, &session.credential_id)
            || mismatch(&item.expected_key_id, &session.key_id)
        {
            return Err(SagaFailure::new(
                Stale,
                CODE_SESSION_STALE,
                "stored session belongs to a newer pairing",
            ));
        }

        if session.access_token.is_empty()
            || session.refresh_token.is_empty()
            || session.key_id.is_empty()
        {
            return Err(SagaFailure::new(
                Terminal,
                CODE_SESSION_INCOMPLETE,
                "stored session lacks access token, refresh token or key id",
            ));
        }

        // What the credential store should hold until the session is cleared.
        let mut held = session.clone();
        let session = match self
            .refresh_credential(&item.system_id, &item.relay_url, &session)
            .await
        {
            Ok(refreshed) => {
                self.ensure_still_queued(item, &held)?;
                match self
                    .bridge
                    .store_session(&item.system_id, &item.device_id, &refreshed)
                {
                    Ok(()) => held = refreshed.clone(),
                    Err(e) => {
                        warn!(system_id = %item.system_id, error = %e, "refreshed session not persisted");
                    }
                }
                refreshed
            }
            Err(failure) if is_terminal_auth_code(&failure.code) => {
                return Err(SagaFailure::new(Terminal, failure.code, failure.message));
            }
            Err(failure) => {
                debug!(system_id = %item.system_id, "refresh before revoke failed: {failure}");
                session
            }
        };

        let ts = now_secs();
        let nonce = new_nonce();
        let sig = self
            .bridge
            .sign(&revoke_payload(
                &item.system_id,
                &item.device_id,
                &item.device_id,
                &session.key_id,
                ts,
                &nonce,
            ))
            .map_err(|e| {
                SagaFailure::new(Retryable, CODE_CREDENTIAL_STORE_UNAVAILABLE, e.to_string())
            })?;

        let resp = self
            .relay
            .revoke_device(
                &item.relay_url,
                &RevokeDeviceRequest {
                    system_id: item.system_id.clone(),
                    device_id: item.device_id.clone(),
                    target_device_id: item.device_id.clone(),
                    access_token: session.access_token.clone(),
                    key_id: session.key_id.clone(),
                    ts,
                    nonce,
                    sig,
                },
            )
            .await
            .map_err(|e| SagaFailure::new(Retryable, relay_error_code(&e), e.to_string()))?;
        if !resp.ok {
            let code = if resp.code_str().is_empty() {
                CODE_REVOKE_FAILED
            } else {
                resp.code_str()
            };
            let kind = if is_terminal_auth_code(code) {
                Terminal
            } else {
                Retryable
            };
            return Err(SagaFailure::new(kind, code, resp.message_str()));
        }

        self.ensure_still_queued(item, &held)?;
        if let Err(e) = self.clear_session(&item.system_id, &item.device_id) {
            warn!(system_id = %item.system_id, error = %e, "revoked session not cleared locally");
        }
        Ok(())
    }

    /// Checks, after an await, that `item` is still queued and the stored
    /// session is still the one this attempt holds.
    fn ensure_still_queued(
        &self,
        item: &PendingHostDelete,
        held: &SessionCredential,
    ) -> Result<(), SagaFailure> {
        use SagaFailureKind::*;

        let queued = self
            .pending_deletes()
            .iter()
            .any(|p| p.host_id == item.host_id && p.system_id == item.system_id);
        if !queued {
            return Err(SagaFailure::new(
                Stale,
                CODE_SESSION_STALE,
                "delete was superseded while revoking",
            ));
        }

        let stored = self
            .bridge
            .load_session(&item.system_id, &item.device_id)
            .map_err(|e| {
                SagaFailure::new(Retryable, CODE_CREDENTIAL_STORE_UNAVAILABLE, e.to_string())
            })?
            .ok_or_else(|| {
                SagaFailure::new(NoSession, CODE_NO_SESSION, "session cleared while revoking")
            })?;
        if stored.credential_id != held.credential_id || stored.key_id != held.key_id {
            return Err(SagaFailure::new(
                Stale,
                CODE_SESSION_STALE,
                "stored session was replaced while revoking",
            ));
        }
        Ok(())
    }

    /// Runs every queued delete due at `now`, one at a time.
    ///
    /// Final outcomes remove the item; retryable ones re-queue it with an
    /// exponential `next_retry_at`. The queue is saved once at the end.
    pub async fn process_pending_deletes(&self, now: DateTime<Utc>) -> SagaReport {
        let due: Vec<PendingHostDelete> = self
            .pending_deletes()
            .into_iter()
            .filter(|item| item.next_retry_at <= now)
            .collect();
        let mut report = SagaReport::default();
        if due.is_empty() {
            return report;
        }

        for item in due {
            let result = self.revoke_and_clear(&item).await;
            let (level, outcome) = match &result {
                Ok(()) => (LogLevel::Info, "revoked"),
                Err(f) if f.kind.is_final() => (LogLevel::Warn, "resolved_without_revoke"),
                Err(_) => (LogLevel::Warn, "retry_scheduled"),
            };
            let mut entry = LogEntry::new(level, "saga", "revoke_and_clear", outcome)
                .host(&item.host_id);
            if let Err(f) = &result {
                entry = entry.detail(f.to_string());
            }
            self.record(entry);

            let mut store = self.config();
            let config = store.config_mut();
            match result {
                Ok(()) => {
                    config.remove_pending_delete(&item.host_id);
                    report.resolved += 1;
                }
                Err(f) if f.kind.is_final() => {
                    config.remove_pending_delete(&item.host_id);
                    report.dropped += 1;
                }
                Err(f) => {
                    let queued = config
                        .pending_deletes
                        .iter_mut()
                        .find(|p| p.host_id == item.host_id);
                    // A re-pair may have dropped the item while we were waiting.
                    if let Some(queued) = queued {
                        queued.retry_count += 1;
                        let delay = chrono::Duration::from_std(retry_delay(queued.retry_count))
                            .unwrap_or_else(|_| chrono::Duration::minutes(10));
                        queued.next_retry_at = now + delay;
                        queued.last_error = Some(f.to_string());
                        report.retrying += 1;
                    }
                }
            }
        }

        if let Err(e) = self.save_config() {
            warn!(error = %e, "failed to save pending deletes");
        }
        info!(
            resolved = report.resolved,
            dropped = report.dropped,
            retrying = report.retrying,
            "pending deletes processed"
        );
        report
    }
}
