//! Connection manager: one context object for every host.
//!
//! Owns the runtime registry, the persisted configuration and the injected
//! collaborators (credential bridge, relay client, socket connector, hooks).
//! Cloning is cheap; every clone shares the same state.

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use hostlink_relay::RelayApi;
use hostlink_settings::{
    ConfigStore, DeviceIdentity, HostProfile, LogEntry, LogLevel, OperationLog, PendingHostDelete,
};

use crate::bridge::CredentialBridge;
use crate::error::ConnectionError;
use crate::hooks::HostHooks;
use crate::registry::Registry;
use crate::signing::connection_url;
use crate::socket::Connector;
use crate::types::{
    ConnectOptions, DisconnectOptions, HostSnapshot, HostStatus, Notice, NoticeLevel,
    ReconnectPolicy, SessionCredential,
};

/// Multi-host connection and session manager.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) device: DeviceIdentity,
    pub(crate) config: Arc<Mutex<ConfigStore>>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) bridge: Arc<dyn CredentialBridge>,
    pub(crate) relay: Arc<dyn RelayApi>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) hooks: Arc<dyn HostHooks>,
    pub(crate) policy: ReconnectPolicy,
    /// Single-flight guard for pairing.
    pub(crate) pairing_busy: Arc<AtomicBool>,
    /// Last envelope sequence number handed out.
    pub(crate) seq: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(
        config: ConfigStore,
        bridge: Arc<dyn CredentialBridge>,
        relay: Arc<dyn RelayApi>,
        connector: Arc<dyn Connector>,
        hooks: Arc<dyn HostHooks>,
    ) -> Self {
        let device = config.config().device.clone();
        Self {
            device,
            config: Arc::new(Mutex::new(config)),
            registry: Arc::new(Registry::default()),
            bridge,
            relay,
            connector,
            hooks,
            policy: ReconnectPolicy::default(),
            pairing_busy: Arc::new(AtomicBool::new(false)),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub(crate) fn config(&self) -> MutexGuard<'_, ConfigStore> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the configuration, including the operation log, to disk.
    pub fn save_config(&self) -> Result<(), ConnectionError> {
        self.config().save()?;
        Ok(())
    }

    pub fn hosts(&self) -> Vec<HostProfile> {
        self.config().config().hosts.clone()
    }

    pub fn host(&self, host_id: &str) -> Option<HostProfile> {
        self.config().config().host(host_id).cloned()
    }

    pub fn pending_deletes(&self) -> Vec<PendingHostDelete> {
        self.config().config().pending_deletes.clone()
    }

    pub fn operation_log(&self) -> OperationLog {
        self.config().config().operation_log.clone()
    }

    /// Runtime view of a host, if it has runtime state.
    pub fn host_snapshot(&self, host_id: &str) -> Option<HostSnapshot> {
        self.registry.snapshot(host_id)
    }

    pub(crate) fn host_profile(&self, host_id: &str) -> Result<HostProfile, ConnectionError> {
        self.host(host_id)
            .ok_or_else(|| ConnectionError::UnknownHost(host_id.to_string()))
    }

    /// Emits an operation outcome to tracing, the operation log and hooks.
    pub(crate) fn record(&self, entry: LogEntry) {
        macro_rules! emit {
            ($lvl:ident) => {
                tracing::$lvl!(
                    scope = %entry.scope,
                    action = %entry.action,
                    outcome = %entry.outcome,
                    host = entry.host_id.as_deref().unwrap_or_default(),
                    trace_id = entry.trace_id.as_deref().unwrap_or_default(),
                    event_id = entry.event_id.as_deref().unwrap_or_default(),
                    tool_id = entry.tool_id.as_deref().unwrap_or_default(),
                    detail = entry.detail.as_deref().unwrap_or_default(),
                    "operation"
                )
            };
        }
        match entry.level {
            LogLevel::Debug => emit!(debug),
            LogLevel::Info => emit!(info),
            LogLevel::Warn => emit!(warn),
            LogLevel::Error => emit!(error),
        }
        self.config().config_mut().push_log(entry.clone());
        self.hooks.log(&entry);
    }

    pub(crate) fn notify(&self, host_id: &str, notice: Notice) {
        self.hooks.notice(host_id, &notice);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Opens the host's socket unless it is already connecting or connected.
    ///
    /// Returns once the socket has been handed to the transport; the open
    /// itself is reported through hooks.
    pub async fn connect_host(
        &self,
        host_id: &str,
        opts: ConnectOptions,
    ) -> Result<(), ConnectionError> {
        let host = self.host_profile(host_id)?;

        let started = self.registry.with(host_id, |s| {
            if s.connecting || s.connected {
                return None;
            }
            if opts.reset_retry {
                s.retry_count = 0;
                s.manual_reconnect_required = false;
            }
            s.reconnect_timer.cancel();
            s.connecting = true;
            s.status = HostStatus::Connecting;
            Some(s.epoch)
        });
        let Some(epoch) = started else {
            debug!(host = %host_id, "connect skipped, already connecting or connected");
            return Ok(());
        };
        info!(host = %host_id, manual = opts.manual, epoch, "connecting");
        self.hooks.state_changed(host_id, HostStatus::Connecting);

        if self
            .load_session(host_id)
            .filter(SessionCredential::can_connect)
            .is_none()
        {
            self.mark_auth_expired(host_id, epoch);
            return Err(ConnectionError::CredentialsMissing(host_id.to_string()));
        }

        if !self.refresh_access_token(host_id).await {
            debug!(host = %host_id, "using stored access token");
        }

        let credential = self
            .registry
            .with_existing(host_id, |s| {
                (s.epoch == epoch && s.connecting).then(|| s.credential.clone())
            })
            .flatten();
        let Some(credential) = credential else {
            debug!(host = %host_id, epoch, "connect superseded during refresh");
            return Ok(());
        };

        let opened = connection_url(
            &host.relay_url,
            &host.system_id,
            &self.device.device_id,
            &credential,
            self.bridge.as_ref(),
        )
        .and_then(|url| self.connector.open(&url));
        let (handle, events) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                self.connect_failed(host_id, epoch, &e, opts.manual);
                return Err(e);
            }
        };

        let mut handle = Some(handle);
        let installed = self
            .registry
            .with_existing(host_id, |s| {
                if s.epoch != epoch || !s.connecting {
                    return None;
                }
                s.release_socket();
                s.epoch += 1;
                let socket_id = self.registry.next_socket_id();
                s.socket = handle.take();
                s.socket_id = Some(socket_id);
                Some((s.epoch, socket_id))
            })
            .flatten();

        match installed {
            Some((epoch, socket_id)) => {
                debug!(host = %host_id, epoch, socket_id, "socket installed");
                self.spawn_dispatcher(host_id.to_string(), epoch, socket_id, events, opts.manual);
            }
            None => {
                if let Some(handle) = handle {
                    handle.close();
                }
                debug!(host = %host_id, "connect superseded before socket install");
            }
        }
        Ok(())
    }

    fn mark_auth_expired(&self, host_id: &str, epoch: u64) {
        let applied = self
            .registry
            .with_existing(host_id, |s| {
                if s.epoch != epoch {
                    return false;
                }
                s.connecting = false;
                s.connected = false;
                s.status = HostStatus::AuthExpired;
                s.manual_reconnect_required = true;
                s.last_error = Some("credentials missing".into());
                true
            })
            .unwrap_or(false);
        if !applied {
            return;
        }
        self.record(
            LogEntry::new(LogLevel::Warn, "connect", "connect_host", "auth_expired")
                .host(host_id)
                .detail("no usable stored credential"),
        );
        self.notify(
            host_id,
            Notice::new(NoticeLevel::Warning, "Credentials expired; pair this host again")
                .with_code("AUTH_EXPIRED"),
        );
        self.hooks.state_changed(host_id, HostStatus::AuthExpired);
    }

    fn connect_failed(&self, host_id: &str, epoch: u64, err: &ConnectionError, manual: bool) {
        let retryable = matches!(err, ConnectionError::Transport(_));
        let status = if retryable {
            HostStatus::RelayUnreachable
        } else {
            HostStatus::Disconnected
        };
        let applied = self
            .registry
            .with_existing(host_id, |s| {
                if s.epoch != epoch {
                    return false;
                }
                s.connecting = false;
                s.connected = false;
                s.status = status;
                s.last_error = Some(err.to_string());
                true
            })
            .unwrap_or(false);
        if !applied {
            return;
        }
        self.record(
            LogEntry::new(LogLevel::Error, "connect", "connect_host", "failed")
                .host(host_id)
                .detail(err.to_string()),
        );
        if manual {
            self.notify(
                host_id,
                Notice::new(NoticeLevel::Error, format!("Connection failed: {err}")),
            );
        }
        self.hooks.state_changed(host_id, status);
        if retryable {
            self.schedule_reconnect(host_id, "open_failed", manual);
        }
    }

    /// Closes the host's socket and invalidates every in-flight callback.
    pub fn disconnect_host(&self, host_id: &str, opts: DisconnectOptions) {
        let epoch = self.registry.with_existing(host_id, |s| {
            s.epoch += 1;
            s.reconnect_timer.cancel();
            s.release_socket();
            s.connecting = false;
            s.connected = false;
            s.status = HostStatus::Disconnected;
            s.reset_transient();
            s.epoch
        });
        let Some(epoch) = epoch else {
            return;
        };
        debug!(host = %host_id, epoch, "disconnected");
        self.record(
            LogEntry::new(LogLevel::Info, "connect", "disconnect_host", "disconnected")
                .host(host_id),
        );
        self.hooks.state_changed(host_id, HostStatus::Disconnected);

        if opts.trigger_reconnect {
            self.schedule_reconnect(host_id, "disconnect", false);
        }
    }

    /// Disconnects, then connects again with a fresh retry budget.
    pub async fn reconnect_host(&self, host_id: &str) -> Result<(), ConnectionError> {
        self.disconnect_host(host_id, DisconnectOptions::default());
        self.connect_host(host_id, ConnectOptions::manual()).await
    }

    /// Connects every auto-connect host concurrently. One host's failure
    /// does not affect the others.
    pub async fn connect_all_hosts(&self) -> Vec<(String, Result<(), ConnectionError>)> {
        let ids: Vec<String> = self
            .hosts()
            .into_iter()
            .filter(|h| h.auto_connect)
            .map(|h| h.host_id)
            .collect();

        let results = join_all(
            ids.iter()
                .map(|id| self.connect_host(id, ConnectOptions::default())),
        )
        .await;

        ids.into_iter()
            .zip(results)
            .inspect(|(id, result)| {
                if let Err(e) = result {
                    warn!(host = %id, error = %e, "connect failed");
                }
            })
            .collect()
    }

    /// Disconnects every host with runtime state.
    pub fn disconnect_all_hosts(&self) {
        for host_id in self.registry.host_ids() {
            self.disconnect_host(&host_id, DisconnectOptions::default());
        }
    }

    /// Forgets a host locally. When a stored session exists, queues a
    /// delete compensation so the device grant is revoked on the relay.
    ///
    /// Returns whether a compensation item was queued.
    pub fn remove_host(&self, host_id: &str) -> Result<bool, ConnectionError> {
        let host = self.host_profile(host_id)?;
        self.disconnect_host(host_id, DisconnectOptions::default());
        self.registry.remove(host_id);

        let session = match self
            .bridge
            .load_session(&host.system_id, &self.device.device_id)
        {
            Ok(session) => session,
            Err(e) => {
                warn!(host = %host_id, error = %e, "could not read session for removed host");
                None
            }
        };

        let queued = {
            let mut store = self.config();
            let config = store.config_mut();
            config.remove_host(host_id);
            let queued = if let Some(session) = session {
                let now = Utc::now();
                config.queue_delete(PendingHostDelete {
                    host_id: host.host_id.clone(),
                    system_id: host.system_id.clone(),
                    relay_url: host.relay_url.clone(),
                    device_id: self.device.device_id.clone(),
                    enqueued_at: now,
                    retry_count: 0,
                    next_retry_at: now,
                    last_error: None,
                    expected_credential_id: non_empty(session.credential_id),
                    expected_key_id: non_empty(session.key_id),
                });
                true
            } else {
                false
            };
            store.save()?;
            queued
        };

        self.record(
            LogEntry::new(
                LogLevel::Info,
                "host",
                "remove_host",
                if queued { "revoke_queued" } else { "removed" },
            )
            .host(host_id),
        );
        Ok(queued)
    }

    /// Disconnects everything, cancels all timers and saves the configuration.
    pub fn shutdown(&self) -> Result<(), ConnectionError> {
        self.disconnect_all_hosts();
        self.registry.clear();
        info!("connection manager shut down");
        self.save_config()
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}
