//! Socket event dispatch and bounded reconnect scheduling.
//!
//! Every callback captured for a socket carries the `(epoch, socket_id)`
//! pair it was created under and re-checks it against the registry before
//! touching state, so events from a superseded socket are dropped.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, info, trace, warn};

use hostlink_settings::{LogEntry, LogLevel};

use crate::manager::ConnectionManager;
use crate::socket::{SocketEvent, SocketEvents};
use crate::types::{ConnectOptions, HostStatus, Notice, NoticeLevel};

enum Schedule {
    Armed(u32),
    /// Budget spent; the manual-reconnect latch is set.
    Exhausted,
    /// A timer is already pending.
    Pending,
}

impl ConnectionManager {
    /// Routes one socket's events to the guarded handlers.
    pub(crate) fn spawn_dispatcher(
        &self,
        host_id: String,
        epoch: u64,
        socket_id: u64,
        mut events: SocketEvents,
        manual: bool,
    ) {
        let mgr = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SocketEvent::Open => mgr.on_open(&host_id, epoch, socket_id),
                    SocketEvent::Message(raw) => mgr.on_message(&host_id, epoch, socket_id, &raw),
                    SocketEvent::Error(e) => mgr.on_error(&host_id, epoch, socket_id, &e),
                    SocketEvent::Close { code, reason } => {
                        mgr.on_close(&host_id, epoch, socket_id, code, &reason, manual);
                        return;
                    }
                }
            }
            // Transport task went away without reporting a close.
            mgr.on_close(&host_id, epoch, socket_id, None, "event stream ended", manual);
        });
    }

    fn on_open(&self, host_id: &str, epoch: u64, socket_id: u64) {
        let current = self
            .registry
            .with_existing(host_id, |s| {
                if !s.is_current(epoch, socket_id) {
                    return false;
                }
                s.connecting = false;
                s.connected = true;
                s.status = HostStatus::Connected;
                s.retry_count = 0;
                s.manual_reconnect_required = false;
                s.last_error = None;
                s.reconnect_timer.cancel();
                true
            })
            .unwrap_or(false);
        if !current {
            trace!(host = %host_id, epoch, socket_id, "stale open ignored");
            return;
        }

        info!(host = %host_id, epoch, "connected");
        self.record(LogEntry::new(LogLevel::Info, "connect", "socket_open", "connected").host(host_id));
        self.hooks.state_changed(host_id, HostStatus::Connected);
        self.request_tools_refresh(host_id, "connected");
    }

    fn on_message(&self, host_id: &str, epoch: u64, socket_id: u64, raw: &str) {
        let current = self
            .registry
            .with_existing(host_id, |s| {
                let current = s.is_current(epoch, socket_id);
                if current {
                    s.inbound_count += 1;
                }
                current
            })
            .unwrap_or(false);
        if current {
            self.ingest_event(host_id, raw);
        }
    }

    fn on_error(&self, host_id: &str, epoch: u64, socket_id: u64, error: &str) {
        let current = self
            .registry
            .with_existing(host_id, |s| {
                if !s.is_current(epoch, socket_id) {
                    return false;
                }
                s.connecting = false;
                s.connected = false;
                s.status = HostStatus::RelayUnreachable;
                s.last_error = Some(error.to_string());
                true
            })
            .unwrap_or(false);
        if !current {
            return;
        }
        warn!(host = %host_id, error, "socket error");
        self.record(
            LogEntry::new(LogLevel::Warn, "connect", "socket_error", "relay_unreachable")
                .host(host_id)
                .detail(error),
        );
        self.hooks
            .state_changed(host_id, HostStatus::RelayUnreachable);
    }

    fn on_close(
        &self,
        host_id: &str,
        epoch: u64,
        socket_id: u64,
        code: Option<u16>,
        reason: &str,
        manual: bool,
    ) {
        let status = self.registry.with_existing(host_id, |s| {
            if !s.is_current(epoch, socket_id) {
                return None;
            }
            s.release_socket();
            s.connecting = false;
            s.connected = false;
            if !matches!(
                s.status,
                HostStatus::RelayUnreachable | HostStatus::AuthExpired
            ) {
                s.status = HostStatus::Disconnected;
            }
            if s.last_error.is_none() && !reason.is_empty() {
                s.last_error = Some(reason.to_string());
            }
            s.reset_transient();
            Some(s.status)
        });
        let Some(status) = status.flatten() else {
            trace!(host = %host_id, epoch, socket_id, "stale close ignored");
            return;
        };

        info!(host = %host_id, ?code, reason, "socket closed");
        let mut entry = LogEntry::new(LogLevel::Info, "connect", "socket_close", "closed")
            .host(host_id);
        if let Some(code) = code {
            entry = entry.detail(format!("{code} {reason}"));
        } else if !reason.is_empty() {
            entry = entry.detail(reason);
        }
        self.record(entry);
        self.hooks.state_changed(host_id, status);
        self.schedule_reconnect(host_id, "socket_closed", manual);
    }

    /// Arms a single delayed reconnect attempt.
    ///
    /// At most one timer is pending per host. The count is bounded by the
    /// policy's `max_attempts`; reaching it latches `manual_reconnect_required`
    /// and nothing more is scheduled until a manual connect clears it.
    pub(crate) fn schedule_reconnect(&self, host_id: &str, reason: &str, manual: bool) -> bool {
        let Some(host) = self.host(host_id) else {
            return false;
        };
        if !host.auto_connect {
            debug!(host = %host_id, "auto-connect off, not scheduling reconnect");
            return false;
        }

        let mgr = self.clone();
        let owned_id = host_id.to_string();
        let max_attempts = self.policy.max_attempts;
        let delay = self.policy.delay;
        let outcome = self
            .registry
            .with_existing(host_id, move |s| {
                if s.reconnect_timer.is_armed() {
                    return Schedule::Pending;
                }
                if s.manual_reconnect_required || s.retry_count >= max_attempts {
                    s.manual_reconnect_required = true;
                    return Schedule::Exhausted;
                }
                s.retry_count += 1;
                if s.retry_count >= max_attempts {
                    s.manual_reconnect_required = true;
                }
                s.reconnect_timer
                    .arm(delay, move |timer_id| mgr.reconnect_attempt(owned_id, timer_id, manual));
                Schedule::Armed(s.retry_count)
            })
            .unwrap_or(Schedule::Pending);

        match outcome {
            Schedule::Armed(attempt) => {
                debug!(host = %host_id, attempt, reason, "reconnect scheduled");
                self.record(
                    LogEntry::new(LogLevel::Info, "connect", "schedule_reconnect", "scheduled")
                        .host(host_id)
                        .detail(format!("attempt {attempt}/{max_attempts}: {reason}")),
                );
                true
            }
            Schedule::Exhausted => {
                self.record(
                    LogEntry::new(LogLevel::Warn, "connect", "schedule_reconnect", "exhausted")
                        .host(host_id)
                        .detail(reason),
                );
                self.notify(
                    host_id,
                    Notice::new(NoticeLevel::Warning, "Reconnect attempts exhausted; reconnect manually")
                        .with_code("RECONNECT_EXHAUSTED"),
                );
                false
            }
            Schedule::Pending => false,
        }
    }

    // Boxed to break the connect -> close -> schedule -> connect type cycle.
    fn reconnect_attempt(
        self,
        host_id: String,
        timer_id: u64,
        manual: bool,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let fired = self
                .registry
                .with_existing(&host_id, |s| s.reconnect_timer.clear_if(timer_id))
                .unwrap_or(false);
            if !fired {
                return;
            }
            let opts = ConnectOptions {
                manual,
                reset_retry: false,
            };
            if let Err(e) = self.connect_host(&host_id, opts).await {
                debug!(host = %host_id, error = %e, "scheduled reconnect failed");
            }
        })
    }
}
