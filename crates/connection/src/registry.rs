//! Per-host runtime state.
//!
//! Entries are created lazily and destroyed when a host is disposed. The
//! map lives behind a `std::sync::Mutex` that is only held for short,
//! synchronous sections and never across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;

use hostlink_protocol::events::ToolDetail;
use hostlink_protocol::{ToolAction, ToolInfo};

use crate::socket::SocketHandle;
use crate::timers::{TimerSlot, TimerSlots};
use crate::types::{HostSnapshot, HostStatus, SessionCredential};

pub(crate) type ToolKey = (String, ToolAction);

/// Ephemeral state of one host.
#[derive(Default)]
pub(crate) struct RuntimeState {
    pub(crate) socket: Option<SocketHandle>,
    pub(crate) socket_id: Option<u64>,
    /// Connection generation. Bumped on every open and disconnect.
    pub(crate) epoch: u64,
    pub(crate) connecting: bool,
    pub(crate) connected: bool,
    pub(crate) status: HostStatus,
    pub(crate) sidecar_status: String,
    pub(crate) last_heartbeat_at: Option<DateTime<Utc>>,
    pub(crate) retry_count: u32,
    pub(crate) manual_reconnect_required: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) reconnect_timer: TimerSlot,

    pub(crate) credential: SessionCredential,
    pub(crate) device_public_key: String,

    pub(crate) inbound_count: u64,
    pub(crate) outbound_count: u64,

    pub(crate) connected_tools: Vec<ToolInfo>,
    pub(crate) candidate_tools: Vec<ToolInfo>,
    pub(crate) connecting_tools: HashSet<String>,
    /// Last trace id sent per (tool, action); receipts must match it.
    pub(crate) pending_traces: HashMap<ToolKey, String>,
    /// Automatic retries spent per (tool, action).
    pub(crate) auto_retries: HashMap<ToolKey, u32>,
    pub(crate) tool_timers: TimerSlots<String>,
    pub(crate) candidate_refresh_timer: TimerSlot,
    pub(crate) logical_to_runtime: HashMap<String, String>,
    pub(crate) runtime_to_logical: HashMap<String, String>,
    pub(crate) tool_details: HashMap<String, ToolDetail>,
    pub(crate) pending_detail_refresh: Option<String>,

    pub(crate) system_metrics: Option<Value>,
    pub(crate) sidecar_metrics: Option<Value>,
    pub(crate) tool_metrics: HashMap<String, Value>,
}

impl RuntimeState {
    /// Whether a callback captured with `(epoch, socket_id)` is still current.
    pub(crate) fn is_current(&self, epoch: u64, socket_id: u64) -> bool {
        self.epoch == epoch && self.socket_id == Some(socket_id)
    }

    /// Drops the socket handle, closing it.
    pub(crate) fn release_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.socket_id = None;
    }

    /// Clears state that only makes sense for one connection.
    pub(crate) fn reset_transient(&mut self) {
        self.candidate_tools.clear();
        self.connecting_tools.clear();
        self.pending_traces.clear();
        self.auto_retries.clear();
        self.tool_timers.cancel_all();
        self.candidate_refresh_timer.cancel();
        self.tool_details.clear();
        self.pending_detail_refresh = None;
    }

    /// Records the logical id of each tool so bindings survive reconnects.
    pub(crate) fn bind_tools(&mut self, tools: &[ToolInfo]) {
        for tool in tools {
            if let Some(logical) = tool.logical_id.as_deref().filter(|l| !l.is_empty()) {
                if let Some(old) = self
                    .logical_to_runtime
                    .insert(logical.to_string(), tool.tool_id.clone())
                    && old != tool.tool_id
                {
                    self.runtime_to_logical.remove(&old);
                }
                self.runtime_to_logical
                    .insert(tool.tool_id.clone(), logical.to_string());
            }
        }
    }

    pub(crate) fn snapshot(&self, host_id: &str) -> HostSnapshot {
        let mut connecting_tools: Vec<String> = self.connecting_tools.iter().cloned().collect();
        connecting_tools.sort();
        HostSnapshot {
            host_id: host_id.to_string(),
            status: self.status,
            connecting: self.connecting,
            connected: self.connected,
            epoch: self.epoch,
            retry_count: self.retry_count,
            manual_reconnect_required: self.manual_reconnect_required,
            reconnect_pending: self.reconnect_timer.is_armed(),
            last_error: self.last_error.clone(),
            sidecar_status: self.sidecar_status.clone(),
            last_heartbeat_at: self.last_heartbeat_at,
            inbound_count: self.inbound_count,
            outbound_count: self.outbound_count,
            connected_tools: self.connected_tools.clone(),
            candidate_tools: self.candidate_tools.clone(),
            connecting_tools,
            pending_detail_refresh: self.pending_detail_refresh.clone(),
        }
    }
}

/// Runtime state for every host, keyed by host id.
#[derive(Default)]
pub(crate) struct Registry {
    states: Mutex<HashMap<String, RuntimeState>>,
    next_socket_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, RuntimeState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the host's state, creating it first if needed.
    pub(crate) fn with<R>(&self, host_id: &str, f: impl FnOnce(&mut RuntimeState) -> R) -> R {
        let mut states = self.lock();
        f(states.entry(host_id.to_string()).or_default())
    }

    /// Runs `f` only if the host's state exists.
    pub(crate) fn with_existing<R>(
        &self,
        host_id: &str,
        f: impl FnOnce(&mut RuntimeState) -> R,
    ) -> Option<R> {
        self.lock().get_mut(host_id).map(f)
    }

    pub(crate) fn remove(&self, host_id: &str) -> Option<RuntimeState> {
        self.lock().remove(host_id)
    }

    pub(crate) fn host_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub(crate) fn snapshot(&self, host_id: &str) -> Option<HostSnapshot> {
        self.lock().get(host_id).map(|s| s.snapshot(host_id))
    }

    /// Drops every state, closing sockets and cancelling timers.
    pub(crate) fn clear(&self) {
        let drained: Vec<RuntimeState> = self.lock().drain().map(|(_, s)| s).collect();
        drop(drained);
    }

    pub(crate) fn next_socket_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}
