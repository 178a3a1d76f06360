//! Outbound send gateway and the requests built on it.

use std::sync::atomic::Ordering;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use hostlink_protocol::events::{
    ControllerRebindRequest, DetailsPriority, ToolDetailsRefreshRequest, ToolLaunchRequest,
    ToolWhitelistUpdateRequest, ToolsRefreshRequest,
};
use hostlink_protocol::{Envelope, EventType, ToolAction};
use hostlink_settings::{LogEntry, LogLevel};

use crate::manager::ConnectionManager;
use crate::signing::{new_id, now_iso};
use crate::types::{LaunchResult, Notice, NoticeLevel, SendOptions};

enum SendOutcome {
    Sent,
    Skipped(&'static str),
    Failed(String),
}

impl ConnectionManager {
    /// Next envelope sequence number: wall-clock milliseconds, strictly
    /// increasing across calls.
    pub(crate) fn next_seq(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let prev = self
            .seq
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }

    /// Sends one envelope on the host's live socket.
    ///
    /// Returns `false` without sending unless the host is connected. Never
    /// fails loudly: every outcome goes to the operation log.
    pub fn send_event<T: Serialize>(
        &self,
        host_id: &str,
        event_type: EventType,
        payload: Option<&T>,
        opts: SendOptions,
    ) -> bool {
        let event_id = new_id();
        let trace_id = opts.trace_id.clone().unwrap_or_else(new_id);
        let action = opts
            .action
            .clone()
            .unwrap_or_else(|| event_type.as_str().to_string());

        let outcome = self.transmit(host_id, event_type, payload, &event_id, &trace_id);

        let (level, label, detail) = match &outcome {
            SendOutcome::Sent => (LogLevel::Debug, "sent", None),
            SendOutcome::Skipped(why) => (LogLevel::Warn, "skipped", Some(why.to_string())),
            SendOutcome::Failed(e) => (LogLevel::Error, "failed", Some(e.clone())),
        };
        let mut entry = LogEntry::new(level, "send", action, label)
            .host(host_id)
            .trace(&trace_id)
            .event(&event_id)
            .tool(opts.tool_id.as_deref());
        if let Some(detail) = detail {
            entry = entry.detail(detail);
        }
        self.record(entry);

        matches!(outcome, SendOutcome::Sent)
    }

    fn transmit<T: Serialize>(
        &self,
        host_id: &str,
        event_type: EventType,
        payload: Option<&T>,
        event_id: &str,
        trace_id: &str,
    ) -> SendOutcome {
        let Some(host) = self.host(host_id) else {
            return SendOutcome::Skipped("unknown host");
        };
        let text = Envelope::new(
            event_id,
            trace_id,
            event_type,
            &host.system_id,
            self.next_seq(),
            now_iso(),
            payload,
        )
        .and_then(|envelope| serde_json::to_string(&envelope));
        let text = match text {
            Ok(text) => text,
            Err(e) => return SendOutcome::Failed(format!("encode: {e}")),
        };

        self.registry
            .with_existing(host_id, |s| {
                if !s.connected {
                    return SendOutcome::Skipped("not connected");
                }
                let Some(socket) = &s.socket else {
                    return SendOutcome::Skipped("no socket");
                };
                match socket.send_text(text) {
                    Ok(()) => {
                        s.outbound_count += 1;
                        SendOutcome::Sent
                    }
                    Err(e) => SendOutcome::Failed(e.to_string()),
                }
            })
            .unwrap_or(SendOutcome::Skipped("not connected"))
    }

    pub fn request_tools_refresh(&self, host_id: &str, reason: &str) -> bool {
        self.send_event(
            host_id,
            EventType::ToolsRefreshRequest,
            Some(&ToolsRefreshRequest {
                reason: reason.to_string(),
            }),
            SendOptions::default(),
        )
    }

    /// Asks the host for fresh tool details. Returns the refresh id when the
    /// request went out; it stays pending until a matching snapshot arrives.
    pub fn request_tool_details_refresh(
        &self,
        host_id: &str,
        tool_id: Option<&str>,
        force: bool,
        priority: DetailsPriority,
    ) -> Option<String> {
        let refresh_id = new_id();
        let previous = self.registry.with_existing(host_id, |s| {
            s.pending_detail_refresh.replace(refresh_id.clone())
        })?;

        let sent = self.send_event(
            host_id,
            EventType::ToolDetailsRefreshRequest,
            Some(&ToolDetailsRefreshRequest {
                refresh_id: refresh_id.clone(),
                tool_id: tool_id.map(str::to_string),
                force,
                priority,
            }),
            SendOptions {
                tool_id: tool_id.map(str::to_string),
                ..Default::default()
            },
        );
        if sent {
            return Some(refresh_id);
        }

        self.registry.with_existing(host_id, |s| {
            if s.pending_detail_refresh.as_deref() == Some(refresh_id.as_str()) {
                s.pending_detail_refresh = previous;
            }
        });
        None
    }

    /// Asks the host to bind its controller to this device. Requires a
    /// connected host.
    pub fn request_controller_rebind(&self, host_id: &str, reason: &str) -> bool {
        let connected = self
            .registry
            .with_existing(host_id, |s| s.connected)
            .unwrap_or(false);
        if !connected {
            self.record(
                LogEntry::new(LogLevel::Warn, "controller", "rebind", "skipped")
                    .host(host_id)
                    .detail("host not connected"),
            );
            return false;
        }

        self.record(
            LogEntry::new(LogLevel::Info, "controller", "rebind", "start")
                .host(host_id)
                .detail(reason),
        );
        let sent = self.send_event(
            host_id,
            EventType::ControllerRebindRequest,
            Some(&ControllerRebindRequest {
                reason: reason.to_string(),
            }),
            SendOptions::default(),
        );
        if !sent {
            self.record(
                LogEntry::new(LogLevel::Error, "controller", "rebind", "failed").host(host_id),
            );
        }
        sent
    }

    /// Launches a tool on the host. `tool_name` and `cwd` must be non-empty.
    pub fn request_tool_launch(
        &self,
        host_id: &str,
        tool_name: &str,
        cwd: &str,
        request_id: Option<String>,
        conversation_key: Option<String>,
    ) -> LaunchResult {
        let request_id = request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_id);
        let tool_name = tool_name.trim();
        let cwd = cwd.trim();
        if tool_name.is_empty() || cwd.is_empty() {
            self.record(
                LogEntry::new(LogLevel::Warn, "launch", "tool_launch_request", "invalid")
                    .host(host_id)
                    .trace(&request_id)
                    .detail("tool name and working directory are required"),
            );
            return LaunchResult {
                ok: false,
                request_id,
            };
        }

        let ok = self.send_event(
            host_id,
            EventType::ToolLaunchRequest,
            Some(&ToolLaunchRequest {
                request_id: request_id.clone(),
                tool_name: tool_name.to_string(),
                cwd: cwd.to_string(),
                conversation_key: conversation_key.filter(|k| !k.is_empty()),
            }),
            SendOptions {
                trace_id: Some(request_id.clone()),
                action: Some("launch".into()),
                ..Default::default()
            },
        );
        LaunchResult { ok, request_id }
    }

    /// User-initiated connect. Restores the automatic retry budget for the tool.
    pub fn request_tool_connect(&self, host_id: &str, tool_id: &str) -> bool {
        self.reset_auto_retry(host_id, tool_id, ToolAction::Connect);
        self.request_tool_whitelist(host_id, tool_id, ToolAction::Connect)
    }

    pub fn request_tool_disconnect(&self, host_id: &str, tool_id: &str) -> bool {
        self.reset_auto_retry(host_id, tool_id, ToolAction::Disconnect);
        self.request_tool_whitelist(host_id, tool_id, ToolAction::Disconnect)
    }

    fn reset_auto_retry(&self, host_id: &str, tool_id: &str, action: ToolAction) {
        self.registry.with_existing(host_id, |s| {
            s.auto_retries.remove(&(tool_id.to_string(), action));
        });
    }

    /// Sends a whitelist update and records its trace id as the only one
    /// whose receipt will be accepted for `(tool_id, action)`.
    pub(crate) fn request_tool_whitelist(
        &self,
        host_id: &str,
        tool_id: &str,
        action: ToolAction,
    ) -> bool {
        if tool_id.trim().is_empty() {
            return false;
        }
        let trace_id = new_id();
        let key = (tool_id.to_string(), action);
        let timeout = self.policy.tool_connect_timeout;

        let mgr = self.clone();
        let timer = (host_id.to_string(), tool_id.to_string(), trace_id.clone());
        let previous = self.registry.with_existing(host_id, |s| {
            let previous = s.pending_traces.insert(key.clone(), trace_id.clone());
            if action == ToolAction::Connect {
                s.connecting_tools.insert(tool_id.to_string());
                s.tool_timers.arm(tool_id.to_string(), timeout, move |timer_id| async move {
                    let (host_id, tool_id, trace_id) = timer;
                    mgr.tool_connect_timed_out(&host_id, &tool_id, &trace_id, timer_id);
                });
            }
            previous
        });
        let Some(previous) = previous else {
            return false;
        };

        let sent = self.send_event(
            host_id,
            EventType::ToolWhitelistUpdateRequest,
            Some(&ToolWhitelistUpdateRequest {
                tool_id: tool_id.to_string(),
                action,
            }),
            SendOptions {
                trace_id: Some(trace_id.clone()),
                tool_id: Some(tool_id.to_string()),
                action: Some(format!("tool_{action}")),
            },
        );
        if sent {
            if action == ToolAction::Connect {
                self.hooks.tools_changed(host_id);
            }
            return true;
        }

        self.registry.with_existing(host_id, |s| {
            if s.pending_traces.get(&key) != Some(&trace_id) {
                return;
            }
            match previous {
                Some(prev) => s.pending_traces.insert(key.clone(), prev),
                None => s.pending_traces.remove(&key),
            };
            if action == ToolAction::Connect {
                s.connecting_tools.remove(tool_id);
                s.tool_timers.cancel(&key.0);
            }
        });
        false
    }

    fn tool_connect_timed_out(&self, host_id: &str, tool_id: &str, trace_id: &str, timer_id: u64) {
        let fired = self
            .registry
            .with_existing(host_id, |s| {
                if !s.tool_timers.clear_if(&tool_id.to_string(), timer_id) {
                    return false;
                }
                s.connecting_tools.remove(tool_id);
                let key = (tool_id.to_string(), ToolAction::Connect);
                if s.pending_traces.get(&key).map(String::as_str) == Some(trace_id) {
                    s.pending_traces.remove(&key);
                }
                true
            })
            .unwrap_or(false);
        if !fired {
            return;
        }

        debug!(host = %host_id, tool_id, "tool connect timed out");
        self.record(
            LogEntry::new(LogLevel::Error, "tool", "tool_connect", "timeout")
                .host(host_id)
                .trace(trace_id)
                .tool(Some(tool_id)),
        );
        self.notify(
            host_id,
            Notice::new(NoticeLevel::Error, "Tool did not respond to the connect request")
                .with_code("TOOL_CONNECT_TIMEOUT")
                .with_tool(tool_id),
        );
        self.hooks.tools_changed(host_id);
    }
}
