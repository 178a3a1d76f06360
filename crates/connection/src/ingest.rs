//! Inbound event ingestion.
//!
//! One decode step turns raw text into an [`InboundEvent`]; anything that
//! fails to decode is dropped.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, trace};

use hostlink_protocol::constants::TOOL_AUTO_RETRY_LIMIT;
use hostlink_protocol::events::{
    ControllerBindUpdatedPayload, MetricsSnapshotPayload, ToolDetailsSnapshotPayload,
    ToolWhitelistUpdatedPayload,
};
use hostlink_protocol::{Envelope, InboundEvent, ToolAction, ToolInfo};
use hostlink_settings::{LogEntry, LogLevel};

use crate::manager::ConnectionManager;
use crate::types::{Notice, NoticeLevel};

static NOT_BOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)not\s+bound|controlling\s+device|controller\s+(binding|mismatch)")
        .expect("valid regex")
});

static CANDIDATES_PENDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)candidates?\s+(pending|not\s+ready)|not\s+(yet\s+)?converged|unknown\s+tool|not\s+found\s+in\s+(the\s+)?tool\s+list",
    )
    .expect("valid regex")
});

/// Recoverable classes of whitelist failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClass {
    /// The host's controller is bound to another device.
    NotBound,
    /// The host has not yet converged its candidate list.
    CandidatesPending,
    Terminal,
}

/// Classifies a failed receipt, preferring the stable `reasonCode`.
pub(crate) fn classify_failure(reason_code: Option<&str>, reason: Option<&str>) -> FailureClass {
    match reason_code {
        Some("TOOL_NOT_BOUND" | "CONTROLLER_NOT_BOUND") => return FailureClass::NotBound,
        Some("CANDIDATES_NOT_CONVERGED" | "TOOL_NOT_CANDIDATE") => {
            return FailureClass::CandidatesPending;
        }
        _ => {}
    }
    let reason = reason.unwrap_or_default();
    if NOT_BOUND_RE.is_match(reason) {
        FailureClass::NotBound
    } else if CANDIDATES_PENDING_RE.is_match(reason) {
        FailureClass::CandidatesPending
    } else {
        FailureClass::Terminal
    }
}

impl ConnectionManager {
    /// Parses and applies one inbound message. Unparseable input is dropped.
    pub fn ingest_event(&self, host_id: &str, raw: &str) {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(env) => env,
            Err(e) => {
                trace!(host = %host_id, "dropping unparseable message: {e}");
                return;
            }
        };
        let event = match InboundEvent::decode(&envelope) {
            Ok(event) => event,
            Err(e) => {
                debug!(host = %host_id, event_type = %envelope.event_type, "dropping malformed payload: {e}");
                return;
            }
        };

        match event {
            InboundEvent::Heartbeat(p) => {
                self.registry.with_existing(host_id, |s| {
                    if let Some(status) = p.sidecar_status {
                        s.sidecar_status = status;
                    }
                    s.last_heartbeat_at = Some(chrono::Utc::now());
                });
            }
            InboundEvent::ToolsSnapshot(p) => self.on_tools_snapshot(host_id, p.tools),
            InboundEvent::ToolsCandidates(p) => self.on_tools_candidates(host_id, p.candidates),
            InboundEvent::ToolWhitelistUpdated(p) => {
                self.on_whitelist_updated(host_id, &envelope.trace_id, p);
            }
            InboundEvent::ToolDetailsSnapshot(p) => self.on_tool_details(host_id, p),
            InboundEvent::ControllerBindUpdated(p) => self.on_controller_bind(host_id, p),
            InboundEvent::MetricsSnapshot(p) => self.on_metrics(host_id, p),
            InboundEvent::Other(event_type) => {
                trace!(host = %host_id, %event_type, "ignoring event");
            }
        }
    }

    fn on_tools_snapshot(&self, host_id: &str, tools: Vec<ToolInfo>) {
        let applied = self.registry.with_existing(host_id, |s| {
            for tool in &tools {
                s.connecting_tools.remove(&tool.tool_id);
                s.tool_timers.cancel(&tool.tool_id);
                let key = (tool.tool_id.clone(), ToolAction::Connect);
                s.pending_traces.remove(&key);
                s.auto_retries.remove(&key);
            }
            s.bind_tools(&tools);
            s.connected_tools = tools;
        });
        if applied.is_some() {
            self.hooks.tools_changed(host_id);
        }
    }

    fn on_tools_candidates(&self, host_id: &str, candidates: Vec<ToolInfo>) {
        let mgr = self.clone();
        let owned_id = host_id.to_string();
        let debounce = self.policy.candidate_debounce;
        self.registry.with_existing(host_id, move |s| {
            s.candidate_tools = candidates;
            s.candidate_refresh_timer.arm(debounce, move |timer_id| async move {
                let fired = mgr
                    .registry
                    .with_existing(&owned_id, |s| s.candidate_refresh_timer.clear_if(timer_id))
                    .unwrap_or(false);
                if fired {
                    mgr.hooks.candidate_tools_changed(&owned_id);
                }
            });
        });
    }

    fn on_whitelist_updated(&self, host_id: &str, trace_id: &str, p: ToolWhitelistUpdatedPayload) {
        let key = (p.tool_id.clone(), p.action);
        let current = self
            .registry
            .with_existing(host_id, |s| {
                if s.pending_traces.get(&key).map(String::as_str) != Some(trace_id) {
                    return false;
                }
                s.pending_traces.remove(&key);
                s.tool_timers.cancel(&p.tool_id);
                s.connecting_tools.remove(&p.tool_id);
                true
            })
            .unwrap_or(false);
        if !current {
            debug!(host = %host_id, tool_id = %p.tool_id, trace_id, "stale whitelist receipt ignored");
            return;
        }

        let action = format!("tool_{}", p.action);
        if p.ok {
            self.registry.with_existing(host_id, |s| s.auto_retries.remove(&key));
            self.record(
                LogEntry::new(LogLevel::Info, "tool", action, "ok")
                    .host(host_id)
                    .trace(trace_id)
                    .tool(Some(&p.tool_id)),
            );
            let verb = match p.action {
                ToolAction::Connect => "connected",
                ToolAction::Disconnect => "disconnected",
            };
            self.notify(
                host_id,
                Notice::new(NoticeLevel::Success, format!("Tool {verb}")).with_tool(&p.tool_id),
            );
            self.hooks.tools_changed(host_id);
            self.request_tools_refresh(host_id, "whitelist_updated");
            return;
        }

        let reason = p.reason.clone().unwrap_or_default();
        let class = classify_failure(p.reason_code.as_deref(), p.reason.as_deref());
        let retry = class != FailureClass::Terminal
            && self
                .registry
                .with_existing(host_id, |s| {
                    let spent = s.auto_retries.entry(key.clone()).or_default();
                    if *spent >= TOOL_AUTO_RETRY_LIMIT {
                        return false;
                    }
                    *spent += 1;
                    true
                })
                .unwrap_or(false);

        if retry {
            self.record(
                LogEntry::new(LogLevel::Warn, "tool", action, "auto_retry")
                    .host(host_id)
                    .trace(trace_id)
                    .tool(Some(&p.tool_id))
                    .detail(&reason),
            );
            match class {
                FailureClass::NotBound => {
                    self.request_controller_rebind(host_id, "tool_not_bound");
                }
                FailureClass::CandidatesPending => {
                    self.request_tools_refresh(host_id, "candidates_pending");
                }
                FailureClass::Terminal => {}
            }
            self.request_tool_whitelist(host_id, &p.tool_id, p.action);
            return;
        }

        self.registry.with_existing(host_id, |s| s.auto_retries.remove(&key));
        self.record(
            LogEntry::new(LogLevel::Error, "tool", action, "failed")
                .host(host_id)
                .trace(trace_id)
                .tool(Some(&p.tool_id))
                .detail(&reason),
        );
        let message = if reason.is_empty() {
            format!("Tool {} failed", p.action)
        } else {
            format!("Tool {} failed: {reason}", p.action)
        };
        let mut notice = Notice::new(NoticeLevel::Error, message).with_tool(&p.tool_id);
        if let Some(code) = p.reason_code {
            notice = notice.with_code(code);
        }
        self.notify(host_id, notice);
        self.hooks.tools_changed(host_id);
    }

    fn on_tool_details(&self, host_id: &str, p: ToolDetailsSnapshotPayload) {
        let applied = self.registry.with_existing(host_id, |s| {
            if p.refresh_id.is_some() && p.refresh_id == s.pending_detail_refresh {
                s.pending_detail_refresh = None;
            }
            for detail in p.details {
                s.tool_details.insert(detail.tool_id.clone(), detail);
            }
        });
        if applied.is_some() {
            self.hooks.tools_changed(host_id);
        }
    }

    fn on_controller_bind(&self, host_id: &str, p: ControllerBindUpdatedPayload) {
        let (level, outcome) = match (p.ok, p.changed) {
            (false, _) => (LogLevel::Warn, "failed"),
            (true, true) => (LogLevel::Info, "changed"),
            (true, false) => (LogLevel::Debug, "noop"),
        };
        let mut entry =
            LogEntry::new(level, "controller", "controller_bind_updated", outcome).host(host_id);
        if let Some(reason) = p.reason {
            entry = entry.detail(reason);
        }
        self.record(entry);
    }

    fn on_metrics(&self, host_id: &str, p: MetricsSnapshotPayload) {
        let synthesized = self
            .registry
            .with_existing(host_id, |s| {
                if p.system.is_some() {
                    s.system_metrics = p.system;
                }
                if p.sidecar.is_some() {
                    s.sidecar_metrics = p.sidecar;
                }
                s.tool_metrics.extend(p.tools);
                match p.primary_tool {
                    Some(primary) if s.connected_tools.is_empty() => {
                        s.tool_metrics
                            .entry(primary.tool_id.clone())
                            .or_insert(primary.metrics);
                        s.connected_tools = vec![ToolInfo {
                            tool_id: primary.tool_id,
                            name: primary.name,
                            tool_type: primary.tool_type,
                            ..Default::default()
                        }];
                        true
                    }
                    _ => false,
                }
            })
            .unwrap_or(false);
        if synthesized {
            self.hooks.tools_changed(host_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, settle};
    use crate::types::ConnectOptions;

    async fn connected(fx: &Fixture) -> String {
        let host_id = fx.add_paired_host("sys-a");
        fx.manager
            .connect_host(&host_id, ConnectOptions::default())
            .await
            .unwrap();
        settle().await;
        fx.connector.socket(0).take_sent();
        host_id
    }

    fn receipt(trace: &str, tool: &str, ok: bool, reason: &str) -> String {
        serde_json::json!({
            "type": "tool_whitelist_updated",
            "traceId": trace,
            "payload": {"toolId": tool, "action": "connect", "ok": ok, "reason": reason},
        })
        .to_string()
    }

    fn pending_trace(fx: &Fixture, host_id: &str, tool: &str) -> Option<String> {
        fx.manager.registry.with(host_id, |s| {
            s.pending_traces
                .get(&(tool.to_string(), ToolAction::Connect))
                .cloned()
        })
    }

    fn sent_types(fx: &Fixture) -> Vec<String> {
        fx.connector.socket(0).sent_types()
    }

    #[test]
    fn classification_prefers_reason_code() {
        assert_eq!(
            classify_failure(Some("CONTROLLER_NOT_BOUND"), Some("whatever")),
            FailureClass::NotBound
        );
        assert_eq!(
            classify_failure(Some("CANDIDATES_NOT_CONVERGED"), None),
            FailureClass::CandidatesPending
        );
        assert_eq!(
            classify_failure(None, Some("Tool is NOT bound to the controlling device")),
            FailureClass::NotBound
        );
        assert_eq!(
            classify_failure(None, Some("candidate list not converged yet")),
            FailureClass::CandidatesPending
        );
        assert_eq!(
            classify_failure(None, Some("tool not found in tool list")),
            FailureClass::CandidatesPending
        );
        assert_eq!(
            classify_failure(Some("QUOTA"), Some("quota exceeded")),
            FailureClass::Terminal
        );
        assert_eq!(classify_failure(None, None), FailureClass::Terminal);
    }

    #[test]
    fn mentioning_candidates_is_not_enough() {
        assert_eq!(
            classify_failure(None, Some("candidate rejected by policy")),
            FailureClass::Terminal
        );
        assert_eq!(
            classify_failure(None, Some("tool is not a candidate for this host")),
            FailureClass::Terminal
        );
        assert_eq!(
            classify_failure(None, Some("candidates pending")),
            FailureClass::CandidatesPending
        );
        assert_eq!(
            classify_failure(None, Some("candidate not ready")),
            FailureClass::CandidatesPending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_is_dropped() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        let before = fx.manager.operation_log().len();

        fx.manager.ingest_event(&host_id, "not json");
        fx.manager
            .ingest_event(&host_id, r#"{"type":"tools_snapshot","payload":{"tools":7}}"#);
        fx.manager.ingest_event(&host_id, r#"{"type":"brand_new","payload":{}}"#);

        assert_eq!(fx.manager.operation_log().len(), before);
        assert!(fx.manager.host_snapshot(&host_id).unwrap().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_updates_status_only() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        fx.manager.ingest_event(
            &host_id,
            r#"{"type":"heartbeat","payload":{"sidecarStatus":"ready"}}"#,
        );
        let snap = fx.manager.host_snapshot(&host_id).unwrap();
        assert_eq!(snap.sidecar_status, "ready");
        assert!(snap.last_heartbeat_at.is_some());
        assert!(snap.connected);

        fx.manager
            .ingest_event(&host_id, r#"{"type":"heartbeat","payload":{}}"#);
        assert_eq!(fx.manager.host_snapshot(&host_id).unwrap().sidecar_status, "ready");
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_clears_connecting_state_for_present_tools() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        fx.manager.request_tool_connect(&host_id, "t-1");
        fx.manager.request_tool_connect(&host_id, "t-2");

        fx.manager.ingest_event(
            &host_id,
            r#"{"type":"tools_snapshot","payload":{"tools":[{"toolId":"t-1","name":"coder","logicalId":"cli:coder"}]}}"#,
        );

        let snap = fx.manager.host_snapshot(&host_id).unwrap();
        assert_eq!(snap.connected_tools.len(), 1);
        assert_eq!(snap.connecting_tools, vec!["t-2".to_string()]);
        assert!(pending_trace(&fx, &host_id, "t-1").is_none());
        assert!(pending_trace(&fx, &host_id, "t-2").is_some());
        fx.manager.registry.with(&host_id, |s| {
            assert!(!s.tool_timers.is_armed(&"t-1".to_string()));
            assert!(s.tool_timers.is_armed(&"t-2".to_string()));
            assert_eq!(s.logical_to_runtime["cli:coder"], "t-1");
        });
        assert!(fx.hooks.tools_changed_count(&host_id) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_are_debounced() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        let candidates = r#"{"type":"tools_candidates","payload":{"candidates":[{"toolId":"c-1"}]}}"#;

        fx.manager.ingest_event(&host_id, candidates);
        fx.manager.ingest_event(&host_id, candidates);
        assert_eq!(fx.manager.host_snapshot(&host_id).unwrap().candidate_tools.len(), 1);
        assert_eq!(fx.hooks.candidates_changed_count(&host_id), 0);

        tokio::time::sleep(fx.manager.policy.candidate_debounce).await;
        settle().await;
        assert_eq!(fx.hooks.candidates_changed_count(&host_id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_receipt_is_ignored() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        fx.manager.request_tool_connect(&host_id, "t-1");
        let current = pending_trace(&fx, &host_id, "t-1").unwrap();
        fx.connector.socket(0).take_sent();
        let log_len = fx.manager.operation_log().len();

        fx.manager
            .ingest_event(&host_id, &receipt("old-trace", "t-1", true, ""));

        assert_eq!(pending_trace(&fx, &host_id, "t-1"), Some(current));
        assert_eq!(fx.manager.operation_log().len(), log_len);
        assert!(fx.hooks.notice_codes().is_empty());
        assert!(sent_types(&fx).is_empty());
        assert_eq!(
            fx.manager.host_snapshot(&host_id).unwrap().connecting_tools,
            vec!["t-1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_receipt_refreshes_tools() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        fx.manager.request_tool_connect(&host_id, "t-1");
        let trace = pending_trace(&fx, &host_id, "t-1").unwrap();
        fx.connector.socket(0).take_sent();

        fx.manager.ingest_event(&host_id, &receipt(&trace, "t-1", true, ""));

        assert!(pending_trace(&fx, &host_id, "t-1").is_none());
        assert!(fx.manager.host_snapshot(&host_id).unwrap().connecting_tools.is_empty());
        assert_eq!(sent_types(&fx), vec!["tools_refresh_request".to_string()]);
        assert_eq!(fx.hooks.notice_levels(), vec![NoticeLevel::Success]);

        // Timer was cancelled; no timeout later.
        tokio::time::sleep(fx.manager.policy.tool_connect_timeout * 2).await;
        settle().await;
        assert_eq!(fx.hooks.notice_levels(), vec![NoticeLevel::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn not_bound_failure_rebinds_and_retries_once() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        fx.manager.request_tool_connect(&host_id, "t-1");
        let first = pending_trace(&fx, &host_id, "t-1").unwrap();
        fx.connector.socket(0).take_sent();

        fx.manager.ingest_event(
            &host_id,
            &receipt(&first, "t-1", false, "tool not bound to controlling device"),
        );
        assert_eq!(
            sent_types(&fx),
            vec![
                "controller_rebind_request".to_string(),
                "tool_whitelist_update_request".to_string()
            ]
        );
        let second = pending_trace(&fx, &host_id, "t-1").unwrap();
        assert_ne!(first, second);
        assert!(fx.hooks.notice_levels().is_empty());

        // The retried request fails the same way: no further retry.
        fx.manager.ingest_event(
            &host_id,
            &receipt(&second, "t-1", false, "tool not bound to controlling device"),
        );
        assert!(sent_types(&fx).is_empty());
        assert!(pending_trace(&fx, &host_id, "t-1").is_none());
        assert_eq!(fx.hooks.notice_levels(), vec![NoticeLevel::Error]);
        assert!(fx.manager.registry.with(&host_id, |s| s.auto_retries.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_failure_refreshes_and_retries() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        fx.manager.request_tool_connect(&host_id, "t-1");
        let trace = pending_trace(&fx, &host_id, "t-1").unwrap();
        fx.connector.socket(0).take_sent();

        fx.manager.ingest_event(
            &host_id,
            &receipt(&trace, "t-1", false, "candidate list not converged"),
        );
        assert_eq!(
            sent_types(&fx),
            vec![
                "tools_refresh_request".to_string(),
                "tool_whitelist_update_request".to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_presents_error() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        fx.manager.request_tool_connect(&host_id, "t-1");
        let trace = pending_trace(&fx, &host_id, "t-1").unwrap();
        fx.connector.socket(0).take_sent();

        fx.manager
            .ingest_event(&host_id, &receipt(&trace, "t-1", false, "quota exceeded"));
        assert!(sent_types(&fx).is_empty());
        assert_eq!(fx.hooks.notice_levels(), vec![NoticeLevel::Error]);
        let last = fx.manager.operation_log().last().cloned().unwrap();
        assert_eq!(last.outcome, "failed");
        assert_eq!(last.detail.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn details_snapshot_clears_matching_refresh() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        let id = fx
            .manager
            .request_tool_details_refresh(&host_id, None, false, Default::default())
            .unwrap();

        let raw = serde_json::json!({
            "type": "tool_details_snapshot",
            "payload": {"refreshId": id, "details": [
                {"toolId": "t-1", "schema": "usage.v1", "payload": {"tokens": 3}, "stale": true}
            ]},
        })
        .to_string();
        fx.manager.ingest_event(&host_id, &raw);

        assert!(fx.manager.host_snapshot(&host_id).unwrap().pending_detail_refresh.is_none());
        fx.manager.registry.with(&host_id, |s| {
            let detail = &s.tool_details["t-1"];
            assert_eq!(detail.schema, "usage.v1");
            assert!(detail.stale);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn controller_bind_is_logged_only() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        fx.manager.ingest_event(
            &host_id,
            r#"{"type":"controller_bind_updated","payload":{"ok":true,"changed":true}}"#,
        );
        let last = fx.manager.operation_log().last().cloned().unwrap();
        assert_eq!(last.action, "controller_bind_updated");
        assert_eq!(last.outcome, "changed");
        assert!(sent_types(&fx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_synthesize_primary_tool() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        let raw = r#"{"type":"metrics_snapshot","payload":{
            "system":{"cpu":0.5},
            "primaryTool":{"toolId":"t-9","name":"coder","toolType":"cli","metrics":{"rss":1}}
        }}"#;

        fx.manager.ingest_event(&host_id, raw);
        let snap = fx.manager.host_snapshot(&host_id).unwrap();
        assert_eq!(snap.connected_tools.len(), 1);
        assert_eq!(snap.connected_tools[0].tool_id, "t-9");

        // A real snapshot wins; later metrics do not replace it.
        fx.manager.ingest_event(
            &host_id,
            r#"{"type":"tools_snapshot","payload":{"tools":[{"toolId":"a"},{"toolId":"b"}]}}"#,
        );
        fx.manager.ingest_event(&host_id, raw);
        assert_eq!(fx.manager.host_snapshot(&host_id).unwrap().connected_tools.len(), 2);
        fx.manager.registry.with(&host_id, |s| {
            assert!(s.system_metrics.is_some());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn partial_metrics_keep_cached_values() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        fx.manager.ingest_event(
            &host_id,
            r#"{"type":"metrics_snapshot","payload":{
                "system":{"cpu":0.5},"sidecar":{"rss":10},"tools":{"t-1":{"rss":1}}
            }}"#,
        );
        fx.manager.ingest_event(
            &host_id,
            r#"{"type":"metrics_snapshot","payload":{"sidecar":{"rss":12},"tools":{"t-2":{"rss":2}}}}"#,
        );

        fx.manager.registry.with(&host_id, |s| {
            assert_eq!(s.system_metrics, Some(serde_json::json!({"cpu": 0.5})));
            assert_eq!(s.sidecar_metrics, Some(serde_json::json!({"rss": 12})));
            assert_eq!(s.tool_metrics.len(), 2);
            assert_eq!(s.tool_metrics["t-2"], serde_json::json!({"rss": 2}));
        });
    }

    #[tokio::test(start_paused = true)]
    async fn user_request_restores_retry_budget() {
        let fx = Fixture::new();
        let host_id = connected(&fx).await;
        let not_bound = "tool not bound to controlling device";
        fx.manager.request_tool_connect(&host_id, "t-1");
        let first = pending_trace(&fx, &host_id, "t-1").unwrap();

        // First failure spends the budget on an automatic retry, which then times out.
        fx.manager
            .ingest_event(&host_id, &receipt(&first, "t-1", false, not_bound));
        assert!(pending_trace(&fx, &host_id, "t-1").is_some());
        tokio::time::sleep(fx.manager.policy.tool_connect_timeout).await;
        settle().await;
        assert!(pending_trace(&fx, &host_id, "t-1").is_none());
        fx.connector.socket(0).take_sent();

        // A fresh user request gets its own automatic retry.
        fx.manager.request_tool_connect(&host_id, "t-1");
        let third = pending_trace(&fx, &host_id, "t-1").unwrap();
        fx.connector.socket(0).take_sent();
        fx.manager
            .ingest_event(&host_id, &receipt(&third, "t-1", false, not_bound));

        assert_eq!(
            sent_types(&fx),
            vec![
                "controller_rebind_request".to_string(),
                "tool_whitelist_update_request".to_string()
            ]
        );
        assert_ne!(pending_trace(&fx, &host_id, "t-1"), Some(third));
    }
}
