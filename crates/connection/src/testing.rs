//! In-process doubles for the transport, the relay and the hooks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use hostlink_protocol::api::{
    ApiResponse, CredentialData, ExchangeRequest, PreflightRequest, RefreshRequest,
    RevokeDeviceRequest,
};
use hostlink_relay::{RelayApi, RelayError};
use hostlink_settings::{
    ConfigStore, DeviceIdentity, HostProfile, LogEntry, PersistedConfig,
};

use crate::bridge::{CredentialBridge, FileCredentialStore};
use crate::error::ConnectionError;
use crate::hooks::HostHooks;
use crate::manager::ConnectionManager;
use crate::socket::{Connector, SocketEvent, SocketEvents, SocketHandle};
use crate::types::{HostStatus, Notice, NoticeLevel, PairingFailure, SessionCredential};

pub(crate) const RELAY_URL: &str = "wss://relay.test/ws";
pub(crate) const DEVICE_ID: &str = "dev-1";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lets spawned tasks run. Advances paused time by a few milliseconds.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub(crate) struct MockSocket {
    pub url: String,
    pub events_tx: mpsc::Sender<SocketEvent>,
    frames: Mutex<mpsc::Receiver<tungstenite::Message>>,
    pub cancel: CancellationToken,
}

impl MockSocket {
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drains the text frames written so far.
    pub fn take_sent(&self) -> Vec<String> {
        let mut frames = lock(&self.frames);
        let mut out = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            if let tungstenite::Message::Text(text) = frame {
                out.push(text.as_str().to_owned());
            }
        }
        out
    }

    /// Drains the written frames and returns their envelope types.
    pub fn sent_types(&self) -> Vec<String> {
        self.take_sent()
            .iter()
            .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
            .filter_map(|v| v["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn push_message(&self, raw: &str) {
        let _ = self.events_tx.try_send(SocketEvent::Message(raw.to_string()));
    }

    pub fn push_error(&self, error: &str) {
        let _ = self.events_tx.try_send(SocketEvent::Error(error.to_string()));
    }

    pub fn close_from_remote(&self, code: u16, reason: &str) {
        let _ = self.events_tx.try_send(SocketEvent::Close {
            code: Some(code),
            reason: reason.to_string(),
        });
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    sockets: Mutex<Vec<Arc<MockSocket>>>,
    fail_for: Mutex<Vec<String>>,
    close_immediately: AtomicBool,
}

impl MockConnector {
    /// Makes `open` fail for URLs containing `needle`.
    pub fn fail_for(&self, needle: &str) {
        lock(&self.fail_for).push(needle.to_string());
    }

    /// New sockets report an error and close instead of opening.
    pub fn set_close_immediately(&self, on: bool) {
        self.close_immediately.store(on, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        lock(&self.sockets).len()
    }

    pub fn socket(&self, index: usize) -> Arc<MockSocket> {
        lock(&self.sockets)[index].clone()
    }
}

impl Connector for MockConnector {
    fn open(&self, url: &str) -> Result<(SocketHandle, SocketEvents), ConnectionError> {
        if lock(&self.fail_for).iter().any(|n| url.contains(n.as_str())) {
            return Err(ConnectionError::Transport("connection refused".into()));
        }
        let (write_tx, write_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        if self.close_immediately.load(Ordering::SeqCst) {
            let _ = events_tx.try_send(SocketEvent::Error("handshake refused".into()));
            let _ = events_tx.try_send(SocketEvent::Close {
                code: Some(1006),
                reason: "handshake refused".into(),
            });
        } else {
            let _ = events_tx.try_send(SocketEvent::Open);
        }

        lock(&self.sockets).push(Arc::new(MockSocket {
            url: url.to_string(),
            events_tx,
            frames: Mutex::new(write_rx),
            cancel: cancel.clone(),
        }));
        Ok((SocketHandle::new(write_tx, cancel), events_rx))
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Scripted relay. An endpoint with nothing queued is unreachable.
#[derive(Default)]
pub(crate) struct MockRelay {
    preflight: Mutex<VecDeque<ApiResponse<Value>>>,
    exchange: Mutex<VecDeque<ApiResponse<CredentialData>>>,
    refresh: Mutex<VecDeque<ApiResponse<CredentialData>>>,
    revoke: Mutex<VecDeque<ApiResponse<Value>>>,
    calls: Mutex<Vec<&'static str>>,
    exchange_reqs: Mutex<Vec<ExchangeRequest>>,
    refresh_reqs: Mutex<Vec<RefreshRequest>>,
    revoke_reqs: Mutex<Vec<RevokeDeviceRequest>>,
    refresh_gate: Mutex<Option<Arc<Notify>>>,
    revoke_gate: Mutex<Option<Arc<Notify>>>,
}

fn ok<T>(data: Option<T>) -> ApiResponse<T> {
    ApiResponse {
        ok: true,
        code: None,
        message: None,
        suggestion: None,
        data,
    }
}

fn rejected<T>(code: &str, message: &str, suggestion: Option<&str>) -> ApiResponse<T> {
    ApiResponse {
        ok: false,
        code: Some(code.to_string()),
        message: Some(message.to_string()),
        suggestion: suggestion.map(str::to_string),
        data: None,
    }
}

/// Waits on a one-shot gate if one is armed. The gate is consumed by the
/// first call that sees it.
async fn pass_gate(gate: &Mutex<Option<Arc<Notify>>>) {
    let armed = lock(gate).take();
    if let Some(notify) = armed {
        notify.notified().await;
    }
}

fn next<T>(queue: &Mutex<VecDeque<ApiResponse<T>>>) -> Result<ApiResponse<T>, RelayError> {
    lock(queue)
        .pop_front()
        .ok_or_else(|| RelayError::Unreachable("connection refused".into()))
}

impl MockRelay {
    pub fn push_preflight_ok(&self) {
        lock(&self.preflight).push_back(ok(None));
    }

    pub fn push_preflight_err(&self, code: &str, message: &str, suggestion: Option<&str>) {
        lock(&self.preflight).push_back(rejected(code, message, suggestion));
    }

    pub fn push_exchange_ok(&self, access_token: &str, refresh_token: &str, credential_id: &str) {
        lock(&self.exchange).push_back(ok(Some(CredentialData {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            key_id: String::new(),
            credential_id: credential_id.into(),
        })));
    }

    pub fn push_refresh_ok(&self, access_token: &str, refresh_token: &str) {
        lock(&self.refresh).push_back(ok(Some(CredentialData {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            ..Default::default()
        })));
    }

    pub fn push_refresh_err(&self, code: &str) {
        lock(&self.refresh).push_back(rejected(code, "refresh rejected", None));
    }

    pub fn push_revoke_ok(&self) {
        lock(&self.revoke).push_back(ok(None));
    }

    pub fn push_revoke_err(&self, code: &str) {
        lock(&self.revoke).push_back(rejected(code, "revoke rejected", None));
    }

    /// Holds the next refresh call open until the returned gate is notified.
    /// Its response is taken from the queue before it blocks.
    pub fn hold_refresh(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.refresh_gate) = Some(gate.clone());
        gate
    }

    /// Same as [`MockRelay::hold_refresh`] for revoke calls.
    pub fn hold_revoke(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.revoke_gate) = Some(gate.clone());
        gate
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn last_exchange(&self) -> Option<ExchangeRequest> {
        lock(&self.exchange_reqs).last().cloned()
    }

    pub fn last_refresh(&self) -> Option<RefreshRequest> {
        lock(&self.refresh_reqs).last().cloned()
    }

    pub fn last_revoke(&self) -> Option<RevokeDeviceRequest> {
        lock(&self.revoke_reqs).last().cloned()
    }
}

#[async_trait]
impl RelayApi for MockRelay {
    async fn preflight(
        &self,
        _relay_url: &str,
        _req: &PreflightRequest,
    ) -> Result<ApiResponse<Value>, RelayError> {
        lock(&self.calls).push("preflight");
        next(&self.preflight)
    }

    async fn exchange(
        &self,
        _relay_url: &str,
        req: &ExchangeRequest,
    ) -> Result<ApiResponse<CredentialData>, RelayError> {
        lock(&self.calls).push("exchange");
        lock(&self.exchange_reqs).push(req.clone());
        next(&self.exchange)
    }

    async fn refresh(
        &self,
        _relay_url: &str,
        req: &RefreshRequest,
    ) -> Result<ApiResponse<CredentialData>, RelayError> {
        lock(&self.calls).push("refresh");
        lock(&self.refresh_reqs).push(req.clone());
        let resp = next(&self.refresh);
        pass_gate(&self.refresh_gate).await;
        resp
    }

    async fn revoke_device(
        &self,
        _relay_url: &str,
        req: &RevokeDeviceRequest,
    ) -> Result<ApiResponse<Value>, RelayError> {
        lock(&self.calls).push("revoke_device");
        lock(&self.revoke_reqs).push(req.clone());
        let resp = next(&self.revoke);
        pass_gate(&self.revoke_gate).await;
        resp
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingHooks {
    logs: Mutex<Vec<LogEntry>>,
    notices: Mutex<Vec<(String, Notice)>>,
    states: Mutex<Vec<(String, HostStatus)>>,
    tools_changed: Mutex<Vec<String>>,
    candidates_changed: Mutex<Vec<String>>,
    pairing_failures: Mutex<Vec<PairingFailure>>,
}

impl RecordingHooks {
    pub fn log_count(&self) -> usize {
        lock(&self.logs).len()
    }

    pub fn statuses(&self, host_id: &str) -> Vec<HostStatus> {
        lock(&self.states)
            .iter()
            .filter(|(h, _)| h == host_id)
            .map(|(_, s)| *s)
            .collect()
    }

    /// Codes of the notices raised so far; notices without a code are skipped.
    pub fn notice_codes(&self) -> Vec<String> {
        lock(&self.notices)
            .iter()
            .filter_map(|(_, n)| n.code.clone())
            .collect()
    }

    pub fn notice_levels(&self) -> Vec<NoticeLevel> {
        lock(&self.notices).iter().map(|(_, n)| n.level).collect()
    }

    pub fn tools_changed_count(&self, host_id: &str) -> usize {
        lock(&self.tools_changed)
            .iter()
            .filter(|h| *h == host_id)
            .count()
    }

    pub fn candidates_changed_count(&self, host_id: &str) -> usize {
        lock(&self.candidates_changed)
            .iter()
            .filter(|h| *h == host_id)
            .count()
    }

    pub fn pairing_failures(&self) -> Vec<String> {
        lock(&self.pairing_failures)
            .iter()
            .map(|f| f.code.clone())
            .collect()
    }
}

impl HostHooks for RecordingHooks {
    fn log(&self, entry: &LogEntry) {
        lock(&self.logs).push(entry.clone());
    }

    fn notice(&self, host_id: &str, notice: &Notice) {
        lock(&self.notices).push((host_id.to_string(), notice.clone()));
    }

    fn state_changed(&self, host_id: &str, status: HostStatus) {
        lock(&self.states).push((host_id.to_string(), status));
    }

    fn tools_changed(&self, host_id: &str) {
        lock(&self.tools_changed).push(host_id.to_string());
    }

    fn candidate_tools_changed(&self, host_id: &str) {
        lock(&self.candidates_changed).push(host_id.to_string());
    }

    fn pairing_failed(&self, failure: &PairingFailure) {
        lock(&self.pairing_failures).push(failure.clone());
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// A manager wired to mocks, with an in-memory config and a temp-dir
/// credential store.
pub(crate) struct Fixture {
    pub manager: ConnectionManager,
    pub connector: Arc<MockConnector>,
    pub relay: Arc<MockRelay>,
    pub hooks: Arc<RecordingHooks>,
    pub bridge: Arc<FileCredentialStore>,
    _dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(FileCredentialStore::open(dir.path().to_path_buf()).unwrap());
        let connector = Arc::new(MockConnector::default());
        let relay = Arc::new(MockRelay::default());
        let hooks = Arc::new(RecordingHooks::default());
        let config = ConfigStore::in_memory(PersistedConfig::new(DeviceIdentity {
            device_id: DEVICE_ID.into(),
            device_name: "test device".into(),
        }));

        let manager = ConnectionManager::new(
            config,
            bridge.clone(),
            relay.clone(),
            connector.clone(),
            hooks.clone(),
        );
        Self {
            manager,
            connector,
            relay,
            hooks,
            bridge,
            _dir: dir,
        }
    }

    /// Adds a host profile without a stored session.
    pub fn add_host(&self, system_id: &str) -> String {
        let host = HostProfile::new(system_id, RELAY_URL, "");
        let host_id = host.host_id.clone();
        self.manager.config().config_mut().upsert_host(host);
        host_id
    }

    /// Stores a complete session for `system_id` on this device.
    pub fn seed_session(&self, system_id: &str) {
        self.bridge
            .store_session(
                system_id,
                DEVICE_ID,
                &SessionCredential {
                    access_token: format!("at-{system_id}"),
                    refresh_token: format!("rt-{system_id}"),
                    key_id: format!("key-{system_id}"),
                    credential_id: format!("cred-{system_id}"),
                },
            )
            .unwrap();
    }

    pub fn add_paired_host(&self, system_id: &str) -> String {
        let host_id = self.add_host(system_id);
        self.seed_session(system_id);
        host_id
    }

    pub fn stored_session(&self, system_id: &str) -> Option<SessionCredential> {
        self.bridge.load_session(system_id, DEVICE_ID).unwrap()
    }
}
