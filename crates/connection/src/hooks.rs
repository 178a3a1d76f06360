//! Callbacks into the presentation layer.

use tokio::sync::mpsc;
use tracing::warn;

use hostlink_settings::LogEntry;

use crate::types::{ConnectionEvent, HostStatus, Notice, PairingFailure};

/// Presentation callbacks. Every method defaults to a no-op.
///
/// Hooks are invoked without any internal lock held, so implementations may
/// call back into the manager.
pub trait HostHooks: Send + Sync {
    fn log(&self, _entry: &LogEntry) {}
    fn notice(&self, _host_id: &str, _notice: &Notice) {}
    fn state_changed(&self, _host_id: &str, _status: HostStatus) {}
    fn tools_changed(&self, _host_id: &str) {}
    fn candidate_tools_changed(&self, _host_id: &str) {}
    fn pairing_failed(&self, _failure: &PairingFailure) {}
}

/// Hooks that ignore everything.
pub struct NoopHooks;

impl HostHooks for NoopHooks {}

/// Forwards every hook call into an event channel.
pub struct ChannelHooks {
    tx: mpsc::Sender<ConnectionEvent>,
}

impl ChannelHooks {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn forward(&self, event: ConnectionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("failed to forward connection event: {e}");
        }
    }
}

impl HostHooks for ChannelHooks {
    fn log(&self, entry: &LogEntry) {
        self.forward(ConnectionEvent::Log(entry.clone()));
    }

    fn notice(&self, host_id: &str, notice: &Notice) {
        self.forward(ConnectionEvent::Notice {
            host_id: host_id.to_string(),
            notice: notice.clone(),
        });
    }

    fn state_changed(&self, host_id: &str, status: HostStatus) {
        self.forward(ConnectionEvent::StateChanged {
            host_id: host_id.to_string(),
            status,
        });
    }

    fn tools_changed(&self, host_id: &str) {
        self.forward(ConnectionEvent::ToolsChanged {
            host_id: host_id.to_string(),
        });
    }

    fn candidate_tools_changed(&self, host_id: &str) {
        self.forward(ConnectionEvent::CandidatesChanged {
            host_id: host_id.to_string(),
        });
    }

    fn pairing_failed(&self, failure: &PairingFailure) {
        self.forward(ConnectionEvent::PairingFailed(failure.clone()));
    }
}
