//! Duplex socket transport.
//!
//! [`Connector::open`] returns immediately with a handle and an event
//! stream; the connection itself completes in the background and reports
//! through [`SocketEvent`]s, the first of which is `Open` or `Error`.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostlink_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::error::ConnectionError;

const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle and data events from one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message(String),
    Error(String),
    /// Always the last event of a socket.
    Close { code: Option<u16>, reason: String },
}

pub type SocketEvents = mpsc::Receiver<SocketEvent>;

/// Opens sockets to a relay.
pub trait Connector: Send + Sync {
    fn open(&self, url: &str) -> Result<(SocketHandle, SocketEvents), ConnectionError>;
}

/// Owning handle to one live socket. Dropping it closes the socket.
#[derive(Debug)]
pub struct SocketHandle {
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
}

impl SocketHandle {
    pub fn new(write_tx: mpsc::Sender<tungstenite::Message>, cancel: CancellationToken) -> Self {
        Self { write_tx, cancel }
    }

    /// Queues a text frame without waiting.
    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Transport("socket closed".into()));
        }
        self.write_tx
            .try_send(tungstenite::Message::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    ConnectionError::Transport("send buffer full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    ConnectionError::Transport("socket closed".into())
                }
            })
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    max_message_size: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            max_message_size: WS_MAX_MESSAGE_SIZE,
        }
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str) -> Result<(SocketHandle, SocketEvents), ConnectionError> {
        url::Url::parse(url).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;

        let (write_tx, write_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(run_socket(
            url.to_string(),
            self.max_message_size,
            write_tx.clone(),
            write_rx,
            events_tx,
            cancel.clone(),
        ));

        Ok((SocketHandle::new(write_tx, cancel), events_rx))
    }
}

/// Connects, runs the pumps until the socket ends, then reports `Close`.
async fn run_socket(
    url: String,
    max_message_size: usize,
    write_tx: mpsc::Sender<tungstenite::Message>,
    write_rx: mpsc::Receiver<tungstenite::Message>,
    events_tx: mpsc::Sender<SocketEvent>,
    cancel: CancellationToken,
) {
    use futures_util::StreamExt;

    let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(max_message_size);
    ws_config.max_frame_size = Some(max_message_size);

    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = events_tx
                .send(SocketEvent::Close { code: None, reason: "cancelled".into() })
                .await;
            return;
        }
        r = tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config), false) => r,
    };

    let ws_stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(error = %e, "socket connect failed");
            let _ = events_tx.send(SocketEvent::Error(e.to_string())).await;
            let _ = events_tx
                .send(SocketEvent::Close {
                    code: None,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };

    info!("socket open");
    let _ = events_tx.send(SocketEvent::Open).await;

    let (write, read) = ws_stream.split();
    let write_handle = tokio::spawn(crate::pumps::write::write_pump(
        write,
        write_rx,
        cancel.clone(),
    ));
    let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(
        write_tx.clone(),
        cancel.clone(),
    ));

    let (code, reason) = crate::pumps::read::read_pump(
        read,
        events_tx.clone(),
        write_tx,
        max_message_size,
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    let _ = write_handle.await;
    ping_handle.abort();

    debug!(?code, reason = %reason, "socket closed");
    let _ = events_tx.send(SocketEvent::Close { code, reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_close_fails() {
        let (tx, _rx) = mpsc::channel(4);
        let handle = SocketHandle::new(tx, CancellationToken::new());
        assert!(handle.send_text("a".into()).is_ok());
        handle.close();
        assert!(handle.is_closed());
        assert!(handle.send_text("b".into()).is_err());
    }

    #[tokio::test]
    async fn full_buffer_is_an_error() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = SocketHandle::new(tx, CancellationToken::new());
        handle.send_text("a".into()).unwrap();
        assert!(matches!(
            handle.send_text("b".into()),
            Err(ConnectionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn drop_cancels() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        drop(SocketHandle::new(tx, cancel.clone()));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(matches!(
            WsConnector::new().open("not a url"),
            Err(ConnectionError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_reports_error_then_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (_handle, mut events) = WsConnector::new()
            .open(&format!("ws://127.0.0.1:{port}/ws"))
            .unwrap();

        assert!(matches!(events.recv().await, Some(SocketEvent::Error(_))));
        assert!(matches!(
            events.recv().await,
            Some(SocketEvent::Close { code: None, .. })
        ));
    }

    #[tokio::test]
    async fn echo_roundtrip_over_real_socket() {
        use futures_util::{SinkExt, StreamExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                    break;
                }
            }
            let _ = ws.close(None).await;
        });

        let (handle, mut events) = WsConnector::new()
            .open(&format!("ws://127.0.0.1:{port}/ws"))
            .unwrap();
        assert_eq!(events.recv().await, Some(SocketEvent::Open));

        handle.send_text("hello".into()).unwrap();
        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Message("hello".into()))
        );
        loop {
            match events.recv().await {
                Some(SocketEvent::Close { .. }) => break,
                Some(SocketEvent::Error(_)) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
        server.await.unwrap();
    }
}
