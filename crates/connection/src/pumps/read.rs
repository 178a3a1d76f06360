//! Read pump: turns socket frames into [`SocketEvent`]s.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use hostlink_protocol::constants::WS_PONG_WAIT;

use crate::socket::SocketEvent;

/// Reads until the socket ends. Returns the close code and reason.
///
/// Any incoming frame pushes the read deadline out by [`WS_PONG_WAIT`];
/// silence past the deadline ends the socket.
pub(crate) async fn read_pump<S>(
    mut read: S,
    events_tx: mpsc::Sender<SocketEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    max_message_size: usize,
    cancel: CancellationToken,
) -> (Option<u16>, String)
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return (None, "closed locally".into()),

            () = &mut deadline => {
                warn!("read deadline passed, closing socket");
                return (None, "read timeout".into());
            }

            frame = read.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!("socket read error: {e}");
                        let _ = events_tx.send(SocketEvent::Error(e.to_string())).await;
                        return (None, e.to_string());
                    }
                    None => {
                        debug!("socket stream ended");
                        return (None, "stream ended".into());
                    }
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match frame {
                    tungstenite::Message::Text(text) => {
                        if text.len() > max_message_size {
                            warn!("message too large ({} bytes), dropping", text.len());
                            continue;
                        }
                        if events_tx.send(SocketEvent::Message(text.as_str().to_owned())).await.is_err() {
                            return (None, "event receiver gone".into());
                        }
                    }
                    tungstenite::Message::Ping(data) => {
                        trace!("received ping");
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    tungstenite::Message::Pong(_) => trace!("received pong"),
                    tungstenite::Message::Close(frame) => {
                        debug!(?frame, "received close frame");
                        return match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                    }
                    _ => {} // binary frames are not part of the protocol
                }
            }
        }
    }
}
