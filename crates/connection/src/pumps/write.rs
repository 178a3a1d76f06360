//! Write pump: drains queued frames into the socket sink.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// Forwards queued frames to `sink` until cancelled or the queue closes,
/// then sends a close frame.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = queue.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let is_close = frame.is_close();
        trace!(bytes = frame.len(), "writing frame");
        if let Err(e) = sink.send(frame).await {
            error!("socket write error: {e}");
            return;
        }
        if is_close {
            return;
        }
    }

    let _ = sink.send(tungstenite::Message::Close(None)).await;
}
