//! WebSocket write pump: serialises outbound frames.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Writes frames to the WebSocket until cancelled or the sink fails.
///
/// A write failure cancels `closed` so the owner learns the link is gone
/// even if the hub never closes its side.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
    closed: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = closed.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            closed.cancel();
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    debug!("write pump stopping, sending close frame");
    let _ = write.send(tungstenite::Message::Close(None)).await;
}
