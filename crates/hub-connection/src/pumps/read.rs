//! WebSocket read pump: routes inbound frames.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use ezlo_protocol::Message;

use crate::correlator::Correlator;
use crate::error::WsError;
use crate::observers::ObserverRegistry;

/// Shared state the read pump feeds.
pub(crate) struct ReadContext {
    pub correlator: Arc<Correlator>,
    pub observers: Arc<ObserverRegistry>,
    /// Updated with the arrival time of every hub ping.
    pub heartbeat: watch::Sender<Instant>,
    pub write_tx: mpsc::Sender<tungstenite::Message>,
    /// Cancelled by the owner to stop the pump.
    pub cancel: CancellationToken,
    /// Cancelled by the pump once the link is gone, for whatever reason.
    pub closed: CancellationToken,
}

/// Reads frames until the link ends, then fails every pending request.
///
/// Messages are handled one at a time in arrival order: responses go to
/// their waiting request, everything else is dispatched to observers
/// before the next frame is read.
pub(crate) async fn read_pump<S>(mut read: S, ctx: ReadContext)
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break WsError::Closed,
            _ = ctx.closed.cancelled() => break WsError::Closed,

            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if let Err(e) = handle_text_message(&text, &ctx) {
                            warn!("dropping link after malformed frame: {e}");
                            break e;
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        trace!("received heartbeat ping");
                        ctx.heartbeat.send_replace(Instant::now());
                        let _ = ctx.write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    Some(Ok(tungstenite::Message::Pong(_))) => {
                        trace!("received pong");
                    }
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        warn!(len = data.len(), "unexpected binary frame");
                        break WsError::Malformed(format!("binary frame of {} bytes", data.len()));
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        debug!(?frame, "received close frame");
                        break WsError::Closed;
                    }
                    Some(Ok(tungstenite::Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break WsError::from(e);
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break WsError::Closed;
                    }
                }
            }
        }
    };

    ctx.correlator.fail_all(reason);
    ctx.closed.cancel();
}

fn handle_text_message(text: &str, ctx: &ReadContext) -> Result<(), WsError> {
    let msg = Message::from_text(text).map_err(|e| WsError::Malformed(e.to_string()))?;
    trace!(id = ?msg.id(), subclass = ?msg.msg_subclass(), "received message");

    if let Some(unclaimed) = ctx.correlator.resolve(msg) {
        let invoked = ctx.observers.dispatch(&unclaimed);
        trace!(invoked, "dispatched broadcast");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::Mutex;

    struct Harness {
        correlator: Arc<Correlator>,
        observers: Arc<ObserverRegistry>,
        heartbeat: watch::Receiver<Instant>,
        write_rx: mpsc::Receiver<tungstenite::Message>,
        closed: CancellationToken,
        cancel: CancellationToken,
    }

    fn context() -> (ReadContext, Harness) {
        let correlator = Arc::new(Correlator::default());
        let observers = Arc::new(ObserverRegistry::new());
        let (heartbeat_tx, heartbeat_rx) = watch::channel(Instant::now());
        let (write_tx, write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();
        let ctx = ReadContext {
            correlator: correlator.clone(),
            observers: observers.clone(),
            heartbeat: heartbeat_tx,
            write_tx,
            cancel: cancel.clone(),
            closed: closed.clone(),
        };
        (
            ctx,
            Harness {
                correlator,
                observers,
                heartbeat: heartbeat_rx,
                write_rx,
                closed,
                cancel,
            },
        )
    }

    fn text(s: &str) -> Result<tungstenite::Message, tungstenite::Error> {
        Ok(tungstenite::Message::Text(s.into()))
    }

    #[tokio::test]
    async fn read_pump_exits_on_stream_end() {
        let (ctx, h) = context();
        let (_id, rx) = h.correlator.register().unwrap();

        read_pump(stream::empty(), ctx).await;

        assert!(h.closed.is_cancelled());
        assert!(matches!(rx.await.unwrap(), Err(WsError::Closed)));
    }

    #[tokio::test]
    async fn read_pump_stops_on_cancel() {
        let (ctx, h) = context();
        h.cancel.cancel();
        read_pump(stream::pending(), ctx).await;
        assert!(h.closed.is_cancelled());
    }

    #[tokio::test]
    async fn responses_and_broadcasts_are_routed_in_order() {
        let (ctx, h) = context();
        let (id, rx) = h.correlator.register().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            h.observers.add(
                |m| m.is_broadcast(),
                move |m| {
                    seen.lock()
                        .unwrap()
                        .push(m.msg_subclass().unwrap_or_default().to_string())
                },
            );
        }

        let frames = vec![
            text(r#"{"id":"ui_broadcast","msg_subclass":"first","result":{}}"#),
            text(&format!(r#"{{"id":"{id}","error":null,"result":{{"ok":true}}}}"#)),
            text(r#"{"id":"ui_broadcast","msg_subclass":"second","result":{}}"#),
        ];
        read_pump(stream::iter(frames), ctx).await;

        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.pointer("/result/ok"), Some(&serde_json::json!(true)));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn malformed_frame_fails_pending_requests() {
        let (ctx, h) = context();
        let (_id, rx) = h.correlator.register().unwrap();

        let frames = vec![text("not json"), text(r#"{"id":"late"}"#)];
        read_pump(stream::iter(frames).chain(stream::pending()), ctx).await;

        assert!(matches!(rx.await.unwrap(), Err(WsError::Malformed(_))));
        assert!(h.closed.is_cancelled());
    }

    #[tokio::test]
    async fn non_object_json_is_malformed() {
        let (ctx, h) = context();
        let (_id, rx) = h.correlator.register().unwrap();

        read_pump(stream::iter(vec![text("[1,2,3]")]), ctx).await;
        assert!(matches!(rx.await.unwrap(), Err(WsError::Malformed(_))));
    }

    #[tokio::test]
    async fn ping_refreshes_heartbeat_and_answers_pong() {
        tokio::time::pause();
        let (ctx, mut h) = context();
        let start = *h.heartbeat.borrow_and_update();

        tokio::time::advance(std::time::Duration::from_secs(30)).await;
        let frames = vec![Ok(tungstenite::Message::Ping(vec![7u8].into()))];
        read_pump(stream::iter(frames), ctx).await;

        assert!(*h.heartbeat.borrow() >= start + std::time::Duration::from_secs(30));
        let pong = h.write_rx.recv().await.unwrap();
        assert!(matches!(pong, tungstenite::Message::Pong(_)));
    }

    #[tokio::test]
    async fn close_frame_ends_pump() {
        let (ctx, h) = context();
        let frames = vec![
            Ok(tungstenite::Message::Close(None)),
            text(r#"{"id":"ui_broadcast","msg_subclass":"after","result":{}}"#),
        ];
        let hits = Arc::new(Mutex::new(0));
        {
            let hits = hits.clone();
            h.observers.add(|_| true, move |_| *hits.lock().unwrap() += 1);
        }
        read_pump(stream::iter(frames), ctx).await;
        assert_eq!(*hits.lock().unwrap(), 0);
        assert!(matches!(h.correlator.close_reason(), Some(WsError::Closed)));
    }
}
