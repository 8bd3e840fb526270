//! WebSocket client for one hub link.
//!
//! Implements the request/response pattern with UUID correlation on top
//! of a read pump and a write pump. Anything inbound that is not a
//! response goes to the session's observer registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use ezlo_protocol::Message;

use crate::correlator::Correlator;
use crate::error::{ErrorKind, WsError};
use crate::observers::ObserverRegistry;
use crate::pumps::read::{ReadContext, read_pump};
use crate::pumps::write::write_pump;
use crate::transport::{Connector, WsSink, WsStream};

/// Outbound frames buffered ahead of the write pump.
const WRITE_QUEUE: usize = 256;

/// WebSocket client connected to a single hub.
///
/// Closing the client (explicitly or by dropping it) fails every request
/// still waiting for a response.
pub struct WsClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    correlator: Arc<Correlator>,
    heartbeat: watch::Receiver<Instant>,
    closed: CancellationToken,
    cancel: CancellationToken,
    request_timeout: Option<Duration>,
    _read_handle: JoinHandle<()>,
    _write_handle: JoinHandle<()>,
}

impl WsClient {
    /// Opens a link to `url` through `connector`.
    pub async fn open(
        connector: &dyn Connector,
        url: &str,
        observers: Arc<ObserverRegistry>,
        request_timeout: Option<Duration>,
    ) -> Result<Self, WsError> {
        let (write, read) = connector.connect(url).await?;
        Ok(Self::from_link(write, read, observers, request_timeout))
    }

    /// Starts the pumps over an already established link.
    pub fn from_link(
        write: WsSink,
        read: WsStream,
        observers: Arc<ObserverRegistry>,
        request_timeout: Option<Duration>,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(WRITE_QUEUE);
        let (heartbeat_tx, heartbeat) = watch::channel(Instant::now());
        let correlator = Arc::new(Correlator::default());
        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();

        let write_handle = tokio::spawn(write_pump(
            write,
            write_rx,
            cancel.clone(),
            closed.clone(),
        ));

        let read_handle = tokio::spawn(read_pump(
            read,
            ReadContext {
                correlator: correlator.clone(),
                observers,
                heartbeat: heartbeat_tx,
                write_tx: write_tx.clone(),
                cancel: cancel.clone(),
                closed: closed.clone(),
            },
        ));

        Self {
            write_tx,
            correlator,
            heartbeat,
            closed,
            cancel,
            request_timeout,
            _read_handle: read_handle,
            _write_handle: write_handle,
        }
    }

    /// Sends a request and waits for the response carrying its id.
    ///
    /// Any id already present on `request` is replaced. A response with a
    /// non-null `error` fails with [`ErrorKind::Request`], which carries
    /// both the error payload and the request as sent.
    pub async fn send_request(&self, mut request: Message) -> Result<Message, ErrorKind> {
        let (id, rx) = self.correlator.register()?;
        let _pending = PendingGuard {
            correlator: &self.correlator,
            id: &id,
        };
        request.set_id(id.as_str());
        let text = request.to_text().map_err(WsError::from)?;
        trace!(id = %id, method = ?request.method(), "sending request");

        self.write_tx
            .send(tungstenite::Message::Text(text.into()))
            .await
            .map_err(|_| WsError::Closed)?;

        let outcome = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| ErrorKind::Timeout(limit))?,
            None => rx.await,
        };

        let response = match outcome {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(WsError::Closed.into()),
        };

        if let Some(error) = response.error() {
            debug!(id = %id, error = %error, "hub rejected request");
            return Err(ErrorKind::Request {
                error: error.clone(),
                request: request.into_value(),
            });
        }
        Ok(response)
    }

    /// Receiver updated with the arrival time of every hub heartbeat.
    pub fn heartbeats(&self) -> watch::Receiver<Instant> {
        self.heartbeat.clone()
    }

    /// Token cancelled once the link is gone.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.cancel.is_cancelled()
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Closes the link. Pending requests fail with
    /// [`WsError::Closed`]. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        // Let the read pump fail pending requests on its way out.
        self.cancel.cancel();
    }
}

/// Removes a pending entry on every exit path of `send_request`.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}
