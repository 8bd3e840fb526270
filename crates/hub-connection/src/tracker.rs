//! One-shot completion tracking for actions the hub finishes asynchronously.
//!
//! A [`Completion`] is armed before the triggering request goes out so a
//! broadcast racing the response cannot be missed. It resolves with the
//! first matching broadcast, or fails when its deadline passes. Either
//! way the backing observer is gone once `wait` returns.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ezlo_protocol::Message;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{ErrorKind, WsError};
use crate::observers::{ObserverGuard, ObserverRegistry};

pub(crate) struct Completion {
    rx: oneshot::Receiver<Message>,
    _guard: ObserverGuard,
}

impl Completion {
    /// Registers a transient observer delivering the first message that
    /// satisfies `predicate`.
    pub(crate) fn arm<P>(registry: &Arc<ObserverRegistry>, predicate: P) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let handle = registry.add(predicate, move |msg| {
            let tx = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(tx) = tx {
                let _ = tx.send(msg.clone());
            }
        });
        trace!(observers = registry.len(), "completion armed");
        Self {
            rx,
            _guard: ObserverGuard::new(registry.clone(), handle),
        }
    }

    /// Waits up to `timeout` for the completion broadcast.
    pub(crate) async fn wait(self, timeout: Duration) -> Result<Message, ErrorKind> {
        let Self { rx, _guard } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(ErrorKind::Transport(WsError::Closed)),
            Err(_) => Err(ErrorKind::Timeout(timeout)),
        }
    }
}
