//! Request/response correlation over a shared transport.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ezlo_protocol::Message;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::WsError;

pub(crate) type ResponseSender = oneshot::Sender<Result<Message, WsError>>;
pub(crate) type ResponseReceiver = oneshot::Receiver<Result<Message, WsError>>;

#[derive(Default)]
struct PendingTable {
    pending: HashMap<String, ResponseSender>,
    /// Set once the transport is gone; no new requests are accepted.
    closed: Option<WsError>,
}

/// Pending-request table of one transport instance.
///
/// Every registered id is removed exactly once: by its response, by
/// [`Correlator::forget`], or by [`Correlator::fail_all`].
#[derive(Default)]
pub(crate) struct Correlator {
    table: Mutex<PendingTable>,
}

impl Correlator {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates an id not currently pending and registers a waiter for it.
    pub(crate) fn register(&self) -> Result<(String, ResponseReceiver), WsError> {
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(reason.clone());
        }
        let id = loop {
            let id = uuid::Uuid::new_v4().to_string();
            if !table.pending.contains_key(&id) {
                break id;
            }
        };
        let (tx, rx) = oneshot::channel();
        table.pending.insert(id.clone(), tx);
        Ok((id, rx))
    }

    /// Routes an inbound message to the request waiting for its id.
    ///
    /// Returns the message back when no request claims it, meaning it is
    /// a broadcast candidate.
    pub(crate) fn resolve(&self, msg: Message) -> Option<Message> {
        let Some(id) = msg.id().map(str::to_owned) else {
            return Some(msg);
        };
        let waiter = self.lock().pending.remove(&id);
        match waiter {
            Some(tx) => {
                trace!(id = %id, "response matched pending request");
                let _ = tx.send(Ok(msg));
                None
            }
            None => Some(msg),
        }
    }

    /// Drops the waiter for `id`, if still pending.
    pub(crate) fn forget(&self, id: &str) {
        self.lock().pending.remove(id);
    }

    /// Fails every pending request with `reason` and refuses new ones.
    pub(crate) fn fail_all(&self, reason: WsError) -> usize {
        let drained: Vec<ResponseSender> = {
            let mut table = self.lock();
            table.closed.get_or_insert_with(|| reason.clone());
            table.pending.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(reason.clone()));
        }
        if count > 0 {
            debug!(count, reason = %reason, "failed pending requests");
        }
        count
    }

    /// The reason the transport closed, if it has.
    pub(crate) fn close_reason(&self) -> Option<WsError> {
        self.lock().closed.clone()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}
