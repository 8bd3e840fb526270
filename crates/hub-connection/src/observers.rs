//! Observer registry and broadcast dispatch.
//!
//! Observers are `(predicate, handler)` pairs. Every inbound message not
//! claimed by a pending request is offered to each observer in
//! registration order. Dispatch iterates over a snapshot taken when the
//! pass starts, so handlers may add or remove observers (themselves
//! included) without affecting the pass in progress.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ezlo_protocol::Message;
use tokio::sync::mpsc;
use tracing::warn;

/// Decides whether an observer wants a message.
pub type Predicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Receives messages whose predicate matched. Runs on the dispatch path,
/// so it must not block.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Opaque registration handle returned by [`ObserverRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

struct Observer {
    handle: ObserverHandle,
    predicate: Predicate,
    handler: Handler,
}

/// Set of registered observers of one session.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<Vec<Arc<Observer>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Observer>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an observer and returns its handle.
    pub fn add<P, H>(&self, predicate: P, handler: H) -> ObserverHandle
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
        H: Fn(&Message) + Send + Sync + 'static,
    {
        let handle = ObserverHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Arc::new(Observer {
            handle,
            predicate: Arc::new(predicate),
            handler: Arc::new(handler),
        }));
        handle
    }

    /// Deregisters an observer. Returns `false` if it was already gone.
    pub fn remove(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|o| o.handle != handle);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Offers `msg` to every observer registered when the pass starts.
    ///
    /// A panicking predicate or handler is logged and skipped; the
    /// remaining observers still see the message. Returns the number of
    /// handlers invoked.
    pub fn dispatch(&self, msg: &Message) -> usize {
        let snapshot: Vec<Arc<Observer>> = self.lock().clone();
        let mut invoked = 0;

        for observer in snapshot {
            let matched = match catch_unwind(AssertUnwindSafe(|| (observer.predicate)(msg))) {
                Ok(matched) => matched,
                Err(_) => {
                    warn!(observer = observer.handle.0, "observer predicate panicked");
                    continue;
                }
            };
            if !matched {
                continue;
            }
            invoked += 1;
            if catch_unwind(AssertUnwindSafe(|| (observer.handler)(msg))).is_err() {
                warn!(observer = observer.handle.0, "observer handler panicked");
            }
        }
        invoked
    }
}

/// Removes an observer from its registry when dropped.
pub(crate) struct ObserverGuard {
    registry: Arc<ObserverRegistry>,
    handle: ObserverHandle,
}

impl ObserverGuard {
    pub(crate) fn new(registry: Arc<ObserverRegistry>, handle: ObserverHandle) -> Self {
        Self { registry, handle }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.registry.remove(self.handle);
    }
}

/// Stream of broadcasts matching a predicate.
///
/// The backing observer is removed when the subscription is dropped.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
    _guard: ObserverGuard,
}

impl Subscription {
    pub(crate) fn new<P>(registry: Arc<ObserverRegistry>, predicate: P) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = registry.add(predicate, move |msg| {
            let _ = tx.send(msg.clone());
        });
        Self {
            rx,
            _guard: ObserverGuard::new(registry, handle),
        }
    }

    /// Waits for the next matching message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn msg(subclass: &str) -> Message {
        Message::from_text(&format!(
            r#"{{"id":"ui_broadcast","msg_subclass":"{subclass}","result":{{}}}}"#
        ))
        .unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &str| -> Handler {
                let log = log.clone();
                let name = name.to_string();
                Arc::new(move |_: &Message| log.lock().unwrap().push(name.clone()))
            }
        };
        (log, make)
    }

    #[test]
    fn dispatch_runs_matching_handlers_in_registration_order() {
        let registry = ObserverRegistry::new();
        let (log, make) = recorder();

        for name in ["a", "b", "c"] {
            let h = make(name);
            registry.add(|_| true, move |m| h(m));
        }
        let skip = make("never");
        registry.add(|m| m.msg_subclass() == Some("other"), move |m| skip(m));

        assert_eq!(registry.dispatch(&msg("hub.item.updated")), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ObserverRegistry::new();
        let handle = registry.add(|_| true, |_| {});
        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));
        assert!(registry.is_empty());
    }

    #[test]
    fn self_removal_during_dispatch_keeps_current_pass() {
        let registry = Arc::new(ObserverRegistry::new());
        let (log, make) = recorder();

        let own_handle: Arc<OnceLock<ObserverHandle>> = Arc::new(OnceLock::new());
        let first = make("first");
        let handle = {
            let registry = registry.clone();
            let own_handle = own_handle.clone();
            registry.clone().add(
                |_| true,
                move |m| {
                    first(m);
                    if let Some(h) = own_handle.get() {
                        registry.remove(*h);
                    }
                },
            )
        };
        own_handle.set(handle).unwrap();

        let second = make("second");
        registry.add(|_| true, move |m| second(m));

        registry.dispatch(&msg("x"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);

        registry.dispatch(&msg("x"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "second"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removing_a_later_observer_mid_pass_still_delivers_this_pass() {
        let registry = Arc::new(ObserverRegistry::new());
        let (log, make) = recorder();

        let victim: Arc<OnceLock<ObserverHandle>> = Arc::new(OnceLock::new());
        {
            let registry2 = registry.clone();
            let victim = victim.clone();
            let remover = make("remover");
            registry.add(
                |_| true,
                move |m| {
                    remover(m);
                    if let Some(h) = victim.get() {
                        registry2.remove(*h);
                    }
                },
            );
        }
        let v = make("victim");
        victim.set(registry.add(|_| true, move |m| v(m))).unwrap();

        registry.dispatch(&msg("x"));
        registry.dispatch(&msg("x"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["remover", "victim", "remover"]
        );
    }

    #[test]
    fn observer_added_during_dispatch_waits_for_next_pass() {
        let registry = Arc::new(ObserverRegistry::new());
        let (log, make) = recorder();
        let added = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let registry2 = registry.clone();
            let make_late = make("late");
            registry.add(
                |_| true,
                move |_| {
                    if !added.swap(true, Ordering::SeqCst) {
                        let late = make_late.clone();
                        registry2.add(|_| true, move |m| late(m));
                    }
                },
            );
        }

        registry.dispatch(&msg("x"));
        assert!(log.lock().unwrap().is_empty());
        registry.dispatch(&msg("x"));
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_dispatch() {
        let registry = ObserverRegistry::new();
        let (log, make) = recorder();

        registry.add(|_| true, |_| panic!("handler failure"));
        registry.add(|_| panic!("predicate failure"), |_| {});
        let after = make("after");
        registry.add(|_| true, move |m| after(m));

        assert_eq!(registry.dispatch(&msg("x")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn subscription_receives_and_unregisters_on_drop() {
        let registry = Arc::new(ObserverRegistry::new());
        let mut sub = Subscription::new(registry.clone(), |m| m.is_broadcast());
        assert_eq!(registry.len(), 1);

        registry.dispatch(&msg("hub.item.updated"));
        let got = sub.recv().await.unwrap();
        assert_eq!(got.msg_subclass(), Some("hub.item.updated"));

        drop(sub);
        assert!(registry.is_empty());
    }

    #[test]
    fn guard_removes_on_drop() {
        let registry = Arc::new(ObserverRegistry::new());
        let handle = registry.add(|_| true, |_| {});
        let guard = ObserverGuard::new(registry.clone(), handle);
        assert_eq!(registry.len(), 1);
        drop(guard);
        assert!(registry.is_empty());
    }
}
