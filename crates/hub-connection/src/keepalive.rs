//! Heartbeat watchdog and reconnect loop.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Why the watchdog gave up on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LossReason {
    /// No heartbeat within the deadline.
    HeartbeatExpired,
    /// The link ended on its own.
    Closed,
}

/// Watches one link's heartbeat until it lapses or the link closes.
///
/// The deadline starts when the watchdog starts and is pushed out to
/// `last heartbeat + timeout` on every heartbeat. Returns `None` when
/// `cancel` fires first.
pub(crate) async fn heartbeat_watchdog(
    mut heartbeats: watch::Receiver<Instant>,
    closed: CancellationToken,
    cancel: CancellationToken,
    timeout: Duration,
) -> Option<LossReason> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return None,
            _ = closed.cancelled() => return Some(LossReason::Closed),

            () = &mut deadline => return Some(LossReason::HeartbeatExpired),

            changed = heartbeats.changed() => {
                if changed.is_err() {
                    return Some(LossReason::Closed);
                }
                let last = *heartbeats.borrow_and_update();
                trace!("heartbeat, deadline reset");
                deadline.as_mut().reset(last + timeout);
            }
        }
    }
}

/// Polls every `interval` until the session is connected again.
///
/// On each tick: stop if `is_connected()`; otherwise start `attempt()`
/// unless the previous attempt is still running. A successful attempt
/// ends the loop. Failed attempts are retried on later ticks without
/// limit; the loop also ends when `cancel` fires.
pub(crate) async fn reconnect_loop<C, A, F>(
    interval: Duration,
    cancel: CancellationToken,
    is_connected: C,
    attempt: A,
) where
    C: Fn() -> bool,
    A: Fn() -> F,
    F: Future<Output = bool> + Send + 'static,
{
    let in_flight = Arc::new(AtomicBool::new(false));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if is_connected() {
            debug!("session connected, reconnect loop done");
            break;
        }
        if in_flight.swap(true, Ordering::SeqCst) {
            debug!("previous reconnect attempt still running, skipping tick");
            continue;
        }

        trace!("starting reconnect attempt");
        let attempt = attempt();
        let in_flight = in_flight.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ok = attempt.await;
            in_flight.store(false, Ordering::SeqCst);
            if ok {
                cancel.cancel();
            }
        });
    }
}
