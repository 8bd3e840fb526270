//! Brings up sessions for hubs found over mDNS.
//!
//! [`HubDiscovery`] browses the local segment and, for every hub whose
//! serial the credentials resolver knows, hands a connected
//! [`HubClient`] to the caller. Each serial is announced at most once per
//! discovery run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ezlo_discovery::client::Client as DiscoveryClient;
use ezlo_discovery::types::{DiscoveredHub, DiscoveryEvent, EventType};

use crate::credentials::{CredentialsError, CredentialsResolver};
use crate::hub::{HubClient, hub_url};
use crate::transport::{Connector, WsConnector};
use crate::types::SessionConfig;

/// How often hubs that stopped answering are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Receives each connected hub session.
pub type HubCallback = Arc<dyn Fn(HubClient) + Send + Sync>;

/// Running discovery. Stops on [`stop`](Self::stop), when its duration
/// elapses, or when dropped.
pub struct HubDiscovery {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HubDiscovery {
    /// Starts browsing. With `duration` set, discovery ends on its own
    /// after that long; otherwise it runs until stopped.
    pub fn start<F>(
        resolver: Arc<dyn CredentialsResolver>,
        config: SessionConfig,
        duration: Option<Duration>,
        on_hub: F,
    ) -> Self
    where
        F: Fn(HubClient) + Send + Sync + 'static,
    {
        let connector: Arc<dyn Connector> =
            Arc::new(WsConnector::new(config.accept_invalid_certs));
        let cancel = CancellationToken::new();
        let announcer =
            Announcer::new(resolver, config, connector, Arc::new(on_hub), cancel.clone());

        let mut client = DiscoveryClient::new();
        let events = client.take_events();
        let browse_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let Some(events) = events else {
                return;
            };
            let browse = {
                let cancel = browse_cancel.clone();
                tokio::spawn(async move {
                    let browsed = client
                        .start_continuous_discovery(cancel.clone(), PRUNE_INTERVAL)
                        .await;
                    if let Err(e) = browsed {
                        warn!("hub discovery failed: {e}");
                        cancel.cancel();
                    }
                })
            };
            forward_events(events, announcer, browse_cancel.clone(), duration).await;
            browse_cancel.cancel();
            let _ = browse.await;
        });

        info!(?duration, "hub discovery started");
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stops browsing and any connect still in progress. Sessions already
    /// handed out stay up.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("hub discovery stopped");
        }
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Waits until discovery has ended.
    pub async fn finished(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HubDiscovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Feeds discovery events to `announcer` until `cancel` fires, the
/// optional duration elapses or the event stream ends.
async fn forward_events(
    mut events: mpsc::Receiver<DiscoveryEvent>,
    announcer: Announcer,
    cancel: CancellationToken,
    duration: Option<Duration>,
) {
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            () = &mut deadline => {
                debug!("discovery duration elapsed");
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    announcer.handle(event);
                }
                None => break,
            },
        }
    }
    cancel.cancel();
}

/// Turns discovered hubs into connected sessions.
#[derive(Clone)]
struct Announcer {
    resolver: Arc<dyn CredentialsResolver>,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    on_hub: HubCallback,
    /// Serials announced or being brought up.
    claimed: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

impl Announcer {
    fn new(
        resolver: Arc<dyn CredentialsResolver>,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        on_hub: HubCallback,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            config,
            connector,
            on_hub,
            claimed: Arc::default(),
            cancel,
        }
    }

    /// Starts bringing up the hub of `event` unless it was claimed already.
    fn handle(&self, event: DiscoveryEvent) -> Option<JoinHandle<()>> {
        match event.event_type {
            EventType::Discovered | EventType::Updated => {}
            EventType::Lost => {
                debug!(hub = %event.hub.serial, "hub lost");
                return None;
            }
        }

        let serial = event.hub.serial.clone();
        if !self
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(serial.clone())
        {
            return None;
        }

        let this = self.clone();
        Some(tokio::spawn(async move {
            let announced = tokio::select! {
                _ = this.cancel.cancelled() => false,
                announced = this.announce(event.hub) => announced,
            };
            if !announced {
                // Let a later sighting retry.
                this.claimed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&serial);
            }
        }))
    }

    /// Resolves credentials, connects and hands the session over.
    async fn announce(&self, hub: DiscoveredHub) -> bool {
        let credentials = match self.resolver.credentials(&hub.serial).await {
            Ok(credentials) => credentials,
            Err(CredentialsError::UnknownHub(serial)) => {
                debug!(hub = %serial, "no credentials, ignoring hub");
                return false;
            }
            Err(e) => {
                warn!(hub = %hub.serial, "credentials lookup failed: {e}");
                return false;
            }
        };

        let client = HubClient::with_connector(
            hub_url(&hub.address()),
            credentials,
            self.config.clone(),
            self.connector.clone(),
        );
        if let Err(e) = client.connect().await {
            warn!("discovered hub unreachable: {e}");
            return false;
        }

        info!(hub = %hub.serial, url = %client.url(), "hub discovered and connected");
        (self.on_hub)(client);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialsResolver;
    use crate::testing::MockHub;
    use crate::types::HubCredentials;
    use ezlo_protocol::method;

    fn found(serial: &str, event_type: EventType) -> DiscoveryEvent {
        DiscoveryEvent {
            event_type,
            hub: DiscoveredHub {
                serial: serial.into(),
                host: format!("HUB{serial}.local."),
                port: 17000,
                ips: vec!["192.168.1.40".parse().unwrap()],
                discovered_at: None,
                last_seen: None,
            },
        }
    }

    fn announcer(hub: &MockHub) -> (Announcer, mpsc::UnboundedReceiver<HubClient>) {
        let resolver = StaticCredentialsResolver::new([HubCredentials {
            hub_identity: "90000330".into(),
            user: "installer".into(),
            token: "tok".into(),
        }]);
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            heartbeat_timeout: Duration::from_secs(24 * 3600),
            ..SessionConfig::default()
        };
        let announcer = Announcer::new(
            Arc::new(resolver),
            config,
            Arc::new(hub.clone()),
            Arc::new(move |client| {
                let _ = tx.send(client);
            }),
            CancellationToken::new(),
        );
        (announcer, rx)
    }

    #[tokio::test]
    async fn known_hub_is_connected_and_announced() {
        let hub = MockHub::new();
        let (announcer, mut rx) = announcer(&hub);

        announcer
            .handle(found("90000330", EventType::Discovered))
            .unwrap()
            .await
            .unwrap();

        let client = rx.recv().await.unwrap();
        assert_eq!(client.identity(), "90000330");
        assert_eq!(client.url(), "wss://192.168.1.40:17000");
        assert!(client.is_connected());
        let login = hub.requests(method::LOGIN);
        assert_eq!(login.len(), 1);
        assert_eq!(login[0].params().unwrap()["user"], "installer");
    }

    #[tokio::test]
    async fn each_serial_is_announced_once() {
        let hub = MockHub::new();
        let (announcer, mut rx) = announcer(&hub);

        announcer
            .handle(found("90000330", EventType::Discovered))
            .unwrap()
            .await
            .unwrap();
        assert!(announcer.handle(found("90000330", EventType::Updated)).is_none());

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.connect_count(), 1);
    }

    #[tokio::test]
    async fn unknown_and_lost_hubs_are_ignored() {
        let hub = MockHub::new();
        let (announcer, mut rx) = announcer(&hub);

        announcer
            .handle(found("12345678", EventType::Discovered))
            .unwrap()
            .await
            .unwrap();
        assert!(announcer.handle(found("90000330", EventType::Lost)).is_none());

        assert!(rx.try_recv().is_err());
        assert_eq!(hub.connect_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_hub_is_retried_on_next_sighting() {
        let hub = MockHub::new();
        hub.set_refuse(true);
        let (announcer, mut rx) = announcer(&hub);

        announcer
            .handle(found("90000330", EventType::Discovered))
            .unwrap()
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        hub.set_refuse(false);
        announcer
            .handle(found("90000330", EventType::Updated))
            .unwrap()
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_connected());
        assert_eq!(hub.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forwarding_ends_after_duration() {
        let hub = MockHub::new();
        let (announcer, mut rx) = announcer(&hub);
        let (events_tx, events) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();

        let forward = tokio::spawn(forward_events(
            events,
            announcer,
            cancel.clone(),
            Some(Duration::from_secs(10)),
        ));
        events_tx
            .send(found("90000330", EventType::Discovered))
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());

        forward.await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn forwarding_stops_on_cancel() {
        let hub = MockHub::new();
        let (announcer, _rx) = announcer(&hub);
        let (_events_tx, events) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let forward = tokio::spawn(forward_events(events, announcer, cancel.clone(), None));
        cancel.cancel();
        forward.await.unwrap();
    }
}
