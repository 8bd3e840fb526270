use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::DiscoveryError;
use crate::types::{
    DEFAULT_TTL, DiscoveredHub, DiscoveryEvent, EventType, SERVICE_NAME, serial_from_fullname,
};

/// Discovers Ezlo hubs on the local network via mDNS/DNS-SD.
pub struct Client {
    hubs: Arc<RwLock<HashMap<String, DiscoveredHub>>>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    events_rx: Option<mpsc::Receiver<DiscoveryEvent>>,
    timeout: Duration,
}

impl Client {
    /// Creates a new mDNS discovery client.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            hubs: Arc::new(RwLock::new(HashMap::new())),
            events_tx: tx,
            events_rx: Some(rx),
            timeout: Duration::from_secs(DEFAULT_TTL),
        }
    }

    /// Sets the stale hub timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<DiscoveryEvent>> {
        self.events_rx.take()
    }

    /// Performs a one-time mDNS query and returns the hubs that answered
    /// within `timeout`.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredHub>, DiscoveryError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Mdns(format!("failed to create mDNS daemon: {e}")))?;

        let service_type = format!("{SERVICE_NAME}.local.");
        let receiver = daemon
            .browse(&service_type)
            .map_err(|e| DiscoveryError::Mdns(format!("failed to browse mDNS: {e}")))?;

        let mut found = Vec::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => break,
                event = receiver.recv_async() => match event {
                    Ok(event) => {
                        if let Some(hub) = self.process_event(&event) {
                            found.push(hub);
                        }
                    }
                    Err(_) => break,
                },
            }
        }

        let _ = daemon.shutdown();
        Ok(found)
    }

    /// Browses continuously until `cancel` fires.
    ///
    /// A single `ServiceDaemon` lives for the whole session; hubs not seen
    /// for the stale timeout are pruned every `prune_interval` and reported
    /// as [`EventType::Lost`].
    pub async fn start_continuous_discovery(
        &self,
        cancel: CancellationToken,
        prune_interval: Duration,
    ) -> Result<(), DiscoveryError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Mdns(format!("failed to create mDNS daemon: {e}")))?;

        let service_type = format!("{SERVICE_NAME}.local.");
        let event_rx = match daemon.browse(&service_type) {
            Ok(rx) => rx,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(DiscoveryError::Mdns(format!("failed to browse mDNS: {e}")));
            }
        };
        debug!(service = %service_type, "continuous hub discovery started");

        let mut prune_ticker = tokio::time::interval(prune_interval);
        prune_ticker.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_rx.recv_async() => match event {
                    Ok(event) => {
                        self.process_event(&event);
                    }
                    Err(e) => {
                        warn!("mDNS browse channel closed: {e}");
                        break;
                    }
                },
                _ = prune_ticker.tick() => self.prune_stale_hubs(),
            }
        }

        let _ = daemon.shutdown();
        debug!("continuous hub discovery stopped");
        Ok(())
    }

    /// Processes an mDNS service event. Returns the hub for resolved services.
    fn process_event(&self, event: &ServiceEvent) -> Option<DiscoveredHub> {
        match event {
            ServiceEvent::ServiceResolved(info) => Some(self.record_resolved(info)),
            ServiceEvent::ServiceRemoved(_, fullname) => {
                self.remove_hub(serial_from_fullname(fullname));
                None
            }
            other => {
                trace!(event = ?other, "ignoring mDNS event");
                None
            }
        }
    }

    fn record_resolved(&self, info: &ServiceInfo) -> DiscoveredHub {
        let serial = info
            .get_properties()
            .iter()
            .find(|p| p.key() == "serial")
            .map(|p| p.val_str().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| serial_from_fullname(info.get_fullname()).to_string());

        let now = Instant::now();
        let hub = DiscoveredHub {
            serial: serial.clone(),
            host: info.get_hostname().to_string(),
            port: info.get_port(),
            ips: usable_ips(info.get_addresses().iter().copied()),
            discovered_at: Some(now),
            last_seen: Some(now),
        };

        let mut hubs = self.hubs.write().unwrap_or_else(PoisonError::into_inner);
        let event_type = if let Some(existing) = hubs.get_mut(&serial) {
            existing.last_seen = Some(now);
            existing.ips = hub.ips.clone();
            existing.port = hub.port;
            EventType::Updated
        } else {
            hubs.insert(serial.clone(), hub.clone());
            EventType::Discovered
        };
        drop(hubs);

        debug!(hub = %serial, ips = ?hub.ips, "hub {event_type}");
        let _ = self.events_tx.try_send(DiscoveryEvent {
            event_type,
            hub: hub.clone(),
        });
        hub
    }

    /// Removes hubs that haven't been seen recently.
    fn prune_stale_hubs(&self) {
        let mut hubs = self.hubs.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = hubs
            .iter()
            .filter(|(_, hub)| hub.is_stale(self.timeout))
            .map(|(serial, _)| serial.clone())
            .collect();

        for serial in stale {
            if let Some(hub) = hubs.remove(&serial) {
                let _ = self.events_tx.try_send(DiscoveryEvent {
                    event_type: EventType::Lost,
                    hub,
                });
            }
        }
    }

    /// Returns all currently known hubs.
    pub fn hubs(&self) -> Vec<DiscoveredHub> {
        self.hubs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Returns a specific hub by serial.
    pub fn hub(&self, serial: &str) -> Option<DiscoveredHub> {
        self.hubs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(serial)
            .cloned()
    }

    /// Removes a hub from tracking and reports it as lost.
    pub fn remove_hub(&self, serial: &str) {
        let mut hubs = self.hubs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(hub) = hubs.remove(serial) {
            drop(hubs);
            let _ = self.events_tx.try_send(DiscoveryEvent {
                event_type: EventType::Lost,
                hub,
            });
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps IPv4 addresses that are neither loopback nor link-local.
fn usable_ips(addrs: impl Iterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut ips: Vec<IpAddr> = addrs
        .filter(|ip| match ip {
            IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local(),
            IpAddr::V6(_) => false,
        })
        .collect();
    ips.sort();
    ips
}
