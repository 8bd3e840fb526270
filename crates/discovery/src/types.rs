use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use ezlo_protocol::constants::HUB_PORT;
use serde::{Deserialize, Serialize};

/// mDNS service type advertised by Ezlo hubs.
pub const SERVICE_NAME: &str = "_ezlo._tcp";

/// Time after which a hub that stopped answering is pruned (seconds).
pub const DEFAULT_TTL: u64 = 120;

/// A hub discovered via mDNS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredHub {
    /// Hub serial number, the hub's identity.
    pub serial: String,
    pub host: String,
    /// Port the hub advertises. The WebSocket API always lives on
    /// [`HUB_PORT`], so this is informational.
    pub port: u16,
    #[serde(skip)]
    pub ips: Vec<IpAddr>,
    #[serde(skip)]
    pub discovered_at: Option<Instant>,
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl DiscoveredHub {
    /// Returns the host part to connect to: first usable IP, else hostname.
    pub fn address(&self) -> String {
        match self.ips.first() {
            Some(ip) => ip.to_string(),
            None => self.host.trim_end_matches('.').to_string(),
        }
    }

    /// Returns the secure WebSocket URL of the hub's local API.
    pub fn websocket_address(&self) -> String {
        format!("wss://{}:{HUB_PORT}", self.address())
    }

    /// Returns true if the hub hasn't been seen recently.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        match self.last_seen {
            Some(last) => last.elapsed() > timeout,
            None => true,
        }
    }
}

/// A discovery or loss event.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub event_type: EventType,
    pub hub: DiscoveredHub,
}

/// Type of discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Discovered,
    Updated,
    Lost,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Discovered => write!(f, "discovered"),
            EventType::Updated => write!(f, "updated"),
            EventType::Lost => write!(f, "lost"),
        }
    }
}

/// Derives the hub serial from an mDNS instance fullname such as
/// `90000330._ezlo._tcp.local.`.
pub fn serial_from_fullname(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}
