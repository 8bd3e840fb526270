//! Public types for the hub session engine.

use std::time::Duration;

use ezlo_protocol::constants::{
    HEARTBEAT_TIMEOUT, MODE_SWITCH_GRACE, RECONNECT_INTERVAL, SCENE_RUN_TIMEOUT,
};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a hub session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport open.
    Disconnected,
    /// Transport opening or login in progress.
    Connecting,
    /// Transport open and logged in.
    Connected,
}

/// Credentials for one hub, as handed out by a credentials resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubCredentials {
    /// Hub serial number.
    pub hub_identity: String,
    pub user: String,
    pub token: String,
}

/// Tunables of a hub session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Silence after which the connection is declared dead.
    pub heartbeat_timeout: Duration,
    /// Poll period of the reconnect loop.
    pub reconnect_interval: Duration,
    /// How long `run_scene` waits for the scene-finished broadcast.
    pub scene_timeout: Duration,
    /// Added to the hub-announced delay when waiting for a mode switch.
    pub mode_switch_grace: Duration,
    /// Optional per-request deadline. `None` waits until the response
    /// arrives or the connection closes.
    pub request_timeout: Option<Duration>,
    /// Skip certificate verification. Hubs serve self-signed certificates.
    pub accept_invalid_certs: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            reconnect_interval: RECONNECT_INTERVAL,
            scene_timeout: SCENE_RUN_TIMEOUT,
            mode_switch_grace: MODE_SWITCH_GRACE,
            request_timeout: None,
            accept_invalid_certs: true,
        }
    }
}

/// Target of [`HubClient::set_item_value`](crate::HubClient::set_item_value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemTarget {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for ItemTarget {
    fn from(id: &str) -> Self {
        Self::One(id.to_string())
    }
}

impl From<String> for ItemTarget {
    fn from(id: String) -> Self {
        Self::One(id)
    }
}

impl From<Vec<String>> for ItemTarget {
    fn from(ids: Vec<String>) -> Self {
        Self::Many(ids)
    }
}

impl From<&[&str]> for ItemTarget {
    fn from(ids: &[&str]) -> Self {
        Self::Many(ids.iter().map(|s| s.to_string()).collect())
    }
}
