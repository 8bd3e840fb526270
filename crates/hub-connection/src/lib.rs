//! Client-side session engine for the Ezlo hub local API.
//!
//! Provides the secure WebSocket transport, request/response correlation,
//! broadcast observers, completion tracking for scenes and house modes,
//! keep-alive with automatic reconnect, credentials resolvers and mDNS
//! discovery glue.

mod correlator;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod hub;
mod keepalive;
pub mod observers;
pub mod predicates;
mod pumps;
#[cfg(test)]
mod testing;
mod tracker;
pub mod transport;
pub mod types;
pub mod ws_client;

pub use credentials::{
    CredentialsError, CredentialsResolver, FileCredentialsResolver, StaticCredentialsResolver,
    default_credentials_path,
};
pub use discovery::{HubCallback, HubDiscovery};
pub use error::{ErrorKind, HubError, WsError};
pub use hub::{HubClient, hub_url};
pub use observers::{ObserverHandle, ObserverRegistry, Subscription};
pub use transport::{Connector, WsConnector};
pub use types::{ConnectionState, HubCredentials, ItemTarget, SessionConfig};
pub use ws_client::WsClient;
