//! Error types for the hub session engine.
//!
//! All errors are `Clone` so a single in-flight connect attempt can hand
//! its outcome to every caller awaiting it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_tungstenite::tungstenite;

/// Transport-level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    Ws(Arc<tungstenite::Error>),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("malformed payload from hub: {0}")]
    Malformed(String),

    #[error("connection closed")]
    Closed,
}

impl From<tungstenite::Error> for WsError {
    fn from(e: tungstenite::Error) -> Self {
        Self::Ws(Arc::new(e))
    }
}

impl From<serde_json::Error> for WsError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(Arc::new(e))
    }
}

/// What went wrong during a hub operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Transport(#[from] WsError),

    #[error("login rejected: {0}")]
    Login(String),

    #[error("hub returned error {error} for request {request}")]
    Request { error: Value, request: Value },

    #[error("no completion within {0:?}")]
    Timeout(Duration),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("credentials: {0}")]
    Credentials(String),
}

/// Error returned by every public [`HubClient`](crate::HubClient) operation.
///
/// Names the hub, the attempted operation, and the underlying cause.
#[derive(Debug, Clone, thiserror::Error)]
#[error("hub {hub}: {operation} failed: {kind}")]
pub struct HubError {
    pub hub: String,
    pub operation: String,
    #[source]
    pub kind: ErrorKind,
}

impl HubError {
    pub fn new(hub: impl Into<String>, operation: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            hub: hub.into(),
            operation: operation.into(),
            kind,
        }
    }

    /// Re-labels the error with the operation the caller attempted.
    pub(crate) fn during(mut self, operation: &str) -> Self {
        if self.operation != operation {
            self.operation = format!("{operation} ({})", self.operation);
        }
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport(_))
    }
}
