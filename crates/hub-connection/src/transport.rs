//! Transport seam: how a session obtains a WebSocket link to a hub.
//!
//! Production code uses [`WsConnector`] (tokio-tungstenite over rustls).
//! Anything yielding a frame sink and a frame stream can stand in for it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Sink, Stream, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

use ezlo_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::error::WsError;

/// Outbound half of a hub link.
pub type WsSink = Pin<Box<dyn Sink<tungstenite::Message, Error = tungstenite::Error> + Send>>;

/// Inbound half of a hub link.
pub type WsStream =
    Pin<Box<dyn Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Send>>;

/// Opens links to hubs.
pub trait Connector: Send + Sync {
    /// Opens a new link to `url`.
    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(WsSink, WsStream), WsError>> + Send + 'a>>;
}

/// Secure WebSocket connector used against real hubs.
#[derive(Debug, Clone)]
pub struct WsConnector {
    accept_invalid_certs: bool,
}

impl WsConnector {
    pub fn new(accept_invalid_certs: bool) -> Self {
        Self {
            accept_invalid_certs,
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connector for WsConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(WsSink, WsStream), WsError>> + Send + 'a>> {
        Box::pin(async move {
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
            ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

            let tls = if self.accept_invalid_certs && url.starts_with("wss://") {
                Some(tokio_tungstenite::Connector::Rustls(Arc::new(
                    insecure_tls_config()?,
                )))
            } else {
                None
            };

            let (ws_stream, _) =
                tokio_tungstenite::connect_async_tls_with_config(url, Some(ws_config), false, tls)
                    .await?;
            debug!(url, "WebSocket link established");

            let (write, read) = ws_stream.split();
            Ok((Box::pin(write) as WsSink, Box::pin(read) as WsStream))
        })
    }
}

/// Client TLS config that accepts the hub's self-signed certificate while
/// still checking handshake signatures.
fn insecure_tls_config() -> Result<rustls::ClientConfig, WsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| WsError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
