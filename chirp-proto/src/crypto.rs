//! TLS context shared by every encrypted connection.
//!
//! rustls sessions are driven entirely in memory by the connection layer:
//! ciphertext read from the socket is fed through `read_tls`, plaintext
//! flows out of `reader()`, and outgoing records drain through `write_tls`
//! into the transmit queue. The chirp trust model is transport encryption
//! with failure reporting, not CA validation, so the client side accepts
//! any server certificate; verification failures of other kinds still
//! surface as `TlsError`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ClientConnection, PrivateKey, ServerConfig, ServerName};

/// Session factories for both connection directions
pub struct TlsContext {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl TlsContext {
    /// Build a context from a DER certificate chain and private key
    pub fn new(cert_chain: Vec<Certificate>, key: PrivateKey) -> Result<Self, rustls::Error> {
        let server = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        let client = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    /// Session for a connection we dialed
    pub(crate) fn connect_session(&self, peer: IpAddr) -> Result<rustls::Connection, rustls::Error> {
        let session = ClientConnection::new(self.client.clone(), ServerName::IpAddress(peer))?;
        Ok(session.into())
    }

    /// Session for a connection we accepted
    pub(crate) fn accept_session(&self) -> Result<rustls::Connection, rustls::Error> {
        let session = rustls::ServerConnection::new(self.server.clone())?;
        Ok(session.into())
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Literal loopback peers skip encryption, unless the configuration
/// forces it on
pub(crate) fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => ip.is_loopback(),
        IpAddr::V6(ip) => ip.is_loopback(),
    }
}
