//! TLS termination

use std::sync::Arc;

use async_trait::async_trait;
use rustls::server::ResolvesServerCert;
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace};

use crate::conn::WrappedConn;
use crate::mux::{Handler, ServeError};

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring provider as the process default if nothing else has
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

/// Terminates TLS with certificates from a resolver, then hands the plaintext on
#[derive(Clone)]
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
    next: Option<Arc<dyn Handler>>,
}

impl TlsTerminator {
    pub fn new(certs: Arc<dyn ResolvesServerCert>) -> Self {
        ensure_crypto_provider();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(certs);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            next: None,
        }
    }

    pub fn with_next(mut self, next: Arc<dyn Handler>) -> Self {
        self.next = Some(next);
        self
    }

    /// Complete the TLS handshake and return the decrypted connection.
    ///
    /// Connections that are not TLS, or were already terminated, come back
    /// as [`ServeError::NotHandled`].
    pub async fn terminate(&self, mut conn: WrappedConn) -> Result<WrappedConn, ServeError> {
        if conn.is_terminated() || !conn.is_encrypted().await {
            return Err(ServeError::NotHandled(conn));
        }

        let peer = conn.peer_addr().clone();
        let tls = self
            .acceptor
            .accept(conn)
            .await
            .map_err(|e| ServeError::Tls(format!("handshake with {} failed: {}", peer, e)))?;

        let plain = WrappedConn::from_terminated(tls);
        trace!(peer = %peer, servername = ?plain.check_servername(), "handshake complete");
        Ok(plain)
    }
}

#[async_trait]
impl Handler for TlsTerminator {
    async fn serve(&self, conn: WrappedConn) -> Result<(), ServeError> {
        let plain = self.terminate(conn).await?;
        match &self.next {
            Some(next) => next.serve(plain).await,
            None => Err(ServeError::Other("no handler after TLS termination".to_string())),
        }
    }
}

/// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
pub(crate) struct SkipVerification;

impl SkipVerification {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
