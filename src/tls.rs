//! TLS termination settings.
//!
//! A configured certificate turns every accepted transport into a
//! server-side TLS stream before any HTTP bytes are read. Client identity
//! is verified when required but never surfaced to the handler.

use std::fmt;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsAcceptor;

use crate::protocol::ServerError;

/// Protocol versions the handshake may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn supported(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Server certificate, key, and handshake policy.
pub struct TlsSettings {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    versions: Vec<TlsVersion>,
    client_roots: Option<Vec<CertificateDer<'static>>>,
}

impl TlsSettings {
    /// DER certificate chain (leaf first) and its private key.
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, private_key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, private_key, versions: vec![TlsVersion::Tls12, TlsVersion::Tls13], client_roots: None }
    }

    /// Restricts the allowed protocol versions.
    pub fn versions(mut self, versions: Vec<TlsVersion>) -> Self {
        self.versions = versions;
        self
    }

    /// Requires clients to present a certificate chaining to one of the
    /// given roots.
    pub fn require_client_certificate(mut self, roots: Vec<CertificateDer<'static>>) -> Self {
        self.client_roots = Some(roots);
        self
    }

    pub(crate) fn build_acceptor(&self) -> Result<TlsAcceptor, ServerError> {
        let tls_error = |e: &dyn fmt::Display| ServerError::Tls { reason: e.to_string() };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions: Vec<_> = self.versions.iter().map(|v| v.supported()).collect();

        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)
            .map_err(|e| tls_error(&e))?;

        let builder = match &self.client_roots {
            Some(certs) => {
                let mut roots = RootCertStore::empty();
                for cert in certs {
                    roots.add(cert.clone()).map_err(|e| tls_error(&e))?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|e| tls_error(&e))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let config = builder
            .with_single_cert(self.cert_chain.clone(), self.private_key.clone_key())
            .map_err(|e| tls_error(&e))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

impl Clone for TlsSettings {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
            versions: self.versions.clone(),
            client_roots: self.client_roots.clone(),
        }
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("cert_chain", &self.cert_chain.len())
            .field("versions", &self.versions)
            .field("require_client_certificate", &self.client_roots.is_some())
            .finish_non_exhaustive()
    }
}
