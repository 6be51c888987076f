//! TLS policy and parameters for the STARTTLS upgrade

use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};

/// When and whether the connection is upgraded to TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsLevel {
    /// Never use TLS
    Disabled,
    /// Upgrade via STARTTLS when the server offers it
    #[default]
    Optional,
    /// Refuse to proceed without STARTTLS
    Required,
}

/// Errors while assembling [`TlsParameters`]
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid root certificate: {0}")]
    InvalidCertificate(#[source] rustls::Error),
    #[error("invalid TLS server name: {0:?}")]
    InvalidServerName(String),
}

/// Client-side TLS configuration: trust store, verification mode and an
/// optional certificate-name override.
#[derive(Clone)]
pub struct TlsParameters {
    pub(crate) config: Arc<ClientConfig>,
    /// Name expected in the server certificate; defaults to the host
    /// passed to `send`
    pub(crate) domain: Option<String>,
}

impl Default for TlsParameters {
    fn default() -> TlsParameters {
        TlsParameters::new()
    }
}

impl TlsParameters {
    /// Parameters trusting the bundled Mozilla root store
    pub fn new() -> TlsParameters {
        TlsParameters::builder().build().expect("default TLS parameters")
    }

    /// Start assembling custom parameters
    pub fn builder() -> TlsParametersBuilder {
        TlsParametersBuilder::default()
    }

    /// Use a fully custom rustls configuration, e.g. for restricting
    /// cipher suites or protocol versions
    pub fn from_client_config(config: Arc<ClientConfig>) -> TlsParameters {
        TlsParameters {
            config,
            domain: None,
        }
    }

    pub(crate) fn server_name(&self, fallback: &str) -> Result<ServerName<'static>, TlsError> {
        let host = self.domain.as_deref().unwrap_or(fallback);
        ServerName::try_from(host.to_owned())
            .map_err(|_| TlsError::InvalidServerName(host.to_owned()))
    }
}

impl std::fmt::Debug for TlsParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsParameters")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TlsParameters`]
#[derive(Default)]
pub struct TlsParametersBuilder {
    domain: Option<String>,
    extra_roots: Vec<CertificateDer<'static>>,
    accept_invalid_certs: bool,
}

impl TlsParametersBuilder {
    /// Expect this name in the server certificate instead of the
    /// connect host
    pub fn domain<S: Into<String>>(mut self, domain: S) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Trust an additional DER-encoded root certificate
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.extra_roots.push(cert);
        self
    }

    /// Skip certificate verification entirely. This defeats the purpose
    /// of TLS and must only be used against trusted local servers.
    pub fn dangerous_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn build(self) -> Result<TlsParameters, TlsError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in self.extra_roots {
            roots.add(cert).map_err(TlsError::InvalidCertificate)?;
        }

        let config = ClientConfig::builder().with_root_certificates(roots);
        let mut config = config.with_no_client_auth();
        if self.accept_invalid_certs {
            let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerification(provider)));
        }

        Ok(TlsParameters {
            config: Arc::new(config),
            domain: self.domain,
        })
    }
}

/// Accepts any server certificate. Signatures are still checked so the
/// handshake itself stays well-formed.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
