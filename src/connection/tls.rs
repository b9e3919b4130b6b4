//! TLS contexts and the handshake stage spliced into secure connections.
//!
//! A [`TlsContext`] wraps a compiled rustls `ClientConfig`. An [`SslStage`]
//! pairs a context with the handshake timeout the engine must honour before
//! it reports a connection as established.

use crate::metrics::{histograms, labels};
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fs;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

/// Where trusted root certificates come from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RootSource {
    /// Mozilla roots bundled by `webpki-roots`
    #[default]
    Webpki,
    /// The operating system's trust store
    Native,
    /// A PEM file with one or more CA certificates
    CaFile(PathBuf),
}

/// Client-side TLS context.
///
/// Cheap to clone; clones share the compiled rustls configuration.
///
/// # Examples
///
/// ```ignore
/// use wire_connect::connection::TlsContext;
///
/// // Bundled webpki roots
/// let ctx = TlsContext::builder().build()?;
///
/// // Private CA plus ALPN
/// let ctx = TlsContext::builder()
///     .ca_cert_path("/etc/ssl/private-ca.pem")
///     .alpn_protocols(["h2", "http/1.1"])
///     .build()?;
/// ```
#[derive(Clone)]
pub struct TlsContext {
    roots: RootSource,
    alpn: Vec<Vec<u8>>,
    client_auth: bool,
    danger_accept_invalid_certs: bool,
    client_config: Arc<ClientConfig>,
}

impl TlsContext {
    /// Create a new TLS context builder.
    pub fn builder() -> TlsContextBuilder {
        TlsContextBuilder::default()
    }

    /// Process-wide default context (webpki roots, no client auth).
    ///
    /// Built once on first use. When building fails the failure is cached
    /// and `None` is returned from then on.
    pub fn default_context() -> Option<TlsContext> {
        static DEFAULT: OnceLock<Option<TlsContext>> = OnceLock::new();
        DEFAULT
            .get_or_init(|| match TlsContext::builder().build() {
                Ok(ctx) => Some(ctx),
                Err(err) => {
                    tracing::warn!(error = %err, "default TLS context is unavailable");
                    None
                }
            })
            .clone()
    }

    /// Get the rustls ClientConfig for this context.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Connector performing handshakes with this context
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config())
    }

    /// Root certificate source
    pub fn roots(&self) -> &RootSource {
        &self.roots
    }

    /// Configured ALPN protocols
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn
    }

    /// Whether a client certificate is presented
    pub fn has_client_auth(&self) -> bool {
        self.client_auth
    }

    /// Check if invalid certificates are accepted (development only).
    pub fn danger_accept_invalid_certs(&self) -> bool {
        self.danger_accept_invalid_certs
    }

    /// Whether both contexts share the same compiled configuration
    pub fn same_as(&self, other: &TlsContext) -> bool {
        Arc::ptr_eq(&self.client_config, &other.client_config)
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("roots", &self.roots)
            .field("alpn", &self.alpn.len())
            .field("client_auth", &self.client_auth)
            .field(
                "danger_accept_invalid_certs",
                &self.danger_accept_invalid_certs,
            )
            .field("client_config", &"<ClientConfig>")
            .finish()
    }
}

/// Builder for [`TlsContext`].
#[derive(Debug, Default, Clone)]
pub struct TlsContextBuilder {
    roots: RootSource,
    alpn: Vec<Vec<u8>>,
    client_cert: Option<(PathBuf, PathBuf)>,
    danger_accept_invalid_certs: bool,
}

impl TlsContextBuilder {
    /// Trust the CA certificates in a PEM file instead of the bundled roots.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let ctx = TlsContext::builder()
    ///     .ca_cert_path("/etc/ssl/certs/ca.pem")
    ///     .build()?;
    /// ```
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.roots = RootSource::CaFile(path.into());
        self
    }

    /// Trust the operating system's root store.
    pub fn native_roots(mut self) -> Self {
        self.roots = RootSource::Native;
        self
    }

    /// Trust the bundled webpki roots (default).
    pub fn webpki_roots(mut self) -> Self {
        self.roots = RootSource::Webpki;
        self
    }

    /// Offer these ALPN protocols, in preference order.
    pub fn alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.alpn = protocols.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    /// Present a client certificate chain and key (both PEM) for mutual TLS.
    pub fn client_auth_pem(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.client_cert = Some((cert_path.into(), key_path.into()));
        self
    }

    /// ⚠️ **DANGER**: Accept invalid certificates (development only).
    ///
    /// **NEVER use in production.** This disables certificate validation
    /// entirely, making the connection vulnerable to man-in-the-middle attacks.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    /// Build the TLS context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if:
    /// - the CA or client certificate files cannot be read or parsed
    /// - no root certificate could be loaded
    /// - rustls rejects the client key
    pub fn build(self) -> Result<TlsContext> {
        let builder = ClientConfig::builder();
        let builder = if self.danger_accept_invalid_certs {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new()))
        } else {
            builder.with_root_certificates(self.root_store()?)
        };

        let mut config = match &self.client_cert {
            Some((cert_path, key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::Tls(format!("invalid client certificate: {}", e)))?
            }
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn.clone();

        Ok(TlsContext {
            roots: self.roots,
            alpn: self.alpn,
            client_auth: self.client_cert.is_some(),
            danger_accept_invalid_certs: self.danger_accept_invalid_certs,
            client_config: Arc::new(config),
        })
    }

    fn root_store(&self) -> Result<RootCertStore> {
        match &self.roots {
            RootSource::Webpki => {
                let mut store = RootCertStore::empty();
                store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                Ok(store)
            }
            RootSource::Native => {
                let result = rustls_native_certs::load_native_certs();

                let mut store = RootCertStore::empty();
                for cert in result.certs {
                    let _ = store.add_parsable_certificates(std::iter::once(cert));
                }

                if store.is_empty() {
                    return Err(Error::Tls(
                        "failed to load any system root certificates".to_string(),
                    ));
                }
                if !result.errors.is_empty() {
                    tracing::debug!(errors = result.errors.len(), "some system roots were skipped");
                }
                Ok(store)
            }
            RootSource::CaFile(path) => load_custom_ca(path),
        }
    }
}

/// Load CA certificates from a PEM file.
fn load_custom_ca(ca_path: &Path) -> Result<RootCertStore> {
    let ca_cert_data = fs::read(ca_path).map_err(|e| {
        Error::Tls(format!(
            "failed to read CA certificate file '{}': {}",
            ca_path.display(),
            e
        ))
    })?;

    let mut reader = io::Cursor::new(&ca_cert_data);
    let mut root_store = RootCertStore::empty();
    let mut found_certs = 0;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                let _ = root_store.add_parsable_certificates(std::iter::once(cert));
                found_certs += 1;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Tls(format!(
                    "failed to parse CA certificate from '{}'",
                    ca_path.display()
                )));
            }
        }
    }

    if found_certs == 0 {
        return Err(Error::Tls(format!(
            "no valid certificates found in '{}'",
            ca_path.display()
        )));
    }

    Ok(root_store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path)
        .map_err(|e| Error::Tls(format!("failed to read '{}': {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut io::Cursor::new(&data))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::Tls(format!("failed to parse '{}': {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = fs::read(path)
        .map_err(|e| Error::Tls(format!("failed to read '{}': {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut io::Cursor::new(&data))
        .map_err(|e| Error::Tls(format!("failed to parse '{}': {}", path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in '{}'", path.display())))
}

/// Verifier that accepts any server certificate
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl NoCertificateVerification {
    fn new() -> Self {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        Self { provider }
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS stage of a connection template: context, handshake timeout and an
/// optional SNI override.
#[derive(Debug, Clone)]
pub struct SslStage {
    context: TlsContext,
    handshake_timeout: Duration,
    server_name: Option<String>,
}

impl SslStage {
    /// Create a stage.
    ///
    /// # Panics
    ///
    /// Panics if `handshake_timeout` is zero.
    pub fn new(context: TlsContext, handshake_timeout: Duration) -> Self {
        assert!(
            !handshake_timeout.is_zero(),
            "TLS handshake timeout must be positive"
        );
        Self {
            context,
            handshake_timeout,
            server_name: None,
        }
    }

    /// Present `name` as SNI instead of the remote host.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// TLS context
    pub fn context(&self) -> &TlsContext {
        &self.context
    }

    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// SNI override
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Drive a handshake future under this stage's timeout.
    ///
    /// Elapsed timeout yields [`Error::HandshakeTimeout`], any other
    /// handshake failure [`Error::Handshake`].
    pub async fn handshake_with<F, T>(&self, handshake: F) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.handshake_timeout, handshake).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                histograms::handshake_duration(labels::RESULT_OK, elapsed_ms);
                Ok(value)
            }
            Ok(Err(err)) => {
                histograms::handshake_duration(labels::RESULT_ERROR, elapsed_ms);
                match Error::classify_io(err) {
                    Error::Io(err) => Err(Error::Handshake(err.to_string())),
                    reset => Err(reset),
                }
            }
            Err(_) => {
                histograms::handshake_duration(labels::RESULT_TIMEOUT, elapsed_ms);
                tracing::debug!(timeout = ?self.handshake_timeout, "TLS handshake timed out");
                Err(Error::HandshakeTimeout(self.handshake_timeout))
            }
        }
    }

    /// Perform the client handshake over `io`, presenting `host` (or the SNI
    /// override) as server name.
    pub async fn handshake<IO>(&self, io: IO, host: &str) -> Result<tokio_rustls::client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = server_name(self.server_name().unwrap_or(host))?;
        self.handshake_with(self.context.connector().connect(name, io))
            .await
    }
}

/// Parse a host into a TLS server name (SNI).
///
/// IP literals become IP server names; anything else must be a plausible
/// DNS name.
///
/// # Errors
///
/// Returns [`Error::Config`] if the hostname is invalid.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }

    let hostname = host.trim_end_matches('.');
    if hostname.is_empty()
        || hostname.len() > 253
        || !hostname
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '.')
    {
        return Err(Error::Config(format!(
            "invalid hostname for TLS: '{}'",
            host
        )));
    }

    ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::Config(format!("invalid hostname for TLS: '{}'", host)))
}
