//! TLS support for VelocyStream connections
//!
//! Client-side TLS built on rustls. Server certificates are verified against
//! a configured CA file or, when none is given, the bundled webpki roots.
//! Supplying a client certificate and key enables mutual TLS.
//!
//! ```rust,ignore
//! use vst_network::tls::{TlsConfig, TlsConnector};
//!
//! let connector = TlsConnector::new(TlsConfig::client(Some("ca.pem")))?;
//! let stream = connector.connect("db.example.com", tcp_stream).await?;
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;

/// TLS configuration for client connections
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to client certificate file (PEM format), for mTLS
    pub cert_path: Option<String>,
    /// Path to client private key file (PEM format), for mTLS
    pub key_path: Option<String>,
    /// Path to CA certificate for server verification
    pub ca_path: Option<String>,
    /// Whether to verify the server certificate
    pub verify_peer: bool,
    /// Server name for SNI
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            ca_path: None,
            verify_peer: true,
            server_name: None,
        }
    }
}

impl TlsConfig {
    /// Create a TLS config verifying the server against `ca_path`, or the
    /// bundled roots when `None`
    pub fn client(ca_path: Option<impl AsRef<Path>>) -> Self {
        Self {
            ca_path: ca_path.map(|p| p.as_ref().to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    /// Create a TLS config for mutual TLS (mTLS)
    pub fn mtls(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        ca_path: impl AsRef<Path>,
    ) -> Self {
        Self {
            cert_path: Some(cert_path.as_ref().to_string_lossy().into_owned()),
            key_path: Some(key_path.as_ref().to_string_lossy().into_owned()),
            ca_path: Some(ca_path.as_ref().to_string_lossy().into_owned()),
            verify_peer: true,
            server_name: None,
        }
    }

    /// Set the server name for SNI
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Disable server certificate verification (NOT RECOMMENDED for production)
    pub fn with_insecure(mut self) -> Self {
        self.verify_peer = false;
        self
    }

    pub fn is_mtls(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

/// Error type for TLS operations
#[derive(Debug)]
pub enum TlsError {
    /// Certificate file not found or invalid
    CertificateError(String),
    /// Private key file not found or invalid
    KeyError(String),
    /// CA certificate file not found or invalid
    CaError(String),
    /// TLS handshake failed
    HandshakeError(String),
    /// I/O error during TLS operation
    IoError(std::io::Error),
    /// Configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::KeyError(msg) => write!(f, "Key error: {}", msg),
            TlsError::CaError(msg) => write!(f, "CA error: {}", msg),
            TlsError::HandshakeError(msg) => write!(f, "Handshake error: {}", msg),
            TlsError::IoError(e) => write!(f, "I/O error: {}", e),
            TlsError::ConfigError(msg) => write!(f, "Config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::IoError(e)
    }
}

/// Result type for TLS operations
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// TLS connector for client-side connections
#[derive(Clone)]
pub struct TlsConnector {
    config: TlsConfig,
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Create a new TLS connector with the given configuration
    pub fn new(config: TlsConfig) -> TlsResult<Self> {
        let inner = Self::build_connector(&config)?;
        Ok(Self { config, inner })
    }

    fn build_connector(config: &TlsConfig) -> TlsResult<tokio_rustls::TlsConnector> {
        let builder = if config.verify_peer {
            rustls::ClientConfig::builder().with_root_certificates(Self::root_store(config)?)
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
        };

        let client_config = match (&config.cert_path, &config.key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path).map_err(TlsError::CertificateError)?;
                let key = load_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| TlsError::ConfigError(format!("Invalid client cert: {}", e)))?
            },
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TlsError::ConfigError(
                    "mTLS requires both a certificate and a key".into(),
                ));
            },
        };

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_config)))
    }

    fn root_store(config: &TlsConfig) -> TlsResult<RootCertStore> {
        let mut root_store = RootCertStore::empty();

        if let Some(ref ca_path) = config.ca_path {
            let certs = load_certs(ca_path).map_err(TlsError::CaError)?;
            for cert in certs {
                root_store
                    .add(cert)
                    .map_err(|e| TlsError::CaError(format!("Failed to add CA: {}", e)))?;
            }
        } else {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        Ok(root_store)
    }

    /// Get the TLS configuration
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// Perform the TLS handshake over an established stream
    pub async fn connect<S>(
        &self,
        server_name: &str,
        stream: S,
    ) -> TlsResult<tokio_rustls::client::TlsStream<S>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TlsError::ConfigError(format!("Invalid server name: {}", e)))?;

        self.inner
            .connect(name, stream)
            .await
            .map_err(|e| TlsError::HandshakeError(e.to_string()))
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    let file = File::open(path).map_err(|e| format!("{}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|r| r.ok())
        .collect();

    if certs.is_empty() {
        return Err(format!("{}: no certificates found", path));
    }
    Ok(certs)
}

fn load_key(path: &str) -> TlsResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| TlsError::KeyError(format!("{}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::KeyError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TlsError::KeyError("No private key found".into()))
}

mod danger {
    use rustls::DigitallySignedStruct;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    /// Accepts any server certificate; signatures are still checked.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(rustls::crypto::aws_lc_rs::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
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

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_config_client() {
        let config = TlsConfig::client(Some("ca.pem"));
        assert!(config.cert_path.is_none());
        assert_eq!(config.ca_path, Some("ca.pem".to_string()));
        assert!(config.verify_peer);
        assert!(!config.is_mtls());
    }

    #[test]
    fn test_tls_config_mtls() {
        let config = TlsConfig::mtls("cert.pem", "key.pem", "ca.pem");
        assert_eq!(config.cert_path, Some("cert.pem".to_string()));
        assert_eq!(config.key_path, Some("key.pem".to_string()));
        assert_eq!(config.ca_path, Some("ca.pem".to_string()));
        assert!(config.is_mtls());
    }

    #[test]
    fn test_tls_connector_default_roots() {
        let config = TlsConfig::client(None::<&str>);
        assert!(TlsConnector::new(config).is_ok());
    }

    #[test]
    fn test_tls_connector_insecure() {
        let config = TlsConfig::client(None::<&str>).with_insecure();
        assert!(TlsConnector::new(config).is_ok());
    }

    #[test]
    fn test_tls_connector_missing_ca_file() {
        let config = TlsConfig::client(Some("/nonexistent/ca.pem"));
        assert!(matches!(TlsConnector::new(config), Err(TlsError::CaError(_))));
    }

    #[test]
    fn test_tls_connector_requires_cert_and_key() {
        let config = TlsConfig {
            cert_path: Some("cert.pem".into()),
            ..Default::default()
        };
        assert!(matches!(
            TlsConnector::new(config),
            Err(TlsError::ConfigError(_))
        ));
    }
}
