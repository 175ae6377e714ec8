//! TLS settings for VelocyStream connections
//!
//! # Example
//!
//! ```rust
//! use vst_client::TlsClientConfig;
//!
//! // Verify the server against the bundled root certificates
//! let tls_config = TlsClientConfig::new();
//!
//! // Custom CA plus a client certificate for mTLS
//! let tls_config = TlsClientConfig::new()
//!     .with_ca_cert("/path/to/ca.pem")
//!     .with_client_cert("/path/to/client.pem", "/path/to/client-key.pem");
//!
//! assert!(tls_config.is_mtls());
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// TLS configuration for client connections
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Path to CA certificate for server verification
    pub ca_cert_path: Option<PathBuf>,
    /// Path to client certificate (for mTLS)
    pub client_cert_path: Option<PathBuf>,
    /// Path to client private key (for mTLS)
    pub client_key_path: Option<PathBuf>,
    /// Server name for SNI (defaults to the host address)
    pub server_name: Option<String>,
    /// Skip server certificate verification (dangerous, testing only)
    pub danger_accept_invalid_certs: bool,
}

impl TlsClientConfig {
    /// Create a new TLS configuration with default settings
    ///
    /// Uses the bundled root certificates for server verification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CA certificate path for server verification
    pub fn with_ca_cert(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_cert_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set client certificate and key for mTLS authentication
    pub fn with_client_cert(
        mut self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.as_ref().to_path_buf());
        self.client_key_path = Some(key_path.as_ref().to_path_buf());
        self
    }

    /// Set the server name for SNI
    ///
    /// If not set, the address of the host being connected to is used.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Skip server certificate verification (DANGEROUS)
    ///
    /// This should only be used for testing. It disables certificate
    /// verification, making the connection vulnerable to MITM attacks.
    #[cfg(any(test, feature = "dangerous-testing"))]
    pub fn danger_accept_invalid_certs(mut self) -> Self {
        self.danger_accept_invalid_certs = true;
        self
    }

    /// Check if mTLS is configured
    pub fn is_mtls(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// Convert to vst-network TlsConfig
    pub fn to_network_config(&self) -> vst_network::TlsConfig {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());

        let mut config = vst_network::TlsConfig {
            cert_path: path(&self.client_cert_path),
            key_path: path(&self.client_key_path),
            ca_path: path(&self.ca_cert_path),
            verify_peer: !self.danger_accept_invalid_certs,
            server_name: None,
        };
        if let Some(ref name) = self.server_name {
            config = config.with_server_name(name.clone());
        }
        config
    }
}
