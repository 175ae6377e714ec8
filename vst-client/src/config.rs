//! Client configuration
//!
//! [`ClientConfig`] is the one configuration struct the client accepts; it is
//! validated once when the client is built. [`ClientSettings`] is its file
//! form, loadable from TOML or JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vst_core::{DEFAULT_CHUNK_SIZE, DEFAULT_HOST, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT, Host};

use crate::error::{ClientError, Result};
use crate::host::LoadBalancingStrategy;
use crate::request::Credentials;
use crate::tls::TlsClientConfig;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HOST_LIST_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed hosts; with `acquire_host_list` the server's endpoint list
    /// replaces them
    pub hosts: Vec<Host>,
    /// Per-request response timeout (`None` = wait indefinitely)
    pub timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub credentials: Option<Credentials>,
    /// TLS configuration (None = plain TCP)
    pub tls: Option<TlsClientConfig>,
    /// Maximum payload bytes per chunk
    pub chunk_size: usize,
    /// Maximum connections per host
    pub max_connections: usize,
    /// Idle time after which a pooled connection is evicted
    pub connection_ttl: Option<Duration>,
    pub load_balancing: LoadBalancingStrategy,
    /// Fetch the coordinator endpoint list from the server
    pub acquire_host_list: bool,
    pub host_list_refresh_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: vec![Host::new(DEFAULT_HOST, DEFAULT_PORT)],
            timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            credentials: None,
            tls: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_ttl: None,
            load_balancing: LoadBalancingStrategy::None,
            acquire_host_list: false,
            host_list_refresh_interval: DEFAULT_HOST_LIST_REFRESH_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self {
            hosts,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Enable TLS with the provided configuration
    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = Some(ttl);
        self
    }

    pub fn with_load_balancing(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing = strategy;
        self
    }

    pub fn with_acquire_host_list(mut self, enabled: bool) -> Self {
        self.acquire_host_list = enabled;
        self
    }

    pub fn with_host_list_refresh_interval(mut self, interval: Duration) -> Self {
        self.host_list_refresh_interval = interval;
        self
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ClientError::Config("at least one host is required".into()));
        }
        vst_network::validate_chunk_size(self.chunk_size)?;
        if self.max_connections == 0 {
            return Err(ClientError::Config("max_connections must be at least 1".into()));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ClientError::Config("timeout must be greater than zero".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::Config("connect_timeout must be greater than zero".into()));
        }
        if self.connection_ttl.is_some_and(|t| t.is_zero()) {
            return Err(ClientError::Config("connection_ttl must be greater than zero".into()));
        }
        if self.acquire_host_list && self.host_list_refresh_interval.is_zero() {
            return Err(ClientError::Config(
                "host_list_refresh_interval must be greater than zero".into(),
            ));
        }
        match &self.credentials {
            Some(Credentials::Jwt { token }) if token.is_empty() => {
                Err(ClientError::Config("JWT token must not be empty".into()))
            },
            Some(Credentials::Basic { user, .. }) if user.is_empty() => {
                Err(ClientError::Config("user must not be empty".into()))
            },
            _ => Ok(()),
        }
    }
}

/// File form of [`ClientConfig`]. Durations are in milliseconds unless the
/// field name says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// `"host:port"` entries
    pub hosts: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub user: Option<String>,
    pub password: Option<String>,
    pub jwt: Option<String>,
    pub tls: Option<TlsClientConfig>,
    pub chunk_size: usize,
    pub max_connections: usize,
    pub connection_ttl_ms: Option<u64>,
    pub load_balancing: LoadBalancingStrategy,
    pub acquire_host_list: bool,
    pub host_list_refresh_interval_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            hosts: vec![format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT)],
            timeout_ms: None,
            connect_timeout_ms: duration_ms(DEFAULT_CONNECT_TIMEOUT),
            user: None,
            password: None,
            jwt: None,
            tls: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_ttl_ms: None,
            load_balancing: LoadBalancingStrategy::None,
            acquire_host_list: false,
            host_list_refresh_interval_secs: DEFAULT_HOST_LIST_REFRESH_INTERVAL.as_secs(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ClientSettings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| ClientError::Config(format!("TOML parse error: {}", e))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| ClientError::Config(format!("JSON parse error: {}", e))),
            _ => Err(ClientError::Config(format!(
                "Unknown config file extension: {}",
                ext
            ))),
        }
    }

    /// Convert to a validated [`ClientConfig`].
    pub fn into_config(self) -> Result<ClientConfig> {
        let hosts = self
            .hosts
            .iter()
            .map(|h| h.parse::<Host>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        let credentials = match (self.jwt, self.user) {
            (Some(_), Some(_)) => {
                return Err(ClientError::Config(
                    "configure either jwt or user/password, not both".into(),
                ));
            },
            (Some(token), None) => Some(Credentials::Jwt { token }),
            (None, Some(user)) => Some(Credentials::Basic {
                user,
                password: self.password.unwrap_or_default(),
            }),
            (None, None) => None,
        };

        let config = ClientConfig {
            hosts,
            timeout: self.timeout_ms.map(Duration::from_millis),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            credentials,
            tls: self.tls,
            chunk_size: self.chunk_size,
            max_connections: self.max_connections,
            connection_ttl: self.connection_ttl_ms.map(Duration::from_millis),
            load_balancing: self.load_balancing,
            acquire_host_list: self.acquire_host_list,
            host_list_refresh_interval: Duration::from_secs(self.host_list_refresh_interval_secs),
        };
        config.validate()?;
        Ok(config)
    }
}
