//! Server host addressing
//!
//! A [`Host`] is an immutable `address:port` pair. Hosts come either from
//! static configuration (`"db1:8529"`) or from the endpoint list a
//! coordinator returns (`"tcp://10.0.0.4:8529"`, `"ssl://[::1]:8530"`).

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, VstError};

const ENDPOINT_SCHEMES: &[&str] = &[
    "tcp://",
    "ssl://",
    "vst://",
    "vsts://",
    "http://",
    "https://",
    "http+tcp://",
    "http+ssl://",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    address: String,
    port: u16,
}

impl Host {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    #[inline]
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse a server-advertised endpoint such as `tcp://10.0.0.4:8529`.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let trimmed = endpoint.trim();
        let authority = ENDPOINT_SCHEMES
            .iter()
            .find_map(|scheme| trimmed.strip_prefix(scheme))
            .ok_or_else(|| VstError::InvalidEndpoint(format!("unsupported scheme: {}", trimmed)))?;

        let authority = authority.trim_end_matches('/');
        authority
            .parse()
            .map_err(|_| VstError::InvalidEndpoint(trimmed.to_string()))
    }
}

impl FromStr for Host {
    type Err = VstError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || VstError::InvalidEndpoint(s.to_string());

        let (address, port) = if let Some(rest) = s.strip_prefix('[') {
            // [v6]:port
            let (address, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = tail.strip_prefix(':').ok_or_else(invalid)?;
            (address, port)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };

        if address.is_empty() || address.contains(':') && !s.starts_with('[') {
            return Err(invalid());
        }

        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(address, port))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}
