use std::fmt;

use vst_core::{Host, VstError};

use crate::request::ServerError;

/// Failures of the transport underneath a request. These mark the host as
/// failed in the host handler so the next call can fail over.
#[derive(Debug)]
pub enum TransportError {
    /// TCP connect (or connect timeout) to a host failed
    ConnectFailed {
        /// Host that could not be reached
        host: Host,
        /// Underlying socket error
        source: std::io::Error,
    },
    /// I/O error on an established connection
    Io(std::io::Error),
    /// No response within the configured timeout
    Timeout,
    /// The connection went away while the request was pending
    ConnectionLost(String),
    /// TLS handshake or configuration error
    Tls(String),
    /// A response arrived but could not be decoded
    Decode(String),
    /// Every known host was tried; carries the last connect error
    NoHostAvailable(Option<Box<TransportError>>),
    /// The client was closed
    PoolClosed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed { host, source } => {
                write!(f, "Failed to connect to {}: {}", host, source)
            },
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Timeout => write!(f, "Request timed out"),
            Self::ConnectionLost(reason) => write!(f, "Connection lost: {}", reason),
            Self::Tls(msg) => write!(f, "TLS error: {}", msg),
            Self::Decode(msg) => write!(f, "Failed to decode response: {}", msg),
            Self::NoHostAvailable(Some(last)) => write!(f, "No host available, last error: {}", last),
            Self::NoHostAvailable(None) => write!(f, "No host available"),
            Self::PoolClosed => write!(f, "Connection pool is closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConnectFailed { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            Self::NoHostAvailable(Some(last)) => Some(last.as_ref()),
            _ => None,
        }
    }
}

/// Errors that can occur during client operations
#[derive(Debug)]
pub enum ClientError {
    /// Connect, I/O, timeout or decode failure
    Transport(TransportError),
    /// Malformed chunk stream; the owning connection was closed
    Protocol(String),
    /// Server answered with code >= 300 and an error body
    Server(ServerError),
    /// Server answered with code >= 300 and no decodable error body
    Status(u16),
    /// The authentication handshake was rejected
    Authentication(String),
    /// The request could not be encoded; nothing was sent
    Serialization(String),
    /// Invalid client configuration
    Config(String),
}

impl ClientError {
    /// Transport errors are the ones that mark a host as failed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// HTTP-style response code carried by server errors.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            Self::Server(e) => Some(e.response_code),
            Self::Status(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::Server(e) => write!(f, "Server error: {}", e),
            Self::Status(code) => write!(f, "Response Code: {}", code),
            Self::Authentication(msg) => write!(f, "Authentication failed: {}", msg),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Self::Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Server(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(TransportError::Io(err))
    }
}

impl From<ServerError> for ClientError {
    fn from(err: ServerError) -> Self {
        Self::Server(err)
    }
}

impl From<VstError> for ClientError {
    fn from(err: VstError) -> Self {
        match err {
            VstError::Io(e) => Self::Transport(TransportError::Io(e)),
            VstError::Config(msg) => Self::Config(msg),
            other => Self::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
