#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod client;
pub mod codec;
mod config;
pub mod connection;
mod error;
pub mod host;
pub mod pool;
mod protocol;
mod request;
pub mod store;
pub mod tls;

pub use client::VstClient;
pub use codec::{JsonSerializer, Serializer};
pub use config::{ClientConfig, ClientSettings};
pub use connection::{ClientStream, Connection, ConnectionSettings, ConnectionState, PendingResponse};
pub use error::{ClientError, Result, TransportError};
pub use host::{
    ExtendedHostResolver, FallbackHostHandler, HostHandle, HostHandler, HostResolver,
    LoadBalancingStrategy, RandomHostHandler, RoundRobinHostHandler, SimpleHostResolver,
    host_handler_for,
};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use protocol::VstProtocol;
pub use request::{Credentials, Lookup, Request, RequestType, Response, ServerError};
pub use store::MessageStore;
pub use tls::TlsClientConfig;
pub use vst_core::Host;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests;
