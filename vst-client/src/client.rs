use std::sync::Arc;

use tracing::debug;
use vst_core::Host;

use crate::codec::{JsonSerializer, Serializer};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::host::HostHandle;
use crate::pool::PoolStats;
use crate::protocol::VstProtocol;
use crate::request::{Lookup, Request, Response};

/// Asynchronous VelocyStream client
///
/// Cloning is cheap; clones share the same pool, host list and failure marks.
/// Separate clients built with [`VstClient::new`] share nothing.
///
/// # Example
///
/// ```rust,no_run
/// use vst_client::{ClientConfig, Credentials, Request, RequestType, VstClient};
///
/// # async fn run() -> vst_client::Result<()> {
/// let config = ClientConfig::new(vec!["127.0.0.1:8529".parse()?])
///     .with_credentials(Credentials::basic("root", "secret"));
/// let client = VstClient::new(config)?;
///
/// let response = client
///     .execute(&Request::new("_system", RequestType::Get, "/_api/version"))
///     .await?;
/// assert!(response.is_success());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct VstClient {
    protocol: Arc<VstProtocol>,
}

impl VstClient {
    /// Create a client using the JSON payload format. No connection is opened
    /// until the first request.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_serializer(config, Arc::new(JsonSerializer::new()))
    }

    /// Create a client with a custom payload serializer
    pub fn with_serializer(config: ClientConfig, serializer: Arc<dyn Serializer>) -> Result<Self> {
        config.validate()?;
        debug!(
            hosts = ?config.hosts,
            strategy = ?config.load_balancing,
            max_connections = config.max_connections,
            "Creating VST client"
        );
        let protocol = VstProtocol::new(&config, serializer)?;
        Ok(Self {
            protocol: Arc::new(protocol),
        })
    }

    /// Execute a request on whichever host the load balancing strategy picks
    pub async fn execute(&self, request: &Request) -> Result<Response> {
        self.protocol.execute(request, None).await
    }

    /// Execute a request, preferring the host `handle` is pinned to and
    /// pinning it to the host that answers
    pub async fn execute_on(&self, request: &Request, handle: &HostHandle) -> Result<Response> {
        self.protocol.execute(request, Some(handle)).await
    }

    /// Execute a request where a 404 is an expected outcome
    pub async fn lookup(&self, request: &Request) -> Result<Lookup> {
        self.protocol.lookup(request, None).await
    }

    /// Replace the host list with the endpoints the server reports
    pub async fn refresh_hosts(&self) -> Result<Vec<Host>> {
        self.protocol.refresh_hosts().await
    }

    /// Hosts currently known to the client
    pub fn hosts(&self) -> Vec<Host> {
        self.protocol.hosts()
    }

    /// Hosts marked failed since the last refresh or reset
    pub fn failed_hosts(&self) -> Vec<Host> {
        self.protocol.failed_hosts()
    }

    /// Forget all failure marks so every host is eligible again
    pub fn reset_failed_hosts(&self) {
        self.protocol.reset_failed_hosts();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.protocol.pool_stats()
    }

    /// Close all pooled connections. Requests issued afterwards fail with
    /// `TransportError::PoolClosed`.
    pub fn close(&self) {
        self.protocol.close();
    }
}

impl std::fmt::Debug for VstClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VstClient")
            .field("hosts", &self.protocol.hosts())
            .finish_non_exhaustive()
    }
}
