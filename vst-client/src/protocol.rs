//! Request execution
//!
//! [`VstProtocol`] ties the pieces together for one request:
//!
//! 1. refresh the host list if the resolver is due
//! 2. encode the request (nothing is sent if this fails)
//! 3. pick a host and lease a connection, failing over to the next host when
//!    connecting fails
//! 4. register the message id, write the chunks, release the lease
//! 5. wait for the response and translate codes >= 300 into errors
//!
//! A request that has been written is never retried. Transport failures mark
//! the host so the *next* request goes elsewhere.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use vst_core::{Host, PATH_ENDPOINTS, SYSTEM_DATABASE};
use vst_network::TlsConnector;

use crate::codec::Serializer;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionSettings};
use crate::error::{ClientError, Result, TransportError};
use crate::host::{
    ExtendedHostResolver, HostHandle, HostHandler, HostResolver, SimpleHostResolver,
    host_handler_for,
};
use crate::pool::{ConnectFuture, ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection};
use crate::request::{Lookup, Request, RequestType, Response};

pub struct VstProtocol {
    serializer: Arc<dyn Serializer>,
    resolver: Arc<dyn HostResolver>,
    handler: Arc<dyn HostHandler>,
    pool: ConnectionPool,
    timeout: Option<Duration>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl VstProtocol {
    /// Build the resolver, handler and pool described by `config`. The config
    /// must already be validated.
    pub fn new(config: &ClientConfig, serializer: Arc<dyn Serializer>) -> Result<Self> {
        let resolver: Arc<dyn HostResolver> = if config.acquire_host_list {
            Arc::new(ExtendedHostResolver::new(
                config.hosts.clone(),
                config.host_list_refresh_interval,
            ))
        } else {
            Arc::new(SimpleHostResolver::new(config.hosts.clone()))
        };
        let handler = host_handler_for(config.load_balancing, resolver.clone());

        let (tls, server_name) = match &config.tls {
            Some(tls) => {
                let network = tls.to_network_config();
                let server_name = network.server_name.clone();
                let connector = TlsConnector::new(network)
                    .map_err(|e| ClientError::Transport(TransportError::Tls(e.to_string())))?;
                (Some(connector), server_name)
            },
            None => (None, None),
        };

        let settings = ConnectionSettings {
            connect_timeout: config.connect_timeout,
            chunk_size: config.chunk_size,
            tls,
            server_name,
        };

        let factory = connection_factory(
            settings,
            config.credentials.clone(),
            serializer.clone(),
            config.timeout,
        );

        let pool_config = PoolConfig {
            max_connections: config.max_connections,
            connection_ttl: config.connection_ttl,
        };

        Ok(Self {
            serializer,
            resolver,
            handler,
            pool: ConnectionPool::new(pool_config, factory),
            timeout: config.timeout,
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Execute a request. With a handle, the request goes to the host the
    /// handle is pinned to (while that host is healthy) and the handle is
    /// pinned to whichever host answered.
    pub async fn execute(&self, request: &Request, handle: Option<&HostHandle>) -> Result<Response> {
        if self.pool.is_closed() {
            return Err(TransportError::PoolClosed.into());
        }
        self.refresh_if_due().await;
        self.send_request(request, handle, false).await
    }

    /// Like [`execute`](Self::execute), but a 404 is `Lookup::NotFound`
    /// instead of an error.
    pub async fn lookup(&self, request: &Request, handle: Option<&HostHandle>) -> Result<Lookup> {
        match self.execute(request, handle).await {
            Ok(response) => Ok(Lookup::Found(response)),
            Err(e) if e.response_code() == Some(404) => Ok(Lookup::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Fetch the coordinator endpoint list and replace the resolver's hosts.
    /// On failure the previous list stays in place and the error is returned.
    pub async fn refresh_hosts(&self) -> Result<Vec<Host>> {
        let result = self.fetch_endpoints().await;
        match &result {
            Ok(hosts) => {
                self.resolver.update(hosts.clone());
            },
            Err(_) => self.resolver.defer_refresh(),
        }
        result
    }

    async fn fetch_endpoints(&self) -> Result<Vec<Host>> {
        let request = Request::new(SYSTEM_DATABASE, RequestType::Get, PATH_ENDPOINTS);
        let response = self.send_request(&request, None, true).await?;

        let body = response
            .body
            .ok_or_else(|| ClientError::Protocol("endpoint list response has no body".into()))?;
        let endpoints = self.serializer.decode_endpoints(&body)?;

        let hosts: Vec<Host> = endpoints
            .iter()
            .filter_map(|endpoint| match Host::from_endpoint(endpoint) {
                Ok(host) => Some(host),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Skipping unusable endpoint");
                    None
                },
            })
            .collect();

        if hosts.is_empty() {
            return Err(ClientError::Protocol("server returned no usable endpoints".into()));
        }
        debug!(hosts = ?hosts, "Fetched endpoint list");
        Ok(hosts)
    }

    async fn refresh_if_due(&self) {
        if !self.resolver.needs_refresh() {
            return;
        }
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if !self.resolver.needs_refresh() {
            return;
        }
        if let Err(e) = self.refresh_hosts().await {
            warn!(error = %e, "Host list refresh failed, keeping previous hosts");
        }
    }

    async fn send_request(
        &self,
        request: &Request,
        handle: Option<&HostHandle>,
        one_shot: bool,
    ) -> Result<Response> {
        let payload = self.serializer.encode_request(request)?;

        let lease = self.acquire(handle, one_shot).await?;
        let host = lease.host().clone();

        let pending = match lease.send(payload).await {
            Ok(pending) => pending,
            Err(e) => {
                self.record_failure(&host, &e);
                return Err(e);
            },
        };

        // Other requests may share the connection while this one waits; a
        // one-shot lease is kept until the response is in.
        let lease = if one_shot {
            Some(lease)
        } else {
            drop(lease);
            None
        };

        let result = pending.wait(self.timeout).await;
        drop(lease);

        let message = match result {
            Ok(message) => message,
            Err(e) => {
                self.record_failure(&host, &e);
                return Err(e);
            },
        };

        let response = match self.serializer.decode_response(message.payload) {
            Ok(response) => response,
            Err(e) => {
                self.record_failure(&host, &e);
                return Err(e);
            },
        };

        if let Some(handle) = handle {
            handle.set(host);
        }
        self.check_status(response)
    }

    /// Lease a connection, trying each known host at most once while
    /// connecting fails.
    async fn acquire(&self, handle: Option<&HostHandle>, one_shot: bool) -> Result<PooledConnection> {
        let attempts = self.resolver.hosts().len().max(1);
        let mut last_error = None;

        for _ in 0..attempts {
            let Some(host) = self.handler.get(handle) else {
                break;
            };

            match self.pool.acquire(&host, one_shot).await {
                Ok(lease) => return Ok(lease),
                Err(ClientError::Transport(TransportError::PoolClosed)) => {
                    return Err(TransportError::PoolClosed.into());
                },
                Err(ClientError::Transport(e)) => {
                    warn!(host = %host, error = %e, "Connection failed, trying next host");
                    self.handler.fail(&host);
                    last_error = Some(Box::new(e));
                },
                Err(e) => return Err(e),
            }
        }

        Err(TransportError::NoHostAvailable(last_error).into())
    }

    fn record_failure(&self, host: &Host, error: &ClientError) {
        if error.is_transport() {
            warn!(host = %host, error = %error, "Request failed");
            self.handler.fail(host);
        }
    }

    fn check_status(&self, response: Response) -> Result<Response> {
        if response.is_success() {
            return Ok(response);
        }

        let code = response.response_code;
        match response.body.as_deref() {
            Some(body) if !body.is_empty() => match self.serializer.decode_error(code, body) {
                Ok(error) => Err(ClientError::Server(error)),
                Err(e) => {
                    debug!(code, error = %e, "Undecodable error body");
                    Err(ClientError::Status(code))
                },
            },
            _ => Err(ClientError::Status(code)),
        }
    }

    pub fn hosts(&self) -> Vec<Host> {
        self.resolver.hosts()
    }

    pub fn failed_hosts(&self) -> Vec<Host> {
        self.handler.failed_hosts()
    }

    pub fn reset_failed_hosts(&self) {
        self.handler.reset();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close every pooled connection. Later requests fail with
    /// `TransportError::PoolClosed`.
    pub fn close(&self) {
        self.pool.close();
    }
}

fn connection_factory(
    settings: ConnectionSettings,
    credentials: Option<crate::request::Credentials>,
    serializer: Arc<dyn Serializer>,
    timeout: Option<Duration>,
) -> ConnectionFactory {
    Arc::new(move |id: u64, host: Host| -> ConnectFuture {
        let settings = settings.clone();
        let credentials = credentials.clone();
        let serializer = serializer.clone();
        Box::pin(async move {
            let conn = Connection::open(id, &host, &settings).await?;
            conn.authenticate(credentials.as_ref(), serializer.as_ref(), timeout)
                .await?;
            Ok::<_, ClientError>(conn)
        })
    })
}
