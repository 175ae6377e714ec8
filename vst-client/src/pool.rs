//! Per-host connection pooling
//!
//! The pool keeps one bounded sub-pool per host. A lease holds one of the
//! host's `max_connections` permits, so with `max_connections = 1` at most
//! one caller writes to the host at a time; later callers wait in
//! [`ConnectionPool::acquire`] until the lease is dropped.
//!
//! Connections are created lazily through a [`ConnectionFactory`], which
//! connects and authenticates. Idle connections that were closed by the
//! server or have been unused for longer than the TTL are discarded on
//! acquire instead of being handed out.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};
use vst_core::Host;

use crate::connection::{Connection, PendingResponse};
use crate::error::{ClientError, Result, TransportError};

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Arc<Connection>>> + Send>>;

/// Opens and authenticates a new connection: `(connection id, host)`.
pub type ConnectionFactory = Arc<dyn Fn(u64, Host) -> ConnectFuture + Send + Sync>;

/// Configuration for connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections per host
    pub max_connections: usize,
    /// Idle time after which a connection is evicted instead of reused
    pub connection_ttl: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: vst_core::DEFAULT_MAX_CONNECTIONS,
            connection_ttl: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum connections per host
    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Set the idle TTL
    pub fn with_connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = Some(ttl);
        self
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total connections created
    pub connections_created: u64,
    /// Total connections closed
    pub connections_closed: u64,
    /// Current active connections (leased)
    pub active_connections: u64,
    /// Current idle connections (available)
    pub idle_connections: u64,
    /// Total acquire attempts
    pub acquire_attempts: u64,
    /// Successful acquires
    pub acquire_successes: u64,
    /// Failed acquires (connect or authentication error)
    pub acquire_failures: u64,
    /// Idle connections dropped for exceeding the TTL
    pub expired_evictions: u64,
}

/// Internal pool metrics using atomics
#[derive(Debug, Default)]
struct PoolMetrics {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU64,
    idle_connections: AtomicU64,
    acquire_attempts: AtomicU64,
    acquire_successes: AtomicU64,
    acquire_failures: AtomicU64,
    expired_evictions: AtomicU64,
}

impl PoolMetrics {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            idle_connections: self.idle_connections.load(Ordering::Relaxed),
            acquire_attempts: self.acquire_attempts.load(Ordering::Relaxed),
            acquire_successes: self.acquire_successes.load(Ordering::Relaxed),
            acquire_failures: self.acquire_failures.load(Ordering::Relaxed),
            expired_evictions: self.expired_evictions.load(Ordering::Relaxed),
        }
    }
}

type IdleQueue = Arc<Mutex<VecDeque<Arc<Connection>>>>;

struct HostPool {
    semaphore: Arc<Semaphore>,
    idle: IdleQueue,
}

impl HostPool {
    fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            idle: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

/// Connection pool keyed by host
pub struct ConnectionPool {
    config: PoolConfig,
    factory: ConnectionFactory,
    hosts: DashMap<Host, Arc<HostPool>>,
    metrics: Arc<PoolMetrics>,
    next_connection_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: ConnectionFactory) -> Self {
        Self {
            config,
            factory,
            hosts: DashMap::new(),
            metrics: Arc::new(PoolMetrics::default()),
            next_connection_id: AtomicU64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn host_pool(&self, host: &Host) -> Arc<HostPool> {
        self.hosts
            .entry(host.clone())
            .or_insert_with(|| {
                debug!(host = %host, max = self.config.max_connections, "Creating host pool");
                Arc::new(HostPool::new(self.config.max_connections))
            })
            .clone()
    }

    /// Lease a connection to `host`, waiting while the host's pool is
    /// exhausted. A `one_shot` lease closes its connection on release.
    pub async fn acquire(&self, host: &Host, one_shot: bool) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(TransportError::PoolClosed.into());
        }

        self.metrics
            .acquire_attempts
            .fetch_add(1, Ordering::Relaxed);

        let pool = self.host_pool(host);
        let permit = pool
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::Transport(TransportError::PoolClosed))?;

        let conn = match self.take_idle(&pool) {
            Some(conn) => {
                trace!(conn_id = conn.id(), host = %host, "Reusing idle connection");
                conn
            },
            None => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                match (self.factory)(id, host.clone()).await {
                    Ok(conn) => {
                        self.metrics
                            .connections_created
                            .fetch_add(1, Ordering::Relaxed);
                        conn
                    },
                    Err(e) => {
                        self.metrics
                            .acquire_failures
                            .fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    },
                }
            },
        };

        if self.is_closed() {
            conn.close();
            return Err(TransportError::PoolClosed.into());
        }

        self.metrics
            .active_connections
            .fetch_add(1, Ordering::Relaxed);
        self.metrics
            .acquire_successes
            .fetch_add(1, Ordering::Relaxed);

        Ok(PooledConnection {
            conn,
            idle: pool.idle.clone(),
            metrics: self.metrics.clone(),
            pool_closed: self.closed.clone(),
            one_shot,
            discard: false,
            _permit: permit,
        })
    }

    fn take_idle(&self, pool: &HostPool) -> Option<Arc<Connection>> {
        let mut idle = pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(conn) = idle.pop_front() {
            self.metrics
                .idle_connections
                .fetch_sub(1, Ordering::Relaxed);

            if !conn.is_usable() {
                self.metrics
                    .connections_closed
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if conn.is_expired(self.config.connection_ttl) {
                debug!(conn_id = conn.id(), idle = ?conn.idle_for(), "Evicting expired connection");
                conn.close();
                self.metrics
                    .expired_evictions
                    .fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .connections_closed
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Idle connections currently held for `host`.
    pub fn idle_count(&self, host: &Host) -> usize {
        self.hosts.get(host).map_or(0, |pool| {
            pool.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        })
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every idle connection and reject further acquires. Leased
    /// connections are closed when their lease is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut count = 0u64;
        for entry in &self.hosts {
            entry.semaphore.close();
            let drained: Vec<_> = entry
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for conn in drained {
                conn.close();
                count += 1;
            }
        }

        self.metrics
            .connections_closed
            .fetch_add(count, Ordering::Relaxed);
        self.metrics.idle_connections.store(0, Ordering::Relaxed);
        debug!(closed = count, "Connection pool closed");
    }
}

/// RAII lease on a pooled connection
pub struct PooledConnection {
    conn: Arc<Connection>,
    idle: IdleQueue,
    metrics: Arc<PoolMetrics>,
    pool_closed: Arc<AtomicBool>,
    one_shot: bool,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn host(&self) -> &Host {
        self.conn.host()
    }

    pub async fn send(&self, payload: Bytes) -> Result<PendingResponse> {
        self.conn.send(payload).await
    }

    /// Close the connection on release instead of returning it to the pool
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("one_shot", &self.one_shot)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.metrics
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);

        let reusable = !self.one_shot
            && !self.discard
            && self.conn.is_usable()
            && !self.pool_closed.load(Ordering::Acquire);

        if reusable {
            self.conn.touch();
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(self.conn.clone());
            self.metrics
                .idle_connections
                .fetch_add(1, Ordering::Relaxed);
        } else {
            trace!(conn_id = self.conn.id(), one_shot = self.one_shot, "Releasing connection");
            self.conn.close();
            self.metrics
                .connections_closed
                .fetch_add(1, Ordering::Relaxed);
        }

        // Permit is released when dropped
    }
}
