//! Host resolution and selection
//!
//! A [`HostResolver`] owns the list of candidate hosts. A [`HostHandler`]
//! picks one host per request according to a load-balancing policy and keeps
//! the failure marks the protocol reports. Marks live until the resolver's
//! list changes, which bumps its generation.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vst_core::Host;

pub trait HostResolver: Send + Sync {
    fn hosts(&self) -> Vec<Host>;

    /// Bumped every time the host list is replaced.
    fn generation(&self) -> u64;

    fn needs_refresh(&self) -> bool;

    /// Replace the host list. Returns false if the update was ignored.
    fn update(&self, hosts: Vec<Host>) -> bool;

    /// Record a refresh attempt that produced no list, so the next attempt
    /// waits for the refresh interval.
    fn defer_refresh(&self) {}
}

/// Static host list from configuration.
#[derive(Debug, Clone)]
pub struct SimpleHostResolver {
    hosts: Vec<Host>,
}

impl SimpleHostResolver {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { hosts }
    }
}

impl HostResolver for SimpleHostResolver {
    fn hosts(&self) -> Vec<Host> {
        self.hosts.clone()
    }

    fn generation(&self) -> u64 {
        0
    }

    fn needs_refresh(&self) -> bool {
        false
    }

    fn update(&self, _hosts: Vec<Host>) -> bool {
        false
    }
}

struct ResolvedHosts {
    hosts: Vec<Host>,
    generation: u64,
    last_refresh: Option<Instant>,
}

/// Host list seeded from configuration and periodically replaced by the
/// endpoint list the server advertises.
pub struct ExtendedHostResolver {
    state: RwLock<ResolvedHosts>,
    refresh_interval: Duration,
}

impl ExtendedHostResolver {
    pub fn new(hosts: Vec<Host>, refresh_interval: Duration) -> Self {
        Self {
            state: RwLock::new(ResolvedHosts {
                hosts,
                generation: 0,
                last_refresh: None,
            }),
            refresh_interval,
        }
    }
}

impl HostResolver for ExtendedHostResolver {
    fn hosts(&self) -> Vec<Host> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hosts
            .clone()
    }

    fn generation(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    fn needs_refresh(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_refresh
            .is_none_or(|at| at.elapsed() >= self.refresh_interval)
    }

    fn update(&self, hosts: Vec<Host>) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.last_refresh = Some(Instant::now());
        if hosts.is_empty() {
            warn!("Ignoring empty host list");
            return false;
        }
        debug!(hosts = ?hosts, generation = state.generation + 1, "Host list updated");
        state.hosts = hosts;
        state.generation += 1;
        true
    }

    fn defer_refresh(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_refresh = Some(Instant::now());
    }
}

/// Pins follow-up requests to the host an earlier request used.
#[derive(Debug, Clone, Default)]
pub struct HostHandle(Arc<Mutex<Option<Host>>>);

impl HostHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Host> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, host: Host) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(host);
    }

    pub fn clear(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub trait HostHandler: Send + Sync {
    /// Pick the host for the next request. A pinned handle wins while its host
    /// is still listed and not marked failed.
    fn get(&self, handle: Option<&HostHandle>) -> Option<Host>;

    fn fail(&self, host: &Host);

    fn failed_hosts(&self) -> Vec<Host>;

    /// Drop all failure marks.
    fn reset(&self);
}

/// Failure marks scoped to one resolver generation.
#[derive(Default)]
struct FailureMarks {
    generation: u64,
    failed: BTreeSet<Host>,
}

impl FailureMarks {
    /// Returns true when the host list changed since the last call.
    fn sync(&mut self, generation: u64) -> bool {
        if generation == self.generation {
            return false;
        }
        if !self.failed.is_empty() {
            debug!(cleared = self.failed.len(), generation, "Host list refreshed, clearing failure marks");
        }
        self.failed.clear();
        self.generation = generation;
        true
    }

    fn pinned(&self, handle: Option<&HostHandle>, hosts: &[Host]) -> Option<Host> {
        let pinned = handle?.get()?;
        (hosts.contains(&pinned) && !self.failed.contains(&pinned)).then_some(pinned)
    }
}

struct FallbackState {
    marks: FailureMarks,
    current: usize,
}

/// Sticks to one host and moves to the next only when it fails.
pub struct FallbackHostHandler {
    resolver: Arc<dyn HostResolver>,
    state: Mutex<FallbackState>,
}

impl FallbackState {
    fn sync(&mut self, generation: u64) {
        if self.marks.sync(generation) {
            self.current = 0;
        }
    }
}

impl FallbackHostHandler {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        let generation = resolver.generation();
        Self {
            resolver,
            state: Mutex::new(FallbackState {
                marks: FailureMarks {
                    generation,
                    failed: BTreeSet::new(),
                },
                current: 0,
            }),
        }
    }

    fn is_failed(&self, host: &Host) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sync(self.resolver.generation());
        state.marks.failed.contains(host)
    }
}

impl HostHandler for FallbackHostHandler {
    fn get(&self, handle: Option<&HostHandle>) -> Option<Host> {
        let hosts = self.resolver.hosts();
        if hosts.is_empty() {
            return None;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sync(self.resolver.generation());

        if let Some(pinned) = state.marks.pinned(handle, &hosts) {
            return Some(pinned);
        }

        if hosts.iter().all(|h| state.marks.failed.contains(h)) {
            warn!(hosts = hosts.len(), "All hosts marked failed, starting over");
            state.marks.failed.clear();
            state.current = 0;
        }

        let start = state.current % hosts.len();
        let index = (0..hosts.len())
            .map(|offset| (start + offset) % hosts.len())
            .find(|&i| !state.marks.failed.contains(&hosts[i]))?;
        state.current = index;
        Some(hosts[index].clone())
    }

    fn fail(&self, host: &Host) {
        let hosts = self.resolver.hosts();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sync(self.resolver.generation());
        state.marks.failed.insert(host.clone());

        if hosts.get(state.current) == Some(host) {
            state.current = (state.current + 1) % hosts.len();
        }
        warn!(host = %host, "Host marked failed");
    }

    fn failed_hosts(&self) -> Vec<Host> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sync(self.resolver.generation());
        state.marks.failed.iter().cloned().collect()
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.marks.failed.clear();
        state.current = 0;
    }
}

struct RoundRobinState {
    marks: FailureMarks,
    next: usize,
}

/// Rotates through the host list on every call. Failure marks are recorded
/// but do not affect selection.
pub struct RoundRobinHostHandler {
    resolver: Arc<dyn HostResolver>,
    state: Mutex<RoundRobinState>,
}

impl RoundRobinHostHandler {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        let generation = resolver.generation();
        Self {
            resolver,
            state: Mutex::new(RoundRobinState {
                marks: FailureMarks {
                    generation,
                    failed: BTreeSet::new(),
                },
                next: 0,
            }),
        }
    }
}

impl HostHandler for RoundRobinHostHandler {
    fn get(&self, handle: Option<&HostHandle>) -> Option<Host> {
        let hosts = self.resolver.hosts();
        if hosts.is_empty() {
            return None;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.marks.sync(self.resolver.generation());

        if let Some(pinned) = state.marks.pinned(handle, &hosts) {
            return Some(pinned);
        }

        let host = hosts[state.next % hosts.len()].clone();
        state.next = state.next.wrapping_add(1);
        Some(host)
    }

    fn fail(&self, host: &Host) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.marks.sync(self.resolver.generation());
        state.marks.failed.insert(host.clone());
        warn!(host = %host, "Host marked failed");
    }

    fn failed_hosts(&self) -> Vec<Host> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.marks.sync(self.resolver.generation());
        state.marks.failed.iter().cloned().collect()
    }

    fn reset(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .marks
            .failed
            .clear();
    }
}

/// Uniform random pick per call; a pick that is marked failed falls back to
/// the fallback chain.
pub struct RandomHostHandler {
    resolver: Arc<dyn HostResolver>,
    fallback: FallbackHostHandler,
}

impl RandomHostHandler {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            fallback: FallbackHostHandler::new(resolver.clone()),
            resolver,
        }
    }
}

impl HostHandler for RandomHostHandler {
    fn get(&self, handle: Option<&HostHandle>) -> Option<Host> {
        let hosts = self.resolver.hosts();
        if hosts.is_empty() {
            return None;
        }

        if let Some(pinned) = handle.and_then(HostHandle::get) {
            if hosts.contains(&pinned) && !self.fallback.is_failed(&pinned) {
                return Some(pinned);
            }
        }

        let pick = &hosts[rand::thread_rng().gen_range(0..hosts.len())];
        if self.fallback.is_failed(pick) {
            return self.fallback.get(None);
        }
        Some(pick.clone())
    }

    fn fail(&self, host: &Host) {
        self.fallback.fail(host);
    }

    fn failed_hosts(&self) -> Vec<Host> {
        self.fallback.failed_hosts()
    }

    fn reset(&self) {
        self.fallback.reset();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Fallback: first healthy host
    #[default]
    None,
    /// Random host per request, falling back on failure
    OneRandom,
    RoundRobin,
}

pub fn host_handler_for(
    strategy: LoadBalancingStrategy,
    resolver: Arc<dyn HostResolver>,
) -> Arc<dyn HostHandler> {
    match strategy {
        LoadBalancingStrategy::None => Arc::new(FallbackHostHandler::new(resolver)),
        LoadBalancingStrategy::OneRandom => Arc::new(RandomHostHandler::new(resolver)),
        LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobinHostHandler::new(resolver)),
    }
}
