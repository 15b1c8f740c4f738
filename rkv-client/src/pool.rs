//! # Connection Pool
//!
//! Purpose: Keep a bounded set of healthy multiplexed connections alive and
//! hand them out fairly under load.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Connections are created lazily, reused across
//!    callers and evicted only when they fail.
//! 2. **Least Load**: `acquire` picks the healthy connection with the fewest
//!    leases below the in-flight cap; new connections go to endpoints in
//!    round-robin order.
//! 3. **Minimal Locking**: Registry bookkeeping sits behind one mutex that is
//!    never held across an `.await`.
//! 4. **Wake on Release**: Waiters park on a `Notify` signalled by release,
//!    creation and eviction, with a short poll interval as fallback.
//! 5. **RAII Leases**: A `Lease` releases its slot on drop, exactly once.
//!
//! ## Structure Overview
//!
//! ```text
//! ConnectionPool (Clone)
//!   └── PoolShared
//!         ├── state: Mutex<PoolState>
//!         │     ├── slots: HashMap<ConnectionId, Slot { conn, leases, held }>
//!         │     ├── creating / next_endpoint / closed
//!         ├── notify: Notify
//!         └── maintenance task (Weak<PoolShared>)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rkv_common::{AppError, Reply, Request};

use crate::connection::{ConnectionId, ConnectionOwner, RpcConnection};
use crate::error::{ClientError, ClientResult, ConnectionFailure};
use crate::metrics::PoolObserver;
use crate::transport::{Connector, Endpoint};

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Backend servers; new connections rotate through them.
    pub endpoints: Vec<Endpoint>,
    /// Population floor kept warm by the pool.
    pub min_connections: usize,
    /// Hard population cap, counting connections being created.
    pub max_connections: usize,
    /// Concurrent leases allowed per connection.
    pub max_in_flight: usize,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    /// Per-request deadline; expiry fails the whole connection.
    pub request_timeout: Duration,
    pub maintenance_interval: Duration,
    /// Upper bound on a single wait between acquire attempts.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            endpoints: vec![Endpoint::new("127.0.0.1", 9090)],
            min_connections: 10,
            max_connections: 50,
            max_in_flight: 10,
            acquire_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> ClientResult<()> {
        if self.endpoints.is_empty() {
            return Err(ClientError::config("at least one server is required"));
        }
        if self.max_connections == 0 {
            return Err(ClientError::config("max_connections must be positive"));
        }
        if self.min_connections > self.max_connections {
            return Err(ClientError::config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.max_in_flight == 0 {
            return Err(ClientError::config("max_in_flight must be positive"));
        }
        if self.poll_interval.is_zero() || self.maintenance_interval.is_zero() {
            return Err(ClientError::config("poll and maintenance intervals must be positive"));
        }
        Ok(())
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections in the registry.
    pub population: usize,
    /// Connections being established.
    pub creating: usize,
    /// Outstanding leases across all connections.
    pub leased: usize,
    /// Connections held exclusively.
    pub held: usize,
    pub max: usize,
}

struct Slot {
    conn: Arc<RpcConnection>,
    leases: usize,
    held: bool,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<ConnectionId, Slot>,
    creating: usize,
    next_endpoint: usize,
    closed: bool,
}

/// A connection attempt running in the background.
struct Creation {
    endpoint: Endpoint,
    task: JoinHandle<ClientResult<ConnectionId>>,
}

struct PoolShared {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    observer: Option<Arc<dyn PoolObserver>>,
    state: Mutex<PoolState>,
    notify: Notify,
    next_id: AtomicU64,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    me: Weak<PoolShared>,
}

impl PoolShared {
    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            population: state.slots.len(),
            creating: state.creating,
            leased: state.slots.values().map(|slot| slot.leases).sum(),
            held: state.slots.values().filter(|slot| slot.held).count(),
            max: self.config.max_connections,
        }
    }

    fn try_lease(self: &Arc<Self>, exclusive: bool) -> ClientResult<Option<Lease>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ClientError::PoolClosed);
        }

        let cap = self.config.max_in_flight;
        let chosen = state
            .slots
            .iter_mut()
            .filter(|(_, slot)| {
                slot.conn.is_healthy()
                    && !slot.held
                    && (if exclusive { slot.leases == 0 } else { slot.leases < cap })
            })
            .min_by_key(|(id, slot)| (slot.leases, **id));

        Ok(chosen.map(|(&id, slot)| {
            slot.leases += 1;
            slot.held = exclusive;
            Lease {
                pool: Arc::clone(self),
                conn: Arc::clone(&slot.conn),
                id,
                exclusive,
            }
        }))
    }

    /// Starts one connection attempt if the cap allows it.
    fn spawn_create(self: &Arc<Self>) -> Option<Creation> {
        let endpoint = {
            let mut state = self.state.lock();
            if state.closed || state.slots.len() + state.creating >= self.config.max_connections {
                return None;
            }
            state.creating += 1;
            let idx = state.next_endpoint % self.config.endpoints.len();
            state.next_endpoint = state.next_endpoint.wrapping_add(1);
            self.config.endpoints[idx].clone()
        };

        let shared = Arc::clone(self);
        let target = endpoint.clone();
        let task = tokio::spawn(async move { shared.create(target).await });
        Some(Creation { endpoint, task })
    }

    async fn create(self: Arc<Self>, endpoint: Endpoint) -> ClientResult<ConnectionId> {
        let connected =
            tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&endpoint)).await;
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(self.creation_failed(&endpoint, err.to_string())),
            Err(_) => return Err(self.creation_failed(&endpoint, "connect timed out".to_string())),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let owner: Weak<dyn ConnectionOwner> = self.me.clone();
        let conn = RpcConnection::open(
            id,
            endpoint.clone(),
            stream,
            self.config.request_timeout,
            owner,
        );

        let accepted = {
            let mut state = self.state.lock();
            state.creating -= 1;
            // A stream that died before registration must not enter the registry.
            let accepted = !state.closed && conn.is_healthy();
            if accepted {
                state.slots.insert(
                    id,
                    Slot {
                        conn: Arc::clone(&conn),
                        leases: 0,
                        held: false,
                    },
                );
            }
            accepted
        };
        self.notify.notify_waiters();

        if !accepted {
            conn.shutdown();
            return Err(if self.state.lock().closed {
                ClientError::PoolClosed
            } else {
                ClientError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: "connection closed during setup".to_string(),
                }
            });
        }

        info!(connection = id, endpoint = %endpoint, "connection established");
        if let Some(observer) = &self.observer {
            observer.on_connection_created(&endpoint);
        }
        Ok(id)
    }

    fn creation_failed(&self, endpoint: &Endpoint, reason: String) -> ClientError {
        self.state.lock().creating -= 1;
        self.notify.notify_waiters();
        warn!(endpoint = %endpoint, error = %reason, "failed to open connection");
        if let Some(observer) = &self.observer {
            observer.on_connect_failed(endpoint);
        }
        ClientError::Connect {
            endpoint: endpoint.to_string(),
            reason,
        }
    }

    /// Creates connections in the background until the floor is met.
    fn top_up(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        loop {
            {
                let state = self.state.lock();
                if state.closed || state.slots.len() + state.creating >= self.config.min_connections {
                    break;
                }
            }
            if self.spawn_create().is_none() {
                break;
            }
        }
    }

    fn release(&self, id: ConnectionId, exclusive: bool) {
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.slots.get_mut(&id) {
                slot.leases = slot.leases.saturating_sub(1);
                if exclusive {
                    slot.held = false;
                }
            }
        }
        self.notify.notify_waiters();
    }

    fn close(&self) {
        let slots: Vec<Slot> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.slots.drain().map(|(_, slot)| slot).collect()
        };

        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
        info!(connections = slots.len(), "closing connection pool");
        for slot in &slots {
            slot.conn.shutdown();
        }
        self.notify.notify_waiters();
    }
}

impl ConnectionOwner for PoolShared {
    fn evict(&self, id: ConnectionId, failure: &ConnectionFailure) {
        let removed = self.state.lock().slots.remove(&id);
        let Some(slot) = removed else {
            return;
        };

        warn!(
            connection = id,
            endpoint = %slot.conn.endpoint(),
            leases = slot.leases,
            error = %failure,
            "evicting connection"
        );
        if let Some(observer) = &self.observer {
            observer.on_eviction(slot.conn.endpoint(), failure);
        }
        self.notify.notify_waiters();

        if let Some(shared) = self.me.upgrade() {
            shared.top_up();
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance.get_mut().take() {
            task.abort();
        }
    }
}

async fn maintenance_loop(pool: Weak<PoolShared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = pool.upgrade() else {
            break;
        };
        if shared.state.lock().closed {
            break;
        }

        shared.top_up();
        let stats = shared.stats();
        debug!(
            population = stats.population,
            creating = stats.creating,
            leased = stats.leased,
            held = stats.held,
            "pool maintenance"
        );
        if let Some(observer) = &shared.observer {
            observer.on_stats(&stats);
        }
    }
}

async fn wait_creation(
    creation: &mut Option<Creation>,
) -> Result<ClientResult<ConnectionId>, JoinError> {
    match creation {
        Some(attempt) => (&mut attempt.task).await,
        None => std::future::pending().await,
    }
}

/// Shared handle to a connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Creates a pool and starts filling it to `min_connections`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> ClientResult<Self> {
        Self::with_observer(config, connector, None)
    }

    /// Creates a pool that reports events to `observer`.
    pub fn with_observer(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        observer: Option<Arc<dyn PoolObserver>>,
    ) -> ClientResult<Self> {
        config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|_| ClientError::config("connection pool requires a Tokio runtime"))?;

        let period = config.maintenance_interval;
        let shared = Arc::new_cyclic(|me| PoolShared {
            config,
            connector,
            observer,
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            maintenance: Mutex::new(None),
            me: me.clone(),
        });

        info!(
            endpoints = shared.config.endpoints.len(),
            min = shared.config.min_connections,
            max = shared.config.max_connections,
            "connection pool started"
        );
        shared.top_up();
        let task = tokio::spawn(maintenance_loop(Arc::downgrade(&shared), period));
        *shared.maintenance.lock() = Some(task);

        Ok(ConnectionPool { shared })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Leases a shared connection within the configured acquire timeout.
    pub async fn acquire(&self) -> ClientResult<Lease> {
        self.acquire_with(self.shared.config.acquire_timeout, false).await
    }

    pub async fn acquire_timeout(&self, timeout: Duration) -> ClientResult<Lease> {
        self.acquire_with(timeout, false).await
    }

    /// Leases an idle connection that no other caller may use until released.
    pub async fn acquire_exclusive(&self) -> ClientResult<Lease> {
        self.acquire_with(self.shared.config.acquire_timeout, true).await
    }

    pub async fn acquire_exclusive_timeout(&self, timeout: Duration) -> ClientResult<Lease> {
        self.acquire_with(timeout, true).await
    }

    async fn acquire_with(&self, timeout: Duration, exclusive: bool) -> ClientResult<Lease> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = started + timeout;
        let mut creation: Option<Creation> = None;

        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = shared.try_lease(exclusive)? {
                if let Some(observer) = &shared.observer {
                    observer.on_acquire(started.elapsed());
                }
                return Ok(lease);
            }

            if creation.is_none() {
                creation = shared.spawn_create();
            }

            let now = Instant::now();
            if now >= deadline {
                let stats = shared.stats();
                debug!(
                    population = stats.population,
                    creating = stats.creating,
                    max = stats.max,
                    exclusive,
                    "acquire timed out"
                );
                if let Some(observer) = &shared.observer {
                    observer.on_acquire_timeout();
                }
                return Err(ClientError::ResourceTimeout {
                    population: stats.population + stats.creating,
                    max: stats.max,
                });
            }
            let wait = shared.config.poll_interval.min(deadline - now);

            let created = tokio::select! {
                _ = &mut notified => None,
                _ = tokio::time::sleep(wait) => None,
                joined = wait_creation(&mut creation) => Some(joined),
            };

            if let Some(joined) = created {
                let attempt = creation.take();
                match joined {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(err) => {
                        return Err(ClientError::Connect {
                            endpoint: attempt
                                .map(|attempt| attempt.endpoint.to_string())
                                .unwrap_or_default(),
                            reason: err.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Returns a lease early; equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Shuts every connection down; later acquires fail with `PoolClosed`.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

/// Leased use of one pooled connection; released on drop.
pub struct Lease {
    pool: Arc<PoolShared>,
    conn: Arc<RpcConnection>,
    id: ConnectionId,
    exclusive: bool,
}

impl Lease {
    pub fn connection(&self) -> &Arc<RpcConnection> {
        &self.conn
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Issues one request on the leased connection.
    ///
    /// Backend errors come back as `ClientError::Application`.
    pub async fn call(&self, request: Request) -> ClientResult<Reply> {
        let response = self.conn.call(request).await?;
        Result::<Reply, AppError>::from(response).map_err(ClientError::from)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(self.id, self.exclusive);
    }
}
