//! Bounded connection pool.
//!
//! A semaphore of `max_connections` permits bounds how many handles exist at
//! once. Connection bookkeeping (the idle list, counters) sits behind short
//! `std::sync::Mutex` sections; engine calls run on the blocking thread pool
//! outside any lock.
//!
//! A [`ConnectionHandle`] owns its permit and its connection and gives both
//! back in `Drop`, so every exit path releases exactly once. While a query
//! runs the permit moves onto the blocking thread with the connection, so a
//! caller that gives up early never frees a slot the engine is still using.

use crate::breaker::CircuitBreaker;
use crate::engine::{ConnectionFactory, EngineConnection, InterruptFn, QueryRows};
use crate::error::{BackendError, BreakerError, PoolError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// `[pool]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    /// 0 disables the background health check.
    pub health_check_interval_ms: u64,
    /// Idle connections above `min_connections` are retired after this long. 0 disables.
    pub idle_timeout_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            acquire_timeout_ms: 1_000,
            health_check_interval_ms: 30_000,
            idle_timeout_ms: 300_000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Active,
    /// Taken out of rotation by the health check or shutdown.
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    pub id: u64,
    pub state: ConnectionState,
    pub created_at: Instant,
    pub last_used_at: Instant,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub waiters: usize,
    pub max: usize,
    pub closed: bool,
}

struct PooledConnection {
    meta: ConnectionMeta,
    conn: Box<dyn EngineConnection>,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    breaker: Option<Arc<CircuitBreaker>>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConnection>>,
    in_flight: Mutex<HashMap<u64, InterruptFn>>,
    next_id: AtomicU64,
    total: AtomicUsize,
    active: AtomicUsize,
    waiters: AtomicUsize,
    closed: AtomicBool,
    released: Notify,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("engine", &self.inner.factory.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Create the pool, open `min_connections` eagerly and start the health check.
    pub async fn start(
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            idle: Mutex::new(VecDeque::with_capacity(config.max_connections)),
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            total: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            released: Notify::new(),
            health_task: Mutex::new(None),
            factory,
            breaker,
            config,
        });

        for _ in 0..inner.config.min_connections {
            let conn = inner.open_connection().await?;
            inner.push_idle(conn);
        }

        if inner.config.health_check_interval_ms > 0 {
            let period = Duration::from_millis(inner.config.health_check_interval_ms);
            let task = spawn_health_check(Arc::downgrade(&inner), period);
            *lock(&inner.health_task) = Some(task);
        }

        info!(
            engine = inner.factory.name(),
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            "Connection pool started"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Wait up to `timeout` for a slot.
    ///
    /// A zero timeout never waits: it fails with [`PoolError::Exhausted`]
    /// when every slot is taken.
    pub async fn acquire(&self, timeout: Duration) -> Result<ConnectionHandle, PoolError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(PoolError::Closed);
        }

        let permit = if timeout.is_zero() {
            inner
                .permits
                .clone()
                .try_acquire_owned()
                .map_err(|e| match e {
                    TryAcquireError::Closed => PoolError::Closed,
                    TryAcquireError::NoPermits => PoolError::Exhausted,
                })?
        } else {
            let _waiting = WaiterGuard::new(&inner.waiters);
            match tokio::time::timeout(timeout, inner.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    debug!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for a connection");
                    return Err(PoolError::Timeout(timeout));
                }
            }
        };

        let mut pooled = match inner.pop_idle() {
            Some(pooled) => pooled,
            None => inner.open_connection().await?,
        };
        pooled.meta.state = ConnectionState::Active;
        pooled.meta.last_used_at = Instant::now();
        inner.active.fetch_add(1, Ordering::SeqCst);

        Ok(ConnectionHandle {
            id: pooled.meta.id,
            pool: inner.clone(),
            conn: Some(pooled),
            permit: Some(permit),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            total: inner.total.load(Ordering::SeqCst),
            idle: lock(&inner.idle).len(),
            active: inner.active.load(Ordering::SeqCst),
            waiters: inner.waiters.load(Ordering::SeqCst),
            max: inner.config.max_connections,
            closed: inner.is_closed(),
        }
    }

    /// Run one health-check pass now.
    pub async fn health_check(&self) {
        self.inner.run_health_check().await;
    }

    /// Stop accepting acquires, wait up to `drain_timeout` for handles to come
    /// back, then interrupt whatever is still running and close everything.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.permits.close();
        if let Some(task) = lock(&inner.health_task).take() {
            task.abort();
        }
        info!(
            active = inner.active.load(Ordering::SeqCst),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Shutting down connection pool"
        );

        let deadline = Instant::now() + drain_timeout;
        loop {
            let released = inner.released.notified();
            if inner.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                break;
            }
        }

        let remaining = inner.active.load(Ordering::SeqCst);
        if remaining > 0 {
            let interrupts: Vec<InterruptFn> = lock(&inner.in_flight).values().cloned().collect();
            warn!(
                remaining,
                interrupted = interrupts.len(),
                "Drain timeout elapsed, interrupting in-flight queries"
            );
            for interrupt in interrupts {
                interrupt();
            }
        }

        let idle: Vec<PooledConnection> = lock(&inner.idle).drain(..).collect();
        for pooled in idle {
            inner.destroy(pooled, "shutdown");
        }
        info!("Connection pool shut down");
    }
}

/// Exclusive use of one pooled connection. Released on drop.
pub struct ConnectionHandle {
    id: u64,
    pool: Arc<PoolInner>,
    conn: Option<PooledConnection>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("meta", &self.meta())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `None` once the connection has been discarded.
    pub fn meta(&self) -> Option<ConnectionMeta> {
        self.conn.as_ref().map(|pooled| pooled.meta)
    }

    /// Run `sql` on the blocking pool, bounded by `deadline`.
    ///
    /// Past the deadline the engine call is interrupted and the connection is
    /// discarded; the handle then holds no connection. Its slot is released
    /// when the abandoned engine call actually returns, not when the handle
    /// is dropped.
    pub async fn execute(&mut self, sql: &str, deadline: Duration) -> Result<QueryRows, PoolError> {
        let mut pooled = self.conn.take().ok_or(PoolError::Discarded)?;
        let id = pooled.meta.id;
        let mut in_flight = InFlight::register(self.pool.clone(), id, pooled.conn.interrupter());

        // The permit rides along with the engine call: an abandoned call that
        // ignores its interrupt keeps the slot until the engine returns.
        let permit = self.permit.take();
        let sql = sql.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let result = pooled.conn.query(&sql);
            (pooled, permit, result)
        });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok((mut pooled, permit, result))) => {
                in_flight.settle();
                pooled.meta.last_used_at = Instant::now();
                self.conn = Some(pooled);
                self.permit = permit;
                result.map_err(PoolError::Execution)
            }
            Ok(Err(join_error)) => {
                error!(connection_id = id, "Engine call failed to complete: {}", join_error);
                Err(PoolError::Execution(BackendError::Database(
                    "engine call aborted".to_string(),
                )))
            }
            Err(_) => {
                warn!(
                    connection_id = id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Query exceeded deadline, interrupting and discarding connection"
                );
                Err(PoolError::DeadlineExceeded(deadline))
            }
        }
    }

    /// Give the connection back now. Same as dropping the handle.
    pub fn release(self) {}
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(mut pooled) = self.conn.take() {
            pooled.meta.last_used_at = Instant::now();
            self.pool.check_in(pooled);
        }
        self.pool.active.fetch_sub(1, Ordering::SeqCst);
        drop(self.permit.take());
        self.pool.released.notify_waiters();
    }
}

/// Tracks a query running on a blocking thread.
///
/// Unless settled, dropping it (deadline, panic, or the caller's future being
/// dropped) interrupts the query and writes the connection off.
struct InFlight {
    pool: Arc<PoolInner>,
    id: u64,
    interrupter: Option<InterruptFn>,
    settled: bool,
}

impl InFlight {
    fn register(pool: Arc<PoolInner>, id: u64, interrupter: Option<InterruptFn>) -> Self {
        if let Some(interrupt) = &interrupter {
            lock(&pool.in_flight).insert(id, interrupt.clone());
        }
        Self {
            pool,
            id,
            interrupter,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.pool.in_flight).remove(&self.id);
        if !self.settled {
            if let Some(interrupt) = &self.interrupter {
                interrupt();
            }
            self.pool.total.fetch_sub(1, Ordering::SeqCst);
            debug!(connection_id = self.id, "Connection abandoned mid-query");
        }
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn open_connection(&self) -> Result<PooledConnection, PoolError> {
        let factory = self.factory.clone();
        let connect = || async move {
            tokio::task::spawn_blocking(move || factory.connect())
                .await
                .map_err(|e| BackendError::Database(format!("connect task failed: {}", e)))?
        };

        let conn = match &self.breaker {
            Some(breaker) => breaker.call(connect).await.map_err(|e| match e {
                BreakerError::Open => PoolError::CircuitOpen,
                BreakerError::Inner(e) => PoolError::Connect(e),
            })?,
            None => connect().await.map_err(PoolError::Connect)?,
        };

        let now = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(connection_id = id, total, "Opened engine connection");

        Ok(PooledConnection {
            meta: ConnectionMeta {
                id,
                state: ConnectionState::Idle,
                created_at: now,
                last_used_at: now,
            },
            conn,
        })
    }

    fn push_idle(&self, mut pooled: PooledConnection) {
        pooled.meta.state = ConnectionState::Idle;
        lock(&self.idle).push_back(pooled);
    }

    /// Most recently used first, so surplus connections age out.
    fn pop_idle(&self) -> Option<PooledConnection> {
        lock(&self.idle).pop_back()
    }

    fn check_in(&self, pooled: PooledConnection) {
        if self.is_closed() {
            self.destroy(pooled, "pool closed");
        } else {
            self.push_idle(pooled);
        }
    }

    fn destroy(&self, mut pooled: PooledConnection, reason: &str) {
        pooled.meta.state = ConnectionState::Closed;
        self.total.fetch_sub(1, Ordering::SeqCst);
        debug!(connection_id = pooled.meta.id, reason, "Closed engine connection");
    }

    async fn run_health_check(&self) {
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let candidates = lock(&self.idle).len();
        let mut failed = 0usize;
        let mut retired = 0usize;

        for _ in 0..candidates {
            if self.is_closed() {
                return;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(mut pooled) = lock(&self.idle).pop_front() else {
                break;
            };
            pooled.meta.state = ConnectionState::Draining;

            let expired = self.config.idle_timeout_ms > 0
                && self.total.load(Ordering::SeqCst) > self.config.min_connections
                && pooled.meta.last_used_at.elapsed() >= idle_timeout;
            if expired {
                self.destroy(pooled, "idle timeout");
                retired += 1;
                drop(permit);
                continue;
            }

            let pinged = tokio::task::spawn_blocking(move || {
                let result = pooled.conn.ping();
                (pooled, result)
            })
            .await;
            match pinged {
                Ok((pooled, Ok(()))) => self.check_in(pooled),
                Ok((pooled, Err(e))) => {
                    warn!(connection_id = pooled.meta.id, error = %e, "Health ping failed");
                    self.destroy(pooled, "health ping failed");
                    failed += 1;
                }
                Err(e) => {
                    warn!("Health ping task failed: {}", e);
                    self.total.fetch_sub(1, Ordering::SeqCst);
                    failed += 1;
                }
            }
            drop(permit);
        }

        let mut opened = 0usize;
        while !self.is_closed() && self.total.load(Ordering::SeqCst) < self.config.min_connections {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            match self.open_connection().await {
                Ok(pooled) => {
                    self.push_idle(pooled);
                    opened += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Could not replace pooled connection");
                    break;
                }
            }
            drop(permit);
        }

        if failed + retired + opened > 0 {
            info!(failed, retired, opened, "Pool health check");
        } else {
            debug!(checked = candidates, "Pool health check");
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let task = self
            .health_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

fn spawn_health_check(pool: Weak<PoolInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if pool.is_closed() {
                break;
            }
            pool.run_health_check().await;
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
