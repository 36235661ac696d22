//! Asynchronous connection pool.
//!
//! The pool never holds more than `max` live connections. A semaphore with
//! `max` permits gates checkouts: every checked-out connection holds a permit,
//! and new connections are only opened by a permit holder that found no idle
//! one. Tokio's semaphore is fair, so waiters are served first come, first
//! served.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::opts::{Opts, PoolConfig};
use crate::row::QueryResult;
use crate::sync::PgConnector;
use crate::transport::Connect;
use crate::value::Value;

use super::Connection;

struct IdleConn {
    conn: Connection,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Oldest at the front.
    idle: VecDeque<IdleConn>,
    /// Every open connection, idle or checked out.
    live: HashMap<u64, Connection>,
    /// Connections still in their handshake.
    opening: HashMap<u64, Connection>,
}

struct PoolInner {
    opts: Opts,
    config: PoolConfig,
    connector: Arc<dyn Connect>,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

/// Counts reported by [`Pool::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
    pub closed: bool,
}

/// A bounded set of [`Connection`]s to one database.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("host", &self.inner.opts.host)
            .field("status", &self.status())
            .finish()
    }
}

impl Pool {
    /// Create a pool from a connection string or [`Opts`], using the pool
    /// settings they carry.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let config = opts.pool.clone();
        Self::with_config(opts, config)
    }

    /// Create a pool with explicit pool settings.
    pub fn with_config(opts: Opts, config: PoolConfig) -> Result<Self> {
        Self::with_connector(opts, config, Arc::new(PgConnector))
    }

    /// Create a pool whose connections are opened by `connector`.
    pub fn with_connector(
        opts: Opts,
        config: PoolConfig,
        connector: Arc<dyn Connect>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::InvalidUsage("Pool must be created inside a tokio runtime".into()))?;

        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max)),
            opts,
            config,
            connector,
            state: Mutex::new(PoolState::default()),
            closed: AtomicBool::new(false),
        });
        tracing::info!(
            min = inner.config.min,
            max = inner.config.max,
            host = %inner.opts.host,
            "pool created"
        );

        runtime.spawn(reap(Arc::downgrade(&inner)));
        Ok(Self { inner })
    }

    /// Check out a connection.
    ///
    /// Hands out an idle connection if there is one, opens a new one while
    /// fewer than `max` exist, and otherwise waits in line. Fails with
    /// [`Error::PoolTimeout`] if no connection is ready within
    /// `connection_timeout`, a new one's handshake included, and with
    /// [`Error::PoolClosed`] once the pool has ended.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::PoolClosed);
        }

        let limit = inner.config.connection_timeout;
        let deadline = Instant::now() + limit;
        let permit =
            match tokio::time::timeout_at(deadline, Arc::clone(&inner.semaphore).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Error::PoolClosed),
                Err(_) => {
                    tracing::debug!(?limit, "timed out waiting for a pooled connection");
                    return Err(Error::PoolTimeout(limit));
                }
            };
        if inner.is_closed() {
            return Err(Error::PoolClosed);
        }

        while let Some(conn) = inner.pop_idle() {
            if conn.is_closed() || conn.is_broken() {
                inner.discard(&conn);
                continue;
            }
            let healthy = if inner.config.test_before_acquire {
                conn.ping().await
            } else {
                Ok(())
            };
            if let Err(e) = healthy {
                tracing::debug!(id = conn.id(), error = %e, "idle connection failed health check");
                inner.discard(&conn);
                continue;
            }
            return Ok(PooledConnection::new(conn, permit, Arc::clone(inner)));
        }

        let conn = inner.open(deadline).await?;
        Ok(PooledConnection::new(conn, permit, Arc::clone(inner)))
    }

    /// Run one query on a pooled connection and give the connection back.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let conn = self.acquire().await?;
        conn.query(sql, params).await
    }

    /// Run a pipeline on a pooled connection and give the connection back.
    pub async fn pipeline<S: AsRef<str>>(&self, queries: &[S]) -> Result<Vec<QueryResult>> {
        let conn = self.acquire().await?;
        conn.pipeline(queries).await
    }

    /// Shut the pool down.
    ///
    /// Waiting and future `acquire` calls fail with [`Error::PoolClosed`].
    /// Idle connections and connections still in their handshake are closed
    /// now; checked-out ones once the operations already queued on them have
    /// settled.
    pub async fn end(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.semaphore.close();

        let (idle, checked_out, opening) = {
            let mut state = inner.state();
            let idle: Vec<Connection> = state.idle.drain(..).map(|i| i.conn).collect();
            for conn in &idle {
                state.live.remove(&conn.id());
            }
            let checked_out: Vec<Connection> = state.live.drain().map(|(_, c)| c).collect();
            let opening: Vec<Connection> = state.opening.drain().map(|(_, c)| c).collect();
            (idle, checked_out, opening)
        };
        tracing::info!(
            idle = idle.len(),
            checked_out = checked_out.len(),
            opening = opening.len(),
            "pool ended"
        );

        for conn in &opening {
            conn.close_now();
        }
        for conn in &checked_out {
            conn.close_gracefully();
        }
        for conn in idle {
            conn.close().await;
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.live.len().saturating_sub(state.idle.len()),
            max: self.inner.config.max,
            closed: self.inner.is_closed(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Most recently used idle connection.
    fn pop_idle(&self) -> Option<Connection> {
        self.state().idle.pop_back().map(|i| i.conn)
    }

    fn discard(&self, conn: &Connection) {
        self.state().live.remove(&conn.id());
        conn.close_now();
        tracing::debug!(id = conn.id(), "discarded pooled connection");
    }

    /// Open a connection, giving up at `deadline`.
    async fn open(&self, deadline: Instant) -> Result<Connection> {
        let conn = Connection::with_connector(self.opts.clone(), Arc::clone(&self.connector))?;
        self.state().opening.insert(conn.id(), conn.clone());
        // `end` may have drained `opening` before the insert
        if self.is_closed() {
            self.state().opening.remove(&conn.id());
            conn.close_now();
            return Err(Error::PoolClosed);
        }

        let opened = match tokio::time::timeout_at(deadline, conn.open()).await {
            Ok(result) => result,
            Err(_) => {
                let limit = self.config.connection_timeout;
                tracing::debug!(id = conn.id(), ?limit, "timed out opening pooled connection");
                Err(Error::PoolTimeout(limit))
            }
        };
        self.state().opening.remove(&conn.id());
        if let Err(e) = opened {
            conn.close_now();
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }
            tracing::debug!(error = %e, "failed to open pooled connection");
            return Err(e);
        }

        self.state().live.insert(conn.id(), conn.clone());
        if self.is_closed() {
            self.discard(&conn);
            return Err(Error::PoolClosed);
        }
        tracing::debug!(id = conn.id(), "opened pooled connection");
        Ok(conn)
    }

    /// Take a connection back from a caller.
    fn check_in(&self, conn: Connection) {
        if self.is_closed() || conn.is_closed() || conn.is_broken() {
            self.discard(&conn);
            return;
        }
        if conn.has_subscriptions() {
            conn.unlisten_all();
        }
        self.state().idle.push_back(IdleConn {
            conn,
            since: Instant::now(),
        });
    }

    /// Close idle connections past `idle_timeout` while more than `min` are idle.
    fn evict_stale(&self) {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut state = self.state();
            while state.idle.len() > self.config.min {
                let stale = state
                    .idle
                    .front()
                    .is_some_and(|i| now.duration_since(i.since) >= self.config.idle_timeout);
                if !stale {
                    break;
                }
                if let Some(idle) = state.idle.pop_front() {
                    state.live.remove(&idle.conn.id());
                    evicted.push(idle.conn);
                }
            }
        }
        for conn in evicted {
            tracing::debug!(id = conn.id(), "closing idle connection");
            conn.close_now();
        }
    }

    /// Open connections until `min` exist.
    async fn replenish(&self) {
        loop {
            if self.is_closed() || self.state().live.len() >= self.config.min {
                return;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                return;
            };
            match self.open(Instant::now() + self.config.connection_timeout).await {
                Ok(conn) => self.check_in(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open connection for pool minimum");
                    return;
                }
            }
            drop(permit);
        }
    }
}

/// Background upkeep: warm up to `min`, then periodically evict stale idle
/// connections and top back up. Ends with the pool.
async fn reap(pool: Weak<PoolInner>) {
    let period = match pool.upgrade() {
        Some(inner) => {
            inner.replenish().await;
            inner.config.effective_reap_interval()
        }
        None => return,
    };

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if inner.is_closed() {
            return;
        }
        inner.evict_stale();
        inner.replenish().await;
    }
}

/// A connection checked out of a [`Pool`].
///
/// Dereferences to [`Connection`]. Dropping it returns the connection to the
/// pool; broken and closed connections are discarded instead, and channel
/// subscriptions are dropped. Do not keep clones of the inner connection past
/// the checkout.
pub struct PooledConnection {
    conn: Connection,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(conn: Connection, permit: OwnedSemaphorePermit, pool: Arc<PoolInner>) -> Self {
        Self {
            conn,
            permit: Some(permit),
            pool,
        }
    }

    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // back in the idle set before the permit wakes the next waiter
        self.pool.check_in(self.conn.clone());
        drop(self.permit.take());
    }
}
