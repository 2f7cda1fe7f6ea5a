//! Bounded connection pool shared by the network backends
//!
//! `ConnectionPool::get` hands out at most `max_connections` connections at a
//! time. Callers that can't be served within `wait_timeout` get
//! [`BackendError::PoolTimeout`] instead of queueing. Returned connections are
//! kept idle (up to `max_idle_connections`) and evicted by a background sweep
//! once unused for longer than `idle_timeout`.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::backend::{BackendError, BackendResult};
use crate::config::PoolConfig;

/// Creates and disposes of pooled connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> BackendResult<Self::Connection>;

    /// Whether an idle connection may be handed out again
    fn is_alive(&self, _conn: &Self::Connection) -> bool {
        true
    }

    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max_open: usize,
    pub max_idle: usize,
    /// Number of `get` calls that had to wait for a free slot
    pub wait_count: u64,
    pub wait_duration: Duration,
    pub created: u64,
    pub closed: u64,
}

struct IdleConnection<C> {
    conn: C,
    last_used: Instant,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<F::Connection>>>,
    stats: RwLock<PoolStats>,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn discard(&self, conn: F::Connection) {
        self.factory.close(conn);
        self.stats.write().closed += 1;
    }

    fn release(&self, conn: F::Connection) {
        if self.closed.load(Ordering::Acquire) {
            self.discard(conn);
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle_connections {
            drop(idle);
            self.discard(conn);
            return;
        }
        idle.push_back(IdleConnection {
            conn,
            last_used: Instant::now(),
        });
    }

    fn evict_expired(&self) -> usize {
        let expired: Vec<_> = {
            let mut idle = self.idle.lock();
            let (keep, expired): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|c| c.last_used.elapsed() <= self.config.idle_timeout);
            *idle = keep.into();
            expired
        };

        let count = expired.len();
        for entry in expired {
            self.discard(entry.conn);
        }
        if count > 0 {
            log::debug!("evicted {} idle connections", count);
        }
        count
    }
}

/// A pool of connections produced by a [`ConnectionFactory`]
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool; the idle sweep only runs when created inside a tokio runtime
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let max_open = config.max_connections.max(1);
        let inner = Arc::new(PoolInner {
            factory,
            slots: Arc::new(Semaphore::new(max_open)),
            idle: Mutex::new(VecDeque::new()),
            stats: RwLock::new(PoolStats {
                max_open,
                max_idle: config.max_idle_connections,
                ..PoolStats::default()
            }),
            closed: AtomicBool::new(false),
            config,
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            if !inner.config.sweep_interval.is_zero() {
                handle.spawn(sweep(Arc::downgrade(&inner), inner.config.sweep_interval));
            }
        }

        Self { inner }
    }

    /// Borrow a connection, creating one when no idle connection is usable
    pub async fn get(&self) -> BackendResult<PooledConnection<F>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BackendError::PoolClosed);
        }

        let permit = match self.inner.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(BackendError::PoolClosed),
            Err(TryAcquireError::NoPermits) => self.wait_for_slot().await?,
        };

        // Claim first, then check: an entry popped here can't be evicted by the sweep
        loop {
            let candidate = self.inner.idle.lock().pop_back();
            let Some(entry) = candidate else { break };

            if entry.last_used.elapsed() > self.inner.config.idle_timeout
                || !self.inner.factory.is_alive(&entry.conn)
            {
                self.inner.discard(entry.conn);
                continue;
            }
            return Ok(PooledConnection::new(entry.conn, self.inner.clone(), permit));
        }

        let conn = self.inner.factory.connect().await?;
        self.inner.stats.write().created += 1;
        Ok(PooledConnection::new(conn, self.inner.clone(), permit))
    }

    async fn wait_for_slot(&self) -> BackendResult<OwnedSemaphorePermit> {
        let wait_timeout = self.inner.config.wait_timeout;
        let start = Instant::now();
        let result =
            tokio::time::timeout(wait_timeout, self.inner.slots.clone().acquire_owned()).await;

        {
            let mut stats = self.inner.stats.write();
            stats.wait_count += 1;
            stats.wait_duration += start.elapsed();
        }

        match result {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(BackendError::PoolClosed),
            Err(_) => Err(BackendError::PoolTimeout(wait_timeout)),
        }
    }

    /// Close idle connections older than `idle_timeout`, returning how many
    pub fn evict_expired(&self) -> usize {
        self.inner.evict_expired()
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.inner.stats.read().clone();
        stats.idle = self.inner.idle.lock().len();
        stats.active = if self.inner.closed.load(Ordering::Acquire) {
            0
        } else {
            stats.max_open - self.inner.slots.available_permits()
        };
        stats
    }

    /// Refuse further `get` calls and close all idle connections
    ///
    /// Connections still borrowed are closed when they are returned.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.slots.close();
        let idle: Vec<_> = self.inner.idle.lock().drain(..).collect();
        for entry in idle {
            self.inner.discard(entry.conn);
        }
        log::debug!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn sweep<F: ConnectionFactory>(pool: Weak<PoolInner<F>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else { break };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        inner.evict_expired();
    }
}

/// A borrowed connection; dropping it returns the connection to the pool
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    pool: Arc<PoolInner<F>>,
    // Released after `Drop::drop` has put the connection back
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(conn: F::Connection, pool: Arc<PoolInner<F>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }

    /// Close the connection instead of returning it, e.g. after a transport error
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the connection, and both consume `self`
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
