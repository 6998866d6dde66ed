//! Per-address connection pooling.
//!
//! The pool keeps a bounded number of connections per destination address.
//! A caller borrows one with [`ConnectionPool::acquire`] for the duration of
//! a single call and hands it back through [`PooledConnection::release`].
//! Idle connections older than the configured time-to-live are evicted when
//! the next caller looks at them and by a periodic sweep.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod lease;

pub use error::{Error, Result};
pub use lease::PooledConnection;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use waypoint_bootable::{BackgroundTask, Bootable, BootableError, DEFAULT_STOP_GRACE};
use waypoint_transport::{Connection, Transport, TransportError};

/// Configuration for connection pooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum connections in use per address.
    pub size: usize,
    /// Idle time after which a connection is no longer reused.
    pub ttl: Duration,
    /// How often the background sweep evicts expired idle connections.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 100,
            ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

pub(crate) struct Idle {
    conn: Box<dyn Connection>,
    last_used: Instant,
}

/// Connections for one destination address.
pub(crate) struct AddressPool {
    idle: Mutex<Vec<Idle>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl AddressPool {
    fn new(size: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    fn in_use(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.size.saturating_sub(self.permits.available_permits())
    }

    /// Pop the most recently used live connection, discarding stale ones.
    fn take_idle(&self, ttl: Duration) -> Option<Box<dyn Connection>> {
        let mut idle = self.idle.lock();

        while let Some(entry) = idle.pop() {
            if entry.last_used.elapsed() < ttl && !entry.conn.is_closed() {
                return Some(entry.conn);
            }
            trace!("Evicting stale connection to {}", entry.conn.remote());
            discard(entry.conn);
        }

        None
    }

    /// Drop every idle connection that has expired. Returns how many went.
    fn evict_expired(&self, ttl: Duration) -> usize {
        let expired: Vec<Idle> = {
            let mut idle = self.idle.lock();
            let (keep, expired): (Vec<Idle>, Vec<Idle>) = idle
                .drain(..)
                .partition(|entry| entry.last_used.elapsed() < ttl && !entry.conn.is_closed());
            *idle = keep;
            expired
        };

        let count = expired.len();
        for entry in expired {
            discard(entry.conn);
        }
        count
    }

    fn close(&self) {
        self.permits.close();
        let drained: Vec<Idle> = self.idle.lock().drain(..).collect();
        for entry in drained {
            discard(entry.conn);
        }
    }
}

/// Close a connection in the background, or just drop it outside a runtime.
pub(crate) fn discard(conn: Box<dyn Connection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = conn.close().await;
            });
        }
        Err(_) => drop(conn),
    }
}

struct PoolInner<T> {
    transport: T,
    config: PoolConfig,
    addresses: DashMap<String, Arc<AddressPool>>,
    closed: AtomicBool,
    sweeper: BackgroundTask,
}

/// Bounded, per-address pool of transport connections.
pub struct ConnectionPool<T>
where
    T: Transport,
{
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ConnectionPool<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ConnectionPool<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("addresses", &self.inner.addresses.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> ConnectionPool<T>
where
    T: Transport,
{
    /// Create a pool that dials through `transport`.
    pub fn new(transport: T, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                transport,
                config,
                addresses: DashMap::new(),
                closed: AtomicBool::new(false),
                sweeper: BackgroundTask::new("connection pool sweeper"),
            }),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether the pool has been shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn slot(&self, address: &str) -> Arc<AddressPool> {
        if let Some(slot) = self.inner.addresses.get(address) {
            return slot.clone();
        }
        self.inner
            .addresses
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(AddressPool::new(self.inner.config.size.max(1))))
            .clone()
    }

    /// Borrow a connection to `address`.
    ///
    /// Reuses a live idle connection when one exists and otherwise dials a
    /// new one. When every connection for the address is in use the caller
    /// waits for one to be released, for at most `dial_timeout` in total.
    ///
    /// # Errors
    ///
    /// - [`Error::Exhausted`] if no connection freed up in time
    /// - [`Error::Dial`] if establishing a new connection failed
    /// - [`Error::Closed`] after shutdown
    pub async fn acquire(
        &self,
        address: &str,
        dial_timeout: Duration,
    ) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let started = Instant::now();
        let slot = self.slot(address);

        let permit = tokio::time::timeout(dial_timeout, slot.permits.clone().acquire_owned())
            .await
            .map_err(|_| Error::Exhausted {
                address: address.to_string(),
                waited: dial_timeout,
            })?
            .map_err(|_| Error::Closed)?;

        if let Some(conn) = slot.take_idle(self.inner.config.ttl) {
            trace!("Reusing idle connection to {}", address);
            return Ok(PooledConnection::new(
                conn,
                address.to_string(),
                true,
                slot,
                permit,
            ));
        }

        let remaining = dial_timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(Error::Dial {
                address: address.to_string(),
                source: TransportError::Timeout(dial_timeout),
            });
        }

        let conn = self
            .inner
            .transport
            .dial(address, remaining)
            .await
            .map_err(|source| Error::Dial {
                address: address.to_string(),
                source,
            })?;

        debug!("Dialed new connection to {}", address);

        Ok(PooledConnection::new(
            conn,
            address.to_string(),
            false,
            slot,
            permit,
        ))
    }

    /// Connections to `address` currently lent out.
    pub fn in_use(&self, address: &str) -> usize {
        self.inner
            .addresses
            .get(address)
            .map_or(0, |slot| slot.in_use())
    }

    /// Idle connections to `address` waiting for reuse.
    pub fn idle(&self, address: &str) -> usize {
        self.inner
            .addresses
            .get(address)
            .map_or(0, |slot| slot.idle.lock().len())
    }

    /// Evict expired idle connections for every address.
    pub fn sweep(&self) -> usize {
        let ttl = self.inner.config.ttl;
        let slots: Vec<Arc<AddressPool>> = self
            .inner
            .addresses
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let evicted = slots.iter().map(|slot| slot.evict_expired(ttl)).sum();
        drop(slots);
        if evicted > 0 {
            debug!("Swept {} expired idle connections", evicted);
        }

        // A slot referenced only by the map has no lease out and no caller
        // waiting on it; the shard lock keeps new callers out while it goes.
        self.inner
            .addresses
            .retain(|_, slot| Arc::strong_count(slot) > 1 || !slot.idle.lock().is_empty());

        evicted
    }

    /// Addresses with a live slot.
    pub fn addresses(&self) -> usize {
        self.inner.addresses.len()
    }

    /// Close all idle connections and refuse further acquires.
    ///
    /// Connections currently lent out are closed when they are released.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for entry in &self.inner.addresses {
            entry.value().close();
        }
        info!("Connection pool closed");
    }
}

#[async_trait]
impl<T> Bootable for ConnectionPool<T>
where
    T: Transport,
{
    fn bootable_name(&self) -> &str {
        "connection-pool"
    }

    async fn start(&self) -> std::result::Result<(), BootableError> {
        if self.is_closed() {
            return Err(Box::new(Error::Closed));
        }

        let pool = self.clone();
        let interval = self.inner.config.sweep_interval;

        self.inner.sweeper.spawn(move |token| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep();
                    }
                }
            }
        });

        Ok(())
    }

    async fn shutdown(&self) -> std::result::Result<(), BootableError> {
        self.inner.sweeper.stop(DEFAULT_STOP_GRACE).await;
        self.close();
        Ok(())
    }

    async fn wait(&self) {
        self.inner.sweeper.wait().await;
    }
}
