//! Bounded, self-healing pool of broker connections.
//!
//! Idle connections sit in a bounded flume queue; the queue itself is the
//! only synchronisation between borrowers. Checked-out connections are
//! wrapped in a [`PooledConnection`] guard that hands them back on every exit
//! path, including drop on cancellation.

use crate::transport::{Connection, Transport, TransportError};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("no connection available: {0}")]
    NoConnectionAvailable(TransportError),
    #[error("pool closed")]
    Closed,
}

/// Point-in-time view of the pool counters.
///
/// `available + lent_out <= capacity + replacements` holds at every instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub capacity: usize,
    pub available: usize,
    pub lent_out: usize,
    /// Connections opened after initialization: replacements for dead ones
    /// and on-demand extras when the pool was exhausted.
    pub replacements: usize,
}

struct PoolInner {
    transport: Arc<dyn Transport>,
    capacity: usize,
    idle_tx: flume::Sender<Box<dyn Connection>>,
    idle_rx: flume::Receiver<Box<dyn Connection>>,
    lent_out: AtomicUsize,
    replacements: AtomicUsize,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Opens up to `capacity` connections. Connections that fail to open are
    /// logged and skipped, so the pool may start degraded.
    pub async fn initialize(transport: Arc<dyn Transport>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (idle_tx, idle_rx) = flume::bounded(capacity);
        let pool = Self {
            inner: Arc::new(PoolInner {
                transport,
                capacity,
                idle_tx,
                idle_rx,
                lent_out: AtomicUsize::new(0),
                replacements: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        };
        info!(
            capacity,
            endpoint = %pool.inner.transport.endpoint(),
            "Initializing connection pool"
        );
        for attempt in 1..=capacity {
            match pool.inner.transport.connect().await {
                Ok(conn) => pool.inner.offer(conn).await,
                Err(e) => warn!(error = %e, attempt, capacity, "Failed to open pooled connection"),
            }
        }
        info!(
            live = pool.inner.idle_rx.len(),
            capacity, "Connection pool ready"
        );
        pool
    }

    /// Borrows a connection, waiting up to `timeout` for an idle one.
    ///
    /// A closed connection found in the queue is replaced before returning.
    /// If the wait times out a single extra connection is opened instead;
    /// only when that also fails does this return `NoConnectionAvailable`.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(PoolError::Closed);
        }
        let conn = match tokio::time::timeout(timeout, inner.idle_rx.recv_async()).await {
            Ok(Ok(conn)) if conn.is_open() => conn,
            Ok(Ok(dead)) => {
                warn!(id = %dead.id(), "Closed connection found in pool, replacing");
                let _ = dead.close().await;
                inner.open_extra().await?
            }
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                if inner.is_closed() {
                    return Err(PoolError::Closed);
                }
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Connection pool exhausted, opening an extra connection"
                );
                inner.open_extra().await?
            }
        };
        inner.lent_out.fetch_add(1, Ordering::AcqRel);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::downgrade(inner),
        })
    }

    /// Returns a borrowed connection. Same as [`PooledConnection::release`].
    pub async fn release(&self, conn: PooledConnection) {
        conn.release().await
    }

    /// Closes every idle connection and stops accepting returns. Idempotent.
    pub async fn close_all(&self) {
        let inner = &self.inner;
        let first = !inner.closed.swap(true, Ordering::AcqRel);
        let mut closed = 0usize;
        while let Ok(conn) = inner.idle_rx.try_recv() {
            if let Err(e) = conn.close().await {
                debug!(error = %e, id = %conn.id(), "Error closing pooled connection");
            }
            closed += 1;
        }
        if first {
            info!(
                closed,
                lent_out = inner.lent_out.load(Ordering::Acquire),
                "Connection pool closed"
            );
        }
    }

    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        PoolStatus {
            capacity: inner.capacity,
            available: inner.idle_rx.len(),
            lent_out: inner.lent_out.load(Ordering::Acquire),
            replacements: inner.replacements.load(Ordering::Acquire),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn open_extra(&self) -> Result<Box<dyn Connection>, PoolError> {
        let conn = self
            .transport
            .connect()
            .await
            .map_err(PoolError::NoConnectionAvailable)?;
        self.replacements.fetch_add(1, Ordering::AcqRel);
        Ok(conn)
    }

    /// Queues `conn`, or closes it when the queue is already full.
    async fn offer(&self, conn: Box<dyn Connection>) {
        if let Err(e) = self.idle_tx.try_send(conn) {
            let conn = e.into_inner();
            debug!(id = %conn.id(), "Pool at capacity, closing surplus connection");
            let _ = conn.close().await;
        }
    }

    async fn give_back(&self, conn: Box<dyn Connection>) {
        self.lent_out.fetch_sub(1, Ordering::AcqRel);
        if self.is_closed() {
            let _ = conn.close().await;
            return;
        }
        if conn.is_open() {
            self.offer(conn).await;
            return;
        }
        debug!(id = %conn.id(), "Discarding closed connection on release");
        let _ = conn.close().await;
        match self.transport.connect().await {
            Ok(fresh) => {
                self.replacements.fetch_add(1, Ordering::AcqRel);
                self.offer(fresh).await;
            }
            Err(e) => warn!(error = %e, "Could not replace closed connection"),
        }
    }

    /// Synchronous return for the drop path. Hands the connection back when
    /// it is healthy and there is room, otherwise gives it back unchanged.
    fn try_give_back(&self, conn: Box<dyn Connection>) -> Option<Box<dyn Connection>> {
        if self.is_closed() || !conn.is_open() {
            return Some(conn);
        }
        self.lent_out.fetch_sub(1, Ordering::AcqRel);
        match self.idle_tx.try_send(conn) {
            Ok(()) => None,
            Err(e) => {
                // Still ours to close; re-count it so give_back balances.
                self.lent_out.fetch_add(1, Ordering::AcqRel);
                Some(e.into_inner())
            }
        }
    }
}

/// Exclusive checkout of one pooled connection.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Weak<PoolInner>,
}

impl PooledConnection {
    /// Hands the connection back, replacing it first if it died while borrowed.
    pub async fn release(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.give_back(conn).await,
            None => {
                let _ = conn.close().await;
            }
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("pooled connection is present until released")
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = self.pool.upgrade();
        let conn = match &pool {
            Some(p) => match p.try_give_back(conn) {
                None => return,
                Some(conn) => conn,
            },
            None => conn,
        };
        // Closing or replacing needs the runtime.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match pool {
                        Some(p) => p.give_back(conn).await,
                        None => {
                            let _ = conn.close().await;
                        }
                    }
                });
            }
            Err(_) => {
                if let Some(p) = pool {
                    p.lent_out.fetch_sub(1, Ordering::AcqRel);
                }
                warn!(id = %conn.id(), "No runtime to return connection on drop; discarding");
            }
        }
    }
}
