//! `r2d2` connection pool over configured SQLite connections.
//!
//! # Responsibility
//! - Reuse configured connections across repository calls and sessions.
//! - Bound concurrent connections to `pool_size`.
//! - Report checked-out connections so teardown can detect leaks.
//!
//! # Invariants
//! - `in_use() == connections - idle_connections` of the `r2d2` state.
//! - A connection still inside a transaction is rolled back before reuse.

use super::{DbError, DbResult};
use crate::context::Context;
use log::{error, warn};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `r2d2` waits are not woken by cancellation, so checkout waits in slices
/// and re-checks the context between them.
const WAIT_SLICE: Duration = Duration::from_millis(50);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to the pool; clones point at the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    id: u64,
    inner: r2d2::Pool<SqliteConnectionManager>,
    checkout_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl ConnectionPool {
    /// Builds a lazily-filled pool of at most `max_size` connections.
    ///
    /// Checkouts without a context deadline give up after
    /// `checkout_timeout`.
    pub(crate) fn new(
        manager: SqliteConnectionManager,
        max_size: usize,
        checkout_timeout: Duration,
    ) -> DbResult<Self> {
        let max_size = u32::try_from(max_size.max(1)).unwrap_or(u32::MAX);
        let inner = r2d2::Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(checkout_timeout)
            .build(manager)?;
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            inner,
            checkout_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Process-unique pool id; transaction bindings are scoped to it.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size() as usize
    }

    /// Number of connections currently checked out.
    pub fn in_use(&self) -> usize {
        let state = self.inner.state();
        state.connections.saturating_sub(state.idle_connections) as usize
    }

    /// Checks out a connection, waiting while the pool is exhausted.
    ///
    /// Waiting stops with `DbError::Context` once `ctx` is cancelled or its
    /// deadline passes, and with `DbError::Pool` after the checkout timeout.
    pub fn get(&self, ctx: &Context) -> DbResult<PooledConnection> {
        let started_at = Instant::now();
        loop {
            ctx.check()?;
            if self.closed.load(Ordering::Acquire) {
                return Err(DbError::PoolClosed);
            }

            let left = self.checkout_timeout.saturating_sub(started_at.elapsed());
            let slice = ctx
                .remaining()
                .map_or(left, |remaining| remaining.min(left))
                .min(WAIT_SLICE);
            match self.inner.get_timeout(slice) {
                Ok(conn) => return self.wrap(conn),
                Err(err) if started_at.elapsed() >= self.checkout_timeout => {
                    return Err(DbError::Pool(err));
                }
                Err(_) => continue,
            }
        }
    }

    /// Closes the pool, waiting up to `timeout` for checked-out connections.
    ///
    /// New checkouts fail with `DbError::PoolClosed`; idle connections are
    /// dropped with the last pool handle.
    pub fn close(&self, timeout: Duration) -> DbResult<()> {
        self.closed.store(true, Ordering::Release);
        let started_at = Instant::now();
        loop {
            let in_use = self.in_use();
            if in_use == 0 {
                return Ok(());
            }
            if started_at.elapsed() >= timeout {
                error!(
                    "event=pool_close module=db status=error pool_id={} in_use={} error_code=connections_leaked",
                    self.id, in_use
                );
                return Err(DbError::ConnectionsLeaked { in_use });
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn wrap(
        &self,
        conn: r2d2::PooledConnection<SqliteConnectionManager>,
    ) -> DbResult<PooledConnection> {
        // A connection whose release-time rollback failed comes back dirty.
        if !conn.is_autocommit() {
            warn!(
                "event=pool_checkout module=db status=warn pool_id={} reason=open_transaction",
                self.id
            );
            conn.execute_batch("ROLLBACK;")?;
        }
        Ok(PooledConnection {
            conn,
            pool_id: self.id,
        })
    }
}

/// Connection checked out of a [`ConnectionPool`]; returned on drop.
pub struct PooledConnection {
    conn: r2d2::PooledConnection<SqliteConnectionManager>,
    pool_id: u64,
}

impl PooledConnection {
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.is_autocommit() {
            return;
        }
        warn!(
            "event=pool_return module=db status=warn pool_id={} reason=open_transaction",
            self.pool_id
        );
        if let Err(err) = self.conn.execute_batch("ROLLBACK;") {
            error!(
                "event=pool_return module=db status=error pool_id={} error_code=rollback_failed error={}",
                self.pool_id, err
            );
        }
    }
}
