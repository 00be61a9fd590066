//! Fixed-size connection pool with per-borrow transaction discipline.
//!
//! `borrow()` blocks until a connection is free. The returned [`PooledConn`]
//! derefs to `rusqlite::Connection`; on drop it rolls back any transaction the
//! borrower left open and hands the connection back.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use rusqlite::Connection;

use super::{StoreError, open_connection};

#[derive(Clone)]
pub struct SimplePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Connection>>,
    freed: Condvar,
    size: usize,
}

impl SimplePool {
    /// Open `size` connections up front. All share the same key/pragma setup.
    pub(crate) fn new(db_path: &Path, secret: &str, size: usize) -> Result<Self, StoreError> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            conns.push(open_connection(db_path, secret)?);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(conns),
                freed: Condvar::new(),
                size,
            }),
        })
    }

    /// Borrow a connection, blocking while the pool is exhausted.
    pub fn borrow(&self) -> PooledConn {
        let mut idle = lock_idle(&self.inner);
        loop {
            if let Some(conn) = idle.pop() {
                return PooledConn {
                    conn: Some(conn),
                    inner: Arc::clone(&self.inner),
                };
            }
            idle = self
                .inner
                .freed
                .wait(idle)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Configured pool size.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Currently idle connections (diagnostics, tests).
    pub fn idle_count(&self) -> usize {
        lock_idle(&self.inner).len()
    }
}

/// A mutex poisoned by a panicking borrower still holds valid connections.
fn lock_idle(inner: &PoolInner) -> MutexGuard<'_, Vec<Connection>> {
    inner
        .idle
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A borrowed connection. Dropping it returns it to the pool, rolling back
/// first if the borrower left a transaction open.
pub struct PooledConn {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Invariant: `conn` is only None after drop.
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                log::warn!("Returning connection with open transaction; rolling back");
                let _ = conn.execute_batch("ROLLBACK");
            }
            lock_idle(&self.inner).push(conn);
            self.inner.freed.notify_one();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, schema};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn pool_of(size: usize) -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Store::open(&dir.path().join("pool.keeply"), "secret", size).expect("open");
        (store, dir)
    }

    #[test]
    fn borrow_and_return() {
        let (store, _dir) = pool_of(2);
        assert_eq!(store.pool().idle_count(), 2);
        {
            let _a = store.pool().borrow();
            let _b = store.pool().borrow();
            assert_eq!(store.pool().idle_count(), 0);
        }
        assert_eq!(store.pool().idle_count(), 2);
    }

    #[test]
    fn borrow_blocks_until_freed() {
        let (store, _dir) = pool_of(1);
        let held = store.pool().borrow();

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = Arc::clone(&released);

        std::thread::scope(|scope| {
            let pool = store.pool();
            let waiter = scope.spawn(move || {
                let conn = pool.borrow();
                assert!(
                    released_clone.load(Ordering::SeqCst),
                    "borrow returned before the holder released"
                );
                drop(conn);
            });

            std::thread::sleep(Duration::from_millis(100));
            released.store(true, Ordering::SeqCst);
            drop(held);
            waiter.join().expect("waiter panicked");
        });
    }

    #[test]
    fn open_transaction_is_rolled_back_on_drop() {
        let (store, _dir) = pool_of(1);
        {
            let conn = store.pool().borrow();
            schema::init(&conn).unwrap();
            conn.execute_batch("BEGIN").unwrap();
            conn.execute("INSERT INTO path (full_path) VALUES ('/abandoned')", [])
                .unwrap();
            assert!(!conn.is_autocommit());
            // Dropped with the transaction still open.
        }
        let conn = store.pool().borrow();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM path WHERE full_path = '/abandoned'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(n, 0, "uncommitted insert should have been rolled back");
    }

    #[test]
    fn committed_work_survives_return() {
        let (store, _dir) = pool_of(1);
        {
            let conn = store.pool().borrow();
            let tx = conn.unchecked_transaction().unwrap();
            tx.execute("INSERT INTO path (full_path) VALUES ('/kept')", []).unwrap();
            tx.commit().unwrap();
        }
        let conn = store.pool().borrow();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM path WHERE full_path = '/kept'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
