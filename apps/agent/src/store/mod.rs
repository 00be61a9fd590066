//! Encrypted SQLite inventory store.
//!
//! One database file per agent, SQLCipher-encrypted, WAL mode. This module
//! is the only place that issues SQL: everything above it talks in
//! intention-revealing operations (`delete_stale_files`, `snapshot_to_history`,
//! `list_backup_history`, ...). Writes go through connections borrowed from a
//! [`pool::SimplePool`]; dropping a borrowed connection rolls back any open
//! transaction before returning it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::Connection;

pub mod agent_state;
pub mod file_state;
pub mod pool;
pub mod scans;
pub mod schema;
pub mod session;

pub use pool::{PooledConn, SimplePool};

/// SQLCipher key-derivation iterations applied to every connection.
const KDF_ITERATIONS: u32 = 64_000;

/// Busy-handler timeout applied to every physical connection.
const BUSY_TIMEOUT: Duration = Duration::from_millis(7_500);

/// Contention retry policy: attempts and base backoff.
pub const BUSY_RETRY_ATTEMPTS: u32 = 6;
pub const BUSY_RETRY_BASE_MS: u64 = 50;

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// Missing or wrong encryption secret.
    Encryption(String),
    /// Busy/locked retries exhausted; the scan treats this as fatal.
    RetriesExhausted { attempts: u32, last: rusqlite::Error },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::Encryption(msg) => write!(f, "Encryption error: {msg}"),
            StoreError::RetriesExhausted { attempts, last } => {
                write!(f, "Database still busy after {attempts} attempts: {last}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Whether an error is transient lock contention worth retrying.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Run `op`, retrying busy/locked errors with exponential backoff.
///
/// Each retry increments `retry_counter` (surfaces as `dbRetries` in the scan
/// summary). Non-contention errors return immediately.
pub fn with_busy_retry<T>(
    retry_counter: &AtomicU64,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut delay = Duration::from_millis(BUSY_RETRY_BASE_MS);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(StoreError::Sqlite(err)) if is_busy(&err) => {
                attempt += 1;
                if attempt >= BUSY_RETRY_ATTEMPTS {
                    return Err(StoreError::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                retry_counter.fetch_add(1, Ordering::Relaxed);
                log::debug!("Database busy (attempt {attempt}), backing off {delay:?}");
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Milliseconds since the epoch; all store timestamps use this.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Connection setup ─────────────────────────────────────────────────

/// Open one physical connection: key, KDF, pragmas, key verification.
pub(crate) fn open_connection(db_path: &Path, secret: &str) -> Result<Connection, StoreError> {
    if secret.is_empty() {
        return Err(StoreError::Encryption(
            "an encryption secret is required to open the store".to_string(),
        ));
    }
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "key", secret)?;
    conn.pragma_update(None, "kdf_iter", KDF_ITERATIONS)?;

    // First read forces key derivation: a wrong secret surfaces here as
    // "file is not a database".
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map_err(|e| StoreError::Encryption(format!("cannot unlock database: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

// ── Store ────────────────────────────────────────────────────────────

/// Handle to the agent's inventory database.
///
/// Owns the connection pool used by the scan writer. Read-only connections
/// for worker lookups and the HTTP layer are opened on demand.
pub struct Store {
    db_path: PathBuf,
    secret: String,
    pool: SimplePool,
}

impl Store {
    /// Open (or create) the store, run schema bootstrap, build the pool.
    pub fn open(db_path: &Path, secret: &str, pool_size: usize) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_connection(db_path, secret)?;
        schema::init(&conn)?;
        drop(conn);

        let pool = SimplePool::new(db_path, secret, pool_size.max(1))?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            secret: secret.to_string(),
            pool,
        })
    }

    /// One standalone writable connection, outside the pool.
    pub fn open_single_connection(&self) -> Result<Connection, StoreError> {
        open_connection(&self.db_path, &self.secret)
    }

    /// A read-only connection for lookups (workers, history queries).
    pub fn open_read_connection(&self) -> Result<Connection, StoreError> {
        let conn = open_connection(&self.db_path, &self.secret)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(conn)
    }

    pub fn pool(&self) -> &SimplePool {
        &self.pool
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Store::open(&dir.path().join("test.keeply"), "test-secret", 2).expect("open store");
        (store, dir)
    }

    #[test]
    fn open_creates_schema() {
        let (store, _dir) = temp_store();
        let conn = store.open_read_connection().unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'file_state'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn empty_secret_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Store::open(&dir.path().join("x.keeply"), "", 1);
        assert!(matches!(result, Err(StoreError::Encryption(_))));
    }

    #[test]
    fn wrong_secret_fails_to_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.keeply");
        {
            let _store = Store::open(&path, "right-secret", 1).unwrap();
        }
        let result = Store::open(&path, "wrong-secret", 1);
        assert!(matches!(result, Err(StoreError::Encryption(_))));
    }

    #[test]
    fn init_is_idempotent() {
        let (store, _dir) = temp_store();
        let conn = store.open_single_connection().unwrap();
        schema::init(&conn).unwrap();
        schema::init(&conn).unwrap();
    }

    #[test]
    fn read_connection_refuses_writes() {
        let (store, _dir) = temp_store();
        let conn = store.open_read_connection().unwrap();
        let result = conn.execute("INSERT INTO path (full_path) VALUES ('/x')", []);
        assert!(result.is_err());
    }

    fn busy_error() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn busy_retry_passes_through_success() {
        let retries = AtomicU64::new(0);
        let value = with_busy_retry(&retries, || Ok::<_, StoreError>(42)).unwrap();
        assert_eq!(value, 42);
        assert_eq!(retries.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn busy_retry_retries_then_succeeds() {
        let retries = AtomicU64::new(0);
        let mut calls = 0;
        let value = with_busy_retry(&retries, || {
            calls += 1;
            if calls < 3 { Err(busy_error()) } else { Ok(7) }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(retries.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn busy_retry_exhausts() {
        let retries = AtomicU64::new(0);
        let result: Result<(), _> = with_busy_retry(&retries, || Err(busy_error()));
        assert!(matches!(result, Err(StoreError::RetriesExhausted { attempts: 6, .. })));
    }

    #[test]
    fn non_busy_errors_surface_immediately() {
        let retries = AtomicU64::new(0);
        let result: Result<(), _> =
            with_busy_retry(&retries, || Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery)));
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(retries.load(Ordering::Relaxed), 0);
    }
}
