//! Hybrid prior-state index.
//!
//! The fast path is an in-memory snapshot of `file_state` for the scanned
//! root, loaded once up to `preload_index_max_rows`. When the snapshot is
//! truncated each worker falls back to a read-only connection with a
//! prepared point lookup behind a per-worker LRU. Truncation also tells the
//! orchestrator to skip deletion reconciliation: a missing key no longer
//! proves the file is gone.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use lru::LruCache;
use rusqlite::Connection;

use crate::scan::metrics::ScanMetrics;
use crate::store::file_state::{self, IdentityType, PrevState};
use crate::store::{Store, StoreError};

type IdentityKey = (IdentityType, String);

pub struct HybridIndex {
    shared: Arc<HashMap<IdentityKey, PrevState>>,
    truncated: bool,
    root_path: String,
}

impl HybridIndex {
    /// Snapshot the prior state for `root_path`, up to `max_rows` rows.
    pub fn load(conn: &Connection, root_path: &str, max_rows: usize) -> Result<Self, StoreError> {
        let (map, truncated) = file_state::load_index_snapshot(conn, root_path, max_rows)?;
        if truncated {
            log::warn!(
                "Prior-state index for {root_path} truncated at {max_rows} rows; \
                 deletion reconciliation will be skipped"
            );
        }
        Ok(Self {
            shared: Arc::new(map),
            truncated,
            root_path: root_path.to_string(),
        })
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Build the per-worker lookup handle. Opens a read-only connection only
    /// when the snapshot is truncated (the snapshot is authoritative
    /// otherwise).
    pub fn worker_lookup(
        &self,
        store: &Store,
        lru_size: usize,
        metrics: Arc<ScanMetrics>,
    ) -> Result<WorkerLookup, StoreError> {
        let conn = if self.truncated {
            Some(store.open_read_connection()?)
        } else {
            None
        };
        Ok(WorkerLookup {
            shared: Arc::clone(&self.shared),
            truncated: self.truncated,
            root_path: self.root_path.clone(),
            conn,
            cache: LruCache::new(NonZeroUsize::new(lru_size).unwrap_or(NonZeroUsize::MIN)),
            metrics,
        })
    }
}

/// Owned by exactly one worker; the connection and LRU die with it.
pub struct WorkerLookup {
    shared: Arc<HashMap<IdentityKey, PrevState>>,
    truncated: bool,
    root_path: String,
    conn: Option<Connection>,
    cache: LruCache<IdentityKey, Option<PrevState>>,
    metrics: Arc<ScanMetrics>,
}

impl WorkerLookup {
    pub fn lookup(
        &mut self,
        identity_type: IdentityType,
        identity_value: &str,
    ) -> Result<Option<PrevState>, StoreError> {
        let key = (identity_type, identity_value.to_string());
        if let Some(prev) = self.shared.get(&key) {
            return Ok(Some(prev.clone()));
        }
        if !self.truncated {
            return Ok(None);
        }
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        // Truncated snapshot: consult the database.
        let conn = match &self.conn {
            Some(conn) => conn,
            None => return Ok(None),
        };
        let found = file_state::find_prev(conn, &self.root_path, identity_type, identity_value)?;
        if found.is_some() {
            self.metrics.db_lookup_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.db_lookup_miss.fetch_add(1, Ordering::Relaxed);
        }
        self.cache.put(key, found.clone());
        Ok(found)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
