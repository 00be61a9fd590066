//! Single logical writer for all scan persistence.
//!
//! One thread owns the buffers and batching policy. Full batches are handed
//! to short-lived dispatch threads, each borrowing a pool connection, so
//! independent batches can commit in parallel; the completion gate bounds
//! them by pool size and `close()` blocks until every dispatched batch has
//! succeeded or failed. Batches sort by content hash before executing so two
//! concurrent batches touch the `content` table in the same order.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, never, select};
use dashmap::DashMap;

use crate::scan::metrics::ScanMetrics;
use crate::scan::types::{ChangeKind, FileResult};
use crate::store::file_state::{
    self, FileChangeRow, FileStateUpsert, IssueRow, StateStatus,
};
use crate::store::{SimplePool, StoreError, with_busy_retry};

/// Process-wide cap on cached path-id resolutions.
pub const PATH_CACHE_CAP: usize = 120_000;

/// Issues flush much earlier than file batches; they are small and rare.
const ISSUE_BATCH_LIMIT: usize = 500;

// ── Path-id cache ────────────────────────────────────────────────────

/// Concurrent full-path -> path-id cache shared by all dispatch threads.
pub struct PathCache {
    map: DashMap<String, i64>,
    cap: usize,
}

impl PathCache {
    pub fn new(cap: usize) -> Self {
        Self {
            map: DashMap::new(),
            cap,
        }
    }

    pub fn get(&self, full_path: &str) -> Option<i64> {
        self.map.get(full_path).map(|entry| *entry)
    }

    /// Insert unless the cache is at capacity (stops growing, never evicts).
    pub fn put(&self, full_path: String, id: i64) {
        if self.map.len() < self.cap {
            self.map.insert(full_path, id);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

// ── Issue queue ──────────────────────────────────────────────────────

/// Bounded, lossy sender for scan issues. Overflow drops the issue and
/// increments `issuesDropped` instead of stalling the pipeline.
#[derive(Clone)]
pub struct IssueSender {
    tx: Sender<IssueRow>,
    metrics: Arc<ScanMetrics>,
}

impl IssueSender {
    pub fn send(&self, issue: IssueRow) {
        if self.tx.try_send(issue).is_err() {
            ScanMetrics::bump(&self.metrics.issues_dropped);
        }
    }

    #[cfg(test)]
    pub(crate) fn test_sender(tx: Sender<IssueRow>, metrics: Arc<ScanMetrics>) -> Self {
        Self { tx, metrics }
    }
}

// ── Completion gate ──────────────────────────────────────────────────

/// Tracks outstanding dispatched batches and the first fatal error.
struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

struct GateState {
    outstanding: usize,
    failure: Option<StoreError>,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                outstanding: 0,
                failure: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Reserve a dispatch slot, waiting while `limit` batches are in flight.
    fn acquire(&self, limit: usize) {
        let mut state = self.lock();
        while state.outstanding >= limit {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.outstanding += 1;
    }

    fn release(&self, failure: Option<StoreError>) {
        let mut state = self.lock();
        state.outstanding -= 1;
        if let Some(err) = failure
            && state.failure.is_none()
        {
            state.failure = Some(err);
        }
        self.cond.notify_all();
    }

    fn failed(&self) -> bool {
        self.lock().failure.is_some()
    }

    /// Block until no batch is in flight, then return the recorded failure.
    fn wait_idle(&self) -> Option<StoreError> {
        let mut state = self.lock();
        while state.outstanding > 0 {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.failure.take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── ScanWriter ───────────────────────────────────────────────────────

/// Handle to the writer thread. Obtain senders from [`ScanWriter::spawn`],
/// hand clones to the walker and workers, drop the originals, then `close()`.
pub struct ScanWriter {
    join: JoinHandle<Result<(), StoreError>>,
}

pub struct WriterContext {
    pub pool: SimplePool,
    pub scan_id: i64,
    pub batch_limit: usize,
    pub queue_capacity: usize,
    pub path_cache: Arc<PathCache>,
    pub metrics: Arc<ScanMetrics>,
    pub cancel: Arc<AtomicBool>,
}

impl ScanWriter {
    /// Spawn the writer thread. Returns the handle plus the result and issue
    /// senders feeding it.
    pub fn spawn(ctx: WriterContext) -> std::io::Result<(Self, Sender<FileResult>, IssueSender)> {
        let (results_tx, results_rx) = bounded::<FileResult>(ctx.queue_capacity);
        let (issues_tx, issues_rx) = bounded::<IssueRow>(ctx.queue_capacity);
        let issue_sender = IssueSender {
            tx: issues_tx,
            metrics: Arc::clone(&ctx.metrics),
        };

        let join = std::thread::Builder::new()
            .name("scan-writer".into())
            .spawn(move || writer_loop(ctx, results_rx, issues_rx))?;

        Ok((Self { join }, results_tx, issue_sender))
    }

    /// Wait for the writer to drain and finish. All senders must be dropped
    /// first or this blocks forever.
    pub fn close(self) -> Result<(), StoreError> {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(StoreError::Io(std::io::Error::other("writer thread panicked"))),
        }
    }
}

fn writer_loop(
    ctx: WriterContext,
    results_rx: Receiver<FileResult>,
    issues_rx: Receiver<IssueRow>,
) -> Result<(), StoreError> {
    let gate = Arc::new(Gate::new());
    let mut files: Vec<FileResult> = Vec::with_capacity(ctx.batch_limit);
    let mut issues: Vec<IssueRow> = Vec::with_capacity(ISSUE_BATCH_LIMIT);

    // Disconnected receivers are swapped for `never()` so the select does not
    // spin on a closed channel while the other side is still live.
    let mut results_rx = results_rx;
    let mut issues_rx = issues_rx;
    let mut results_open = true;
    let mut issues_open = true;

    while results_open || issues_open {
        select! {
            recv(results_rx) -> msg => match msg {
                Ok(result) => {
                    // After cancellation or a fatal batch error we keep the
                    // channel flowing so producers never block, but persist
                    // nothing further.
                    let halted = gate.failed()
                        || ctx.cancel.load(std::sync::atomic::Ordering::Relaxed);
                    if !halted {
                        files.push(result);
                        if files.len() >= ctx.batch_limit {
                            dispatch_file_batch(&ctx, &gate, &mut files);
                        }
                    }
                }
                Err(_) => {
                    results_open = false;
                    results_rx = never();
                }
            },
            recv(issues_rx) -> msg => match msg {
                Ok(issue) => {
                    issues.push(issue);
                    if issues.len() >= ISSUE_BATCH_LIMIT {
                        flush_issues(&ctx, &mut issues);
                    }
                }
                Err(_) => {
                    issues_open = false;
                    issues_rx = never();
                }
            },
        }
    }

    let cancelled = ctx.cancel.load(std::sync::atomic::Ordering::Relaxed);
    if !cancelled && !gate.failed() {
        if !files.is_empty() {
            dispatch_file_batch(&ctx, &gate, &mut files);
        }
        if !issues.is_empty() {
            flush_issues(&ctx, &mut issues);
        }
    }

    // Drain every in-flight batch before reporting.
    match gate.wait_idle() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Hand the current buffer to a dispatch thread (bounded by pool size).
fn dispatch_file_batch(ctx: &WriterContext, gate: &Arc<Gate>, files: &mut Vec<FileResult>) {
    let batch = std::mem::take(files);
    if batch.is_empty() {
        return;
    }
    gate.acquire(ctx.pool.size());

    let gate = Arc::clone(gate);
    let pool = ctx.pool.clone();
    let path_cache = Arc::clone(&ctx.path_cache);
    let metrics = Arc::clone(&ctx.metrics);
    let scan_id = ctx.scan_id;

    let gate_for_spawn_failure = Arc::clone(&gate);
    let spawned = std::thread::Builder::new()
        .name("scan-writer-batch".into())
        .spawn(move || {
            let conn = pool.borrow();
            let result = run_file_batch(&conn, scan_id, batch, &path_cache, &metrics);
            gate.release(result.err());
        });
    if let Err(e) = spawned {
        gate_for_spawn_failure.release(Some(StoreError::Io(e)));
    }
}

/// Persist one batch atomically. Retried wholesale on contention.
fn run_file_batch(
    conn: &rusqlite::Connection,
    scan_id: i64,
    mut batch: Vec<FileResult>,
    path_cache: &PathCache,
    metrics: &ScanMetrics,
) -> Result<(), StoreError> {
    // Deterministic content-table order across concurrent batches.
    batch.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));

    with_busy_retry(&metrics.db_retries, || {
        let tx = conn.unchecked_transaction()?;
        for item in &batch {
            apply_result(&tx, scan_id, item, path_cache)?;
        }
        tx.commit()?;
        Ok(())
    })
}

fn apply_result(
    conn: &rusqlite::Connection,
    scan_id: i64,
    item: &FileResult,
    path_cache: &PathCache,
) -> Result<(), StoreError> {
    let meta = &item.meta;
    if item.status == ChangeKind::Unchanged {
        file_state::touch_file_state(
            conn,
            &meta.root_path,
            meta.identity_type,
            &meta.identity_value,
            scan_id,
        )?;
        return Ok(());
    }

    let path_id = match path_cache.get(&meta.full_path) {
        Some(id) => id,
        None => {
            let id = file_state::resolve_path_id(conn, &meta.full_path)?;
            path_cache.put(meta.full_path.clone(), id);
            id
        }
    };

    if let (Some(algo), Some(hash)) = (&item.content_algo, &item.content_hash) {
        file_state::upsert_content(conn, algo, hash, meta.size_bytes)?;
    }

    let status = match item.status {
        ChangeKind::New => StateStatus::New,
        ChangeKind::Modified => StateStatus::Modified,
        // Moves keep their content; they are not history events.
        ChangeKind::Moved | ChangeKind::Unchanged => StateStatus::Stable,
    };

    file_state::upsert_file_state(
        conn,
        &FileStateUpsert {
            root_path: meta.root_path.clone(),
            identity_type: meta.identity_type,
            identity_value: meta.identity_value.clone(),
            path_id,
            file_key: meta.file_key.clone(),
            size_bytes: meta.size_bytes,
            created_at: meta.created_at,
            modified_at: meta.modified_at,
            content_algo: item.content_algo.clone(),
            content_hash: item.content_hash.clone(),
            hash_status: item.hash_status,
            status,
            last_scan_id: scan_id,
        },
    )?;

    file_state::append_file_change(
        conn,
        &FileChangeRow {
            scan_id,
            root_path: meta.root_path.clone(),
            identity_type: meta.identity_type,
            identity_value: meta.identity_value.clone(),
            size_bytes: Some(meta.size_bytes),
            modified_at: meta.modified_at,
            content_algo: item.content_algo.clone(),
            content_hash: item.content_hash.clone(),
            reason: item.reason(),
        },
    )?;
    Ok(())
}

/// Issues are best-effort: failures are logged, never fatal.
fn flush_issues(ctx: &WriterContext, issues: &mut Vec<IssueRow>) {
    let batch = std::mem::take(issues);
    if batch.is_empty() {
        return;
    }
    let conn = ctx.pool.borrow();
    let result = with_busy_retry(&ctx.metrics.db_retries, || {
        file_state::insert_issue_batch(&conn, ctx.scan_id, &batch)
    });
    if let Err(e) = result {
        log::warn!("Failed to persist {} scan issues: {e}", batch.len());
    }
}

// ── Tests ────────────────────────────────────────────────────────────
