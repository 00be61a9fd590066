//! Scan orchestration: walker -> worker pool -> single writer.
//!
//! `run_scan` owns the scan lifecycle: it opens the scan row, loads the
//! prior-state index, drives the pipeline, then performs deletion
//! reconciliation, the history snapshot, blob copies and the manifest before
//! closing the row. Per-file problems degrade to issues; only store-fatal and
//! blob-fatal errors abort the scan.

pub mod classify;
pub mod hash;
pub mod index;
pub mod metrics;
pub mod types;
pub mod walker;
pub mod writer;

#[cfg(test)]
mod pipeline_test;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use keeply_cas::{CasError, CasStore, ManifestEntry};

use crate::config::Config;
use crate::scan::classify::classify;
use crate::scan::hash::{HashPolicy, hash_file};
use crate::scan::index::{HybridIndex, WorkerLookup};
use crate::scan::metrics::ScanMetrics;
use crate::scan::types::{ChangeKind, FileMeta, FileResult, WalkItem, normalize_path};
use crate::scan::walker::{ExcludeRules, WalkerConfig, spawn_walker};
use crate::scan::writer::{IssueSender, PATH_CACHE_CAP, PathCache, ScanWriter, WriterContext};
use crate::store::file_state::{self, HashStatus, IssueRow, IssueStage};
use crate::store::scans::{self, ScanStatus, ScanSummaryRow};
use crate::store::{Store, StoreError, with_busy_retry};

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ScanError {
    /// Bad request; nothing entered the pipeline.
    InvalidInput(String),
    Store(StoreError),
    Blob(CasError),
    Rules(globset::Error),
    Thread(std::io::Error),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            ScanError::Store(e) => write!(f, "Store error: {e}"),
            ScanError::Blob(e) => write!(f, "Blob store error: {e}"),
            ScanError::Rules(e) => write!(f, "Bad exclusion glob: {e}"),
            ScanError::Thread(e) => write!(f, "Failed to start scan thread: {e}"),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<StoreError> for ScanError {
    fn from(err: StoreError) -> Self {
        ScanError::Store(err)
    }
}

impl From<CasError> for ScanError {
    fn from(err: CasError) -> Self {
        ScanError::Blob(err)
    }
}

impl From<globset::Error> for ScanError {
    fn from(err: globset::Error) -> Self {
        ScanError::Rules(err)
    }
}

/// Result of a finished (or cancelled) scan.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub scan_id: i64,
    pub status: ScanStatus,
    pub summary: ScanSummaryRow,
}

// ── Entry point ──────────────────────────────────────────────────────

/// Run one scan of `root`, storing changed contents under `dest`.
///
/// Blocking; the job controller calls this from a blocking task. The cancel
/// flag is polled at every stage boundary.
pub fn run_scan(
    store: &Store,
    config: &Config,
    root: &Path,
    dest: &Path,
    cancel: Arc<AtomicBool>,
) -> Result<ScanOutcome, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::InvalidInput(format!(
            "root is not a directory: {}",
            root.display()
        )));
    }
    let cas = CasStore::open(dest)?;
    let rules = Arc::new(ExcludeRules::compile(&config.exclude_globs)?);
    let root_str = normalize_path(root);
    let dest_str = normalize_path(dest);

    let scan_id = {
        let conn = store.pool().borrow();
        scans::open_scan(&conn, &root_str, &dest_str)?
    };
    log::info!("Scan {scan_id}: started for {root_str} -> {dest_str}");

    let metrics = Arc::new(ScanMetrics::default());
    let result = execute(store, config, &cas, scan_id, root, &root_str, &rules, &cancel, &metrics);

    let conn = store.pool().borrow();
    match result {
        Ok(true) => {
            let summary = metrics.to_summary(scan_id);
            scans::finish_scan(&conn, scan_id, ScanStatus::Success, None)?;
            scans::upsert_summary(&conn, &summary)?;
            scans::finish_backup_history_for_scan(
                &conn,
                scan_id,
                "OK",
                summary.files_total,
                summary.walk_errors + summary.hash_errors,
                None,
            )?;
            log::info!(
                "Scan {scan_id}: SUCCESS ({} files, {} new, {} modified, {} moved, {} deleted)",
                summary.files_total,
                summary.new_count,
                summary.modified_count,
                summary.moved_count,
                summary.deleted_count
            );
            Ok(ScanOutcome {
                scan_id,
                status: ScanStatus::Success,
                summary,
            })
        }
        Ok(false) => {
            let summary = metrics.to_summary(scan_id);
            scans::finish_scan(&conn, scan_id, ScanStatus::Cancelled, None)?;
            scans::upsert_summary(&conn, &summary)?;
            scans::finish_backup_history_for_scan(
                &conn,
                scan_id,
                "ERROR",
                summary.files_total,
                summary.walk_errors + summary.hash_errors,
                Some("cancelled"),
            )?;
            log::info!("Scan {scan_id}: CANCELLED after {} files", summary.files_total);
            Ok(ScanOutcome {
                scan_id,
                status: ScanStatus::Cancelled,
                summary,
            })
        }
        Err(err) => {
            let message = err.to_string();
            // Best effort: the same failure may prevent these writes too.
            let _ = file_state::insert_issue_batch(
                &conn,
                scan_id,
                &[IssueRow {
                    stage: IssueStage::Db,
                    path: None,
                    identity_type: None,
                    identity_value: None,
                    error_type: "fatal".to_string(),
                    message: message.clone(),
                    rule: None,
                }],
            );
            let _ = scans::finish_scan(&conn, scan_id, ScanStatus::Failed, Some(&message));
            let _ = scans::upsert_summary(&conn, &metrics.to_summary(scan_id));
            let _ = scans::finish_backup_history_for_scan(
                &conn,
                scan_id,
                "ERROR",
                metrics.to_summary(scan_id).files_total,
                0,
                Some(&message),
            );
            log::error!("Scan {scan_id}: FAILED: {message}");
            Err(err)
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────

/// Run the pipeline plus the end-of-scan phases.
/// Returns `Ok(true)` on completion, `Ok(false)` when cancelled.
#[allow(clippy::too_many_arguments)]
fn execute(
    store: &Store,
    config: &Config,
    cas: &CasStore,
    scan_id: i64,
    root: &Path,
    root_str: &str,
    rules: &Arc<ExcludeRules>,
    cancel: &Arc<AtomicBool>,
    metrics: &Arc<ScanMetrics>,
) -> Result<bool, ScanError> {
    // Prior-state index (may be truncated).
    let index = {
        let conn = store.open_read_connection()?;
        HybridIndex::load(&conn, root_str, config.preload_index_max_rows)?
    };
    log::debug!(
        "Scan {scan_id}: loaded {} prior rows (truncated: {})",
        index.len(),
        index.truncated()
    );

    let workers = config.effective_workers();
    let policy = HashPolicy {
        enabled: config.hashing_enabled,
        max_bytes: config.hash_max_bytes,
    };

    // Writer first: walker and workers feed it.
    let (scan_writer, results_tx, issue_sender) = ScanWriter::spawn(WriterContext {
        pool: store.pool().clone(),
        scan_id,
        batch_limit: config.batch_limit,
        queue_capacity: config.queue_capacity,
        path_cache: Arc::new(PathCache::new(PATH_CACHE_CAP)),
        metrics: Arc::clone(metrics),
        cancel: Arc::clone(cancel),
    })
    .map_err(ScanError::Thread)?;

    let (walk_tx, walk_rx) = bounded::<WalkItem>(config.queue_capacity);

    let walker_handle = spawn_walker(
        WalkerConfig {
            root: root.to_path_buf(),
            follow_symlinks: config.follow_symlinks,
            workers,
        },
        Arc::clone(rules),
        walk_tx,
        issue_sender.clone(),
        Arc::clone(metrics),
        Arc::clone(cancel),
    )
    .map_err(ScanError::Thread)?;

    let mut worker_handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let lookup = index.worker_lookup(store, config.lru_cache_size, Arc::clone(metrics))?;
        let handle = std::thread::Builder::new()
            .name(format!("scan-worker-{worker_id}"))
            .spawn({
                let rx = walk_rx.clone();
                let results_tx = results_tx.clone();
                let issues = issue_sender.clone();
                let rules = Arc::clone(rules);
                let metrics = Arc::clone(metrics);
                let cancel = Arc::clone(cancel);
                move || worker_loop(rx, results_tx, issues, lookup, rules, policy, metrics, cancel)
            })
            .map_err(ScanError::Thread)?;
        worker_handles.push(handle);
    }
    // The writer must observe disconnect once walker and workers are done.
    drop(walk_rx);
    drop(results_tx);
    drop(issue_sender);

    if walker_handle.join().is_err() {
        log::error!("Scan {scan_id}: walker thread panicked");
    }
    for handle in worker_handles {
        if handle.join().is_err() {
            log::error!("Scan {scan_id}: worker thread panicked");
        }
    }
    scan_writer.close()?;

    if cancel.load(Ordering::Relaxed) {
        return Ok(false);
    }

    // Deletion reconciliation, skipped on a truncated index.
    let conn = store.pool().borrow();
    if index.truncated() {
        log::warn!("Scan {scan_id}: index truncated; skipping deletion reconciliation");
    } else {
        let deleted = with_busy_retry(&metrics.db_retries, || {
            file_state::delete_stale_files(&conn, scan_id, root_str)
        })?;
        metrics.deleted_count.store(deleted, Ordering::Relaxed);
        if deleted > 0 {
            log::info!("Scan {scan_id}: reconciled {deleted} deletions");
        }
    }

    // Snapshot NEW/MODIFIED rows into the per-path history.
    let snapshotted = with_busy_retry(&metrics.db_retries, || {
        file_state::snapshot_to_history(&conn, scan_id, root_str)
    })?;
    log::debug!("Scan {scan_id}: {snapshotted} history rows written");

    // Copy changed contents into the blob store.
    let changed = file_state::changed_files_for_scan(&conn, scan_id, root_str)?;
    let mut blobs_written = 0u64;
    for file in &changed {
        if cancel.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let stored = cas.put_content(
            Path::new(&file.full_path),
            &file.content_algo,
            &file.content_hash,
            file.size_bytes,
        )?;
        if stored {
            blobs_written += 1;
        }
    }
    log::debug!(
        "Scan {scan_id}: {blobs_written} blobs written ({} changed files)",
        changed.len()
    );

    // Manifest: the full hashed tree for this scan, sorted by relative path.
    let manifest: Vec<ManifestEntry> = file_state::manifest_entries_for_scan(&conn, scan_id, root_str)?
        .into_iter()
        .map(|row| ManifestEntry {
            path_rel: row.path_rel,
            algo: row.content_algo,
            hash_hex: row.content_hash,
            size_bytes: row.size_bytes,
            modified_at: row.modified_at,
        })
        .collect();
    cas.write_manifest(scan_id, &manifest)?;

    Ok(true)
}

// ── Worker ───────────────────────────────────────────────────────────

/// Classify and hash files until the poison sentinel arrives.
#[allow(clippy::too_many_arguments)]
fn worker_loop(
    rx: Receiver<WalkItem>,
    results_tx: Sender<FileResult>,
    issues: IssueSender,
    mut lookup: WorkerLookup,
    rules: Arc<ExcludeRules>,
    policy: HashPolicy,
    metrics: Arc<ScanMetrics>,
    cancel: Arc<AtomicBool>,
) {
    loop {
        let meta = match rx.recv() {
            Ok(WalkItem::File(meta)) => meta,
            Ok(WalkItem::Poison) | Err(_) => return,
        };
        if cancel.load(Ordering::Relaxed) {
            // Keep draining so the walker never blocks on a full channel.
            continue;
        }

        if let Some(result) = process_file(meta, &issues, &mut lookup, &rules, policy, &metrics)
            && results_tx.send(result).is_err()
        {
            // Writer is gone; nothing more to do.
            return;
        }
    }
}

fn process_file(
    meta: FileMeta,
    issues: &IssueSender,
    lookup: &mut WorkerLookup,
    rules: &ExcludeRules,
    policy: HashPolicy,
    metrics: &ScanMetrics,
) -> Option<FileResult> {
    // File-level exclusion, relative to the root.
    let rel = meta
        .full_path
        .strip_prefix(meta.root_path.trim_end_matches('/'))
        .map(|r| r.trim_start_matches('/'))
        .unwrap_or(&meta.full_path);
    if let Some(rule) = rules.matched(rel) {
        issues.send(IssueRow {
            stage: IssueStage::Ignore,
            path: Some(meta.full_path.clone()),
            identity_type: Some(meta.identity_type),
            identity_value: Some(meta.identity_value.clone()),
            error_type: "excluded".to_string(),
            message: format!("excluded by rule {rule}"),
            rule: Some(rule.to_string()),
        });
        return None;
    }

    let prev = match lookup.lookup(meta.identity_type, &meta.identity_value) {
        Ok(prev) => prev,
        Err(e) => {
            // Degrade to NEW: the rehash and upsert are safe either way.
            log::warn!("Prior-state lookup failed for {}: {e}", meta.full_path);
            issues.send(IssueRow {
                stage: IssueStage::Db,
                path: Some(meta.full_path.clone()),
                identity_type: Some(meta.identity_type),
                identity_value: Some(meta.identity_value.clone()),
                error_type: "lookup".to_string(),
                message: e.to_string(),
                rule: None,
            });
            None
        }
    };

    let decision = classify(&meta, prev.as_ref());
    ScanMetrics::bump(&metrics.files_total);
    ScanMetrics::add(&metrics.bytes_scanned, meta.size_bytes);
    match decision.kind {
        ChangeKind::New => ScanMetrics::bump(&metrics.new_count),
        ChangeKind::Modified => ScanMetrics::bump(&metrics.modified_count),
        ChangeKind::Moved => ScanMetrics::bump(&metrics.moved_count),
        ChangeKind::Unchanged => ScanMetrics::bump(&metrics.unchanged_count),
    }

    let (content_algo, content_hash, hash_status) = if decision.needs_hash {
        let outcome = hash_file(Path::new(&meta.full_path), meta.size_bytes, &policy);
        match outcome.status {
            HashStatus::Ok => ScanMetrics::add(&metrics.bytes_hashed, outcome.bytes_hashed),
            HashStatus::SkippedSize => ScanMetrics::bump(&metrics.skipped_size),
            HashStatus::Disabled => ScanMetrics::bump(&metrics.skipped_disabled),
            HashStatus::Failed => {
                ScanMetrics::bump(&metrics.hash_errors);
                issues.send(IssueRow {
                    stage: IssueStage::Hash,
                    path: Some(meta.full_path.clone()),
                    identity_type: Some(meta.identity_type),
                    identity_value: Some(meta.identity_value.clone()),
                    error_type: "io".to_string(),
                    message: outcome.error.clone().unwrap_or_else(|| "hash failed".to_string()),
                    rule: None,
                });
            }
            HashStatus::None => {}
        }
        (outcome.algo, outcome.hash_hex, outcome.status)
    } else {
        let status = if decision.reuse_hash.is_some() {
            HashStatus::Ok
        } else {
            HashStatus::None
        };
        (decision.reuse_algo.clone(), decision.reuse_hash.clone(), status)
    };

    Some(FileResult {
        meta,
        status: decision.kind,
        content_algo,
        content_hash,
        hash_status,
        reason_extra: decision.reason_extra,
    })
}
