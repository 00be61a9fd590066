//! Directory walker feeding the worker pool.
//!
//! Runs on a dedicated thread and backpressures on the bounded `WalkItem`
//! channel. Exclusion globs are matched against paths relative to the scan
//! root; a directory match prunes the whole subtree. Unreadable directories
//! become WALK issues and the traversal continues. When the walk ends (or is
//! cancelled) one poison sentinel per worker is enqueued.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::scan::metrics::ScanMetrics;
use crate::scan::types::{FileMeta, WalkItem, normalize_path};
use crate::scan::writer::IssueSender;
use crate::store::file_state::{IdentityType, IssueRow, IssueStage};

// ── Exclusion rules ──────────────────────────────────────────────────

/// Compiled exclusion globs, matched against root-relative paths.
pub struct ExcludeRules {
    set: GlobSet,
    patterns: Vec<String>,
}

impl ExcludeRules {
    pub fn compile(globs: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for glob in globs {
            builder.add(Glob::new(glob)?);
        }
        Ok(Self {
            set: builder.build()?,
            patterns: globs.to_vec(),
        })
    }

    /// First matching pattern for a relative path, if any.
    pub fn matched(&self, rel: &str) -> Option<&str> {
        self.set
            .matches(rel)
            .first()
            .map(|&idx| self.patterns[idx].as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

// ── Walker ───────────────────────────────────────────────────────────

pub struct WalkerConfig {
    pub root: PathBuf,
    pub follow_symlinks: bool,
    /// One poison sentinel per worker is sent when the walk ends.
    pub workers: usize,
}

/// Start the walker thread.
pub fn spawn_walker(
    config: WalkerConfig,
    rules: Arc<ExcludeRules>,
    tx: Sender<WalkItem>,
    issues: IssueSender,
    metrics: Arc<ScanMetrics>,
    cancel: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("scan-walker".into())
        .spawn(move || {
            run_walk(&config, &rules, &tx, &issues, &metrics, &cancel);
            for _ in 0..config.workers {
                if tx.send(WalkItem::Poison).is_err() {
                    break;
                }
            }
        })
}

fn run_walk(
    config: &WalkerConfig,
    rules: &ExcludeRules,
    tx: &Sender<WalkItem>,
    issues: &IssueSender,
    metrics: &ScanMetrics,
    cancel: &AtomicBool,
) {
    let root = &config.root;
    let root_str = normalize_path(root);
    let mut it = WalkDir::new(root)
        .follow_links(config.follow_symlinks)
        .into_iter();

    loop {
        if cancel.load(Ordering::Relaxed) {
            log::info!("Walker: cancellation requested, stopping traversal");
            return;
        }

        let entry = match it.next() {
            None => return,
            Some(Ok(entry)) => entry,
            Some(Err(err)) => {
                ScanMetrics::bump(&metrics.walk_errors);
                issues.send(IssueRow {
                    stage: IssueStage::Walk,
                    path: err.path().map(normalize_path),
                    identity_type: None,
                    identity_value: None,
                    error_type: "io".to_string(),
                    message: err.to_string(),
                    rule: None,
                });
                continue;
            }
        };

        if entry.depth() == 0 {
            continue;
        }

        let rel = match relative_of(entry.path(), root) {
            Some(rel) => rel,
            None => continue,
        };

        if entry.file_type().is_dir() {
            if let Some(rule) = rules.matched(&rel) {
                log::debug!("Walker: pruning {rel} (rule {rule})");
                ScanMetrics::bump(&metrics.dirs_skipped);
                it.skip_current_dir();
                continue;
            }
            // Reparse-point safety: never descend into symlinked directories
            // on Windows, even with follow-links on.
            #[cfg(windows)]
            if entry.path_is_symlink() {
                it.skip_current_dir();
                continue;
            }
            continue;
        }

        if !entry.file_type().is_file() {
            // Dangling symlinks, sockets, fifos.
            continue;
        }

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                ScanMetrics::bump(&metrics.walk_errors);
                issues.send(IssueRow {
                    stage: IssueStage::Walk,
                    path: Some(normalize_path(entry.path())),
                    identity_type: None,
                    identity_value: None,
                    error_type: "metadata".to_string(),
                    message: err.to_string(),
                    rule: None,
                });
                continue;
            }
        };

        let full_path = normalize_path(entry.path());
        let file_key = file_key_of(&meta);
        let (identity_type, identity_value) = match &file_key {
            Some(key) => (IdentityType::FileKey, key.clone()),
            None => (IdentityType::Path, full_path.clone()),
        };

        let item = FileMeta {
            root_path: root_str.clone(),
            full_path,
            name: entry.file_name().to_string_lossy().to_string(),
            size_bytes: meta.len(),
            created_at: created_secs(&meta),
            modified_at: modified_secs(&meta),
            file_key,
            identity_type,
            identity_value,
        };

        if tx.send(WalkItem::File(item)).is_err() {
            // Workers are gone; the scan is shutting down.
            return;
        }
    }
}

/// Root-relative path with forward slashes. `None` for the root itself.
fn relative_of(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let s = normalize_path(rel);
    if s.is_empty() { None } else { Some(s) }
}

#[cfg(unix)]
fn file_key_of(meta: &std::fs::Metadata) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    Some(format!("{}:{}", meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_key_of(_meta: &std::fs::Metadata) -> Option<String> {
    // No stable file key exposed; identity falls back to the path, which
    // makes moves indistinguishable from delete+create.
    None
}

#[cfg(unix)]
fn modified_secs(meta: &std::fs::Metadata) -> Option<i64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.mtime())
}

#[cfg(not(unix))]
fn modified_secs(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

fn created_secs(meta: &std::fs::Metadata) -> Option<i64> {
    meta.created()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

// ── Tests ────────────────────────────────────────────────────────────
