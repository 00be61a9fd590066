//! Restore traversal: rebuild a scanned tree from a manifest + blob store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use filetime::FileTime;

use crate::{CasError, CasStore, temp_sibling};

/// Where restored files are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Write each file back to `<originalRoot>/<pathRel>`.
    OriginalPath,
    /// Mirror the tree under a destination directory: `<destinationDir>/<pathRel>`.
    DestWithStructure,
}

impl RestoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMode::OriginalPath => "original",
            RestoreMode::DestWithStructure => "dest",
        }
    }
}

/// Counts returned by a restore run. On cancellation these reflect the work
/// completed so far.
#[derive(Debug, Clone, Default)]
pub struct RestoreOutcome {
    pub files_restored: u64,
    pub errors: u64,
    pub was_cancelled: bool,
}

/// Per-file progress/diagnostic lines for the caller (job log, CLI output).
pub type LogSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Restore every manifest entry of `scan_id` from the blob store at `base_dir`.
///
/// Per-file failures (missing blob, unwritable target) increment `errors` and
/// the traversal continues; only a missing manifest is fatal. Files are
/// materialized via temp sibling + rename and their mtime is reset from the
/// manifest.
pub fn restore_changed_files_from_scan(
    base_dir: &Path,
    scan_id: i64,
    original_root: &Path,
    destination_dir: Option<&Path>,
    mode: RestoreMode,
    cancel: &AtomicBool,
    log: LogSink<'_>,
) -> Result<RestoreOutcome, CasError> {
    let store = CasStore::open(base_dir)?;
    let entries = store.read_manifest(scan_id)?;
    log(&format!(
        "Restoring scan {scan_id}: {} entries, mode={}",
        entries.len(),
        mode.as_str()
    ));

    let mut outcome = RestoreOutcome::default();
    for entry in &entries {
        if cancel.load(Ordering::Relaxed) {
            log(&format!(
                "Restore cancelled after {} files ({} errors)",
                outcome.files_restored, outcome.errors
            ));
            outcome.was_cancelled = true;
            return Ok(outcome);
        }

        let target = match resolve_target(&entry.path_rel, original_root, destination_dir, mode) {
            Ok(t) => t,
            Err(msg) => {
                log(&format!("Skipping {}: {msg}", entry.path_rel));
                outcome.errors += 1;
                continue;
            }
        };

        match restore_one(&store, entry, &target) {
            Ok(()) => outcome.files_restored += 1,
            Err(e) => {
                log(&format!("Failed to restore {}: {e}", entry.path_rel));
                outcome.errors += 1;
            }
        }
    }

    log(&format!(
        "Restore of scan {scan_id} done: {} files, {} errors",
        outcome.files_restored, outcome.errors
    ));
    Ok(outcome)
}

/// Resolve the output path for one manifest entry.
fn resolve_target(
    path_rel: &str,
    original_root: &Path,
    destination_dir: Option<&Path>,
    mode: RestoreMode,
) -> Result<PathBuf, String> {
    // Relative paths come from our own manifests, but never follow one that
    // would escape the target root.
    if path_rel.split('/').any(|seg| seg == "..") || path_rel.starts_with('/') {
        return Err(format!("unsafe relative path: {path_rel}"));
    }
    match mode {
        RestoreMode::OriginalPath => Ok(original_root.join(path_rel)),
        RestoreMode::DestWithStructure => match destination_dir {
            Some(dir) => Ok(dir.join(path_rel)),
            None => Err("destination directory required for dest mode".to_string()),
        },
    }
}

/// Copy one blob into place: parents, temp sibling, mtime, rename.
fn restore_one(store: &CasStore, entry: &crate::ManifestEntry, target: &Path) -> Result<(), CasError> {
    let blob = store.blob_path(&entry.algo, &entry.hash_hex)?;
    let blob_len = match fs::metadata(&blob) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CasError::InvalidHash(format!(
                "missing blob {} for {}",
                entry.hash_hex, entry.path_rel
            )));
        }
        Err(e) => return Err(CasError::Io(e)),
    };
    if blob_len != entry.size_bytes {
        return Err(CasError::SizeMismatch {
            hash_hex: entry.hash_hex.clone(),
            expected: entry.size_bytes,
            actual: blob_len,
        });
    }

    let parent = target
        .parent()
        .ok_or_else(|| CasError::InvalidHash(entry.path_rel.clone()))?;
    fs::create_dir_all(parent)?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| entry.hash_hex.clone());
    let tmp = temp_sibling(parent, &name);
    if let Err(e) = fs::copy(&blob, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(CasError::Io(e));
    }
    if let Some(mtime) = entry.modified_at {
        let _ = filetime::set_file_mtime(&tmp, FileTime::from_unix_time(mtime, 0));
    }
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(CasError::Io(e));
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────
