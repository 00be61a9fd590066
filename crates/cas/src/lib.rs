//! Content-addressed blob store for the backup agent.
//!
//! One blob per unique file content, addressed by hash under
//! `<root>/cas/<algo>/<xx>/<yy>/<hashHex>`. Blobs are written atomically
//! (temp sibling, fsync, rename) and are write-once: a second `put_content`
//! for the same hash is a no-op. Per-scan manifests live under
//! `<root>/manifests/` and are the authoritative record for restores.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

mod manifest;
mod restore;

pub use manifest::ManifestEntry;
pub use restore::{LogSink, RestoreMode, RestoreOutcome, restore_changed_files_from_scan};

/// The only content algorithm currently produced by the scan pipeline.
pub const ALGO_SHA256: &str = "SHA-256";

/// Monotonic suffix so concurrent writers never collide on a temp name.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CasError {
    Io(std::io::Error),
    /// Hash too short to shard into subdirectories.
    InvalidHash(String),
    /// Source file length did not match the recorded content size.
    SizeMismatch {
        hash_hex: String,
        expected: u64,
        actual: u64,
    },
    ManifestMissing(i64),
    ManifestLine {
        line: usize,
        message: String,
    },
}

impl From<std::io::Error> for CasError {
    fn from(err: std::io::Error) -> Self {
        CasError::Io(err)
    }
}

impl std::fmt::Display for CasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CasError::Io(e) => write!(f, "I/O error: {e}"),
            CasError::InvalidHash(h) => write!(f, "Invalid content hash: {h}"),
            CasError::SizeMismatch {
                hash_hex,
                expected,
                actual,
            } => {
                write!(f, "Size mismatch for {hash_hex}: expected {expected}, got {actual}")
            }
            CasError::ManifestMissing(scan_id) => write!(f, "No manifest for scan {scan_id}"),
            CasError::ManifestLine { line, message } => {
                write!(f, "Malformed manifest line {line}: {message}")
            }
        }
    }
}

impl std::error::Error for CasError {}

// ── CasStore ─────────────────────────────────────────────────────────

/// Handle to a blob store rooted at a destination directory.
pub struct CasStore {
    root: PathBuf,
}

impl CasStore {
    /// Open (or create) the blob store at `root`.
    ///
    /// Creates the `cas/` and `manifests/` directories if missing.
    pub fn open(root: &Path) -> Result<Self, CasError> {
        fs::create_dir_all(root.join("cas"))?;
        fs::create_dir_all(root.join("manifests"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the sharded path for a blob: `cas/<algo>/<xx>/<yy>/<hashHex>`.
    pub fn blob_path(&self, algo: &str, hash_hex: &str) -> Result<PathBuf, CasError> {
        if hash_hex.len() < 4 || !hash_hex.is_ascii() {
            return Err(CasError::InvalidHash(hash_hex.to_string()));
        }
        Ok(self
            .root
            .join("cas")
            .join(algo)
            .join(&hash_hex[0..2])
            .join(&hash_hex[2..4])
            .join(hash_hex))
    }

    /// Whether a blob for (algo, hash) already exists.
    pub fn has_blob(&self, algo: &str, hash_hex: &str) -> Result<bool, CasError> {
        Ok(self.blob_path(algo, hash_hex)?.is_file())
    }

    /// Store the content of `src` under (algo, hash).
    ///
    /// Idempotent: returns `Ok(false)` without touching disk when the blob
    /// already exists with the expected size. Otherwise copies to a temp
    /// sibling, fsyncs, and renames into place; a concurrent writer racing on
    /// the same hash cannot corrupt the blob because both rename complete
    /// files over the same target.
    pub fn put_content(
        &self,
        src: &Path,
        algo: &str,
        hash_hex: &str,
        size_bytes: u64,
    ) -> Result<bool, CasError> {
        let dest = self.blob_path(algo, hash_hex)?;
        if let Ok(meta) = fs::metadata(&dest)
            && meta.len() == size_bytes
        {
            return Ok(false);
        }

        let parent = dest
            .parent()
            .ok_or_else(|| CasError::InvalidHash(hash_hex.to_string()))?;
        fs::create_dir_all(parent)?;

        let tmp = temp_sibling(parent, hash_hex);
        let copied = fs::copy(src, &tmp)?;
        if copied != size_bytes {
            // The source changed between hashing and storing; leave no partial blob.
            let _ = fs::remove_file(&tmp);
            return Err(CasError::SizeMismatch {
                hash_hex: hash_hex.to_string(),
                expected: size_bytes,
                actual: copied,
            });
        }

        fs::File::options().write(true).open(&tmp)?.sync_all()?;

        match fs::rename(&tmp, &dest) {
            Ok(()) => Ok(true),
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                // Lost the race: another writer already renamed the same content.
                if dest.is_file() {
                    Ok(false)
                } else {
                    Err(CasError::Io(e))
                }
            }
        }
    }

    /// Size on disk of a stored blob, if present.
    pub fn blob_size(&self, algo: &str, hash_hex: &str) -> Result<Option<u64>, CasError> {
        match fs::metadata(self.blob_path(algo, hash_hex)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CasError::Io(e)),
        }
    }

    /// Count all blobs in the store. Walks the sharded tree; intended for
    /// tests and diagnostics, not hot paths.
    pub fn blob_count(&self) -> Result<u64, CasError> {
        fn walk(dir: &Path, count: &mut u64) -> std::io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let ty = entry.file_type()?;
                if ty.is_dir() {
                    walk(&entry.path(), count)?;
                } else if ty.is_file() {
                    *count += 1;
                }
            }
            Ok(())
        }
        let mut count = 0;
        walk(&self.root.join("cas"), &mut count)?;
        Ok(count)
    }
}

/// Unique temp path next to the final blob so `rename` stays on one filesystem.
fn temp_sibling(parent: &Path, stem: &str) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    parent.join(format!("{stem}.{}.{seq}.tmp", std::process::id()))
}

// ── Tests ────────────────────────────────────────────────────────────
