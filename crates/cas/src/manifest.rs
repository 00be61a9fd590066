//! Per-scan manifests: newline-delimited JSON, one entry per file.
//!
//! A manifest lists every file the scan saw with a stored content hash, in
//! sorted `pathRel` order, and is written atomically. Restores read only the
//! manifest plus the blob tree; the database is not consulted.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{CasError, CasStore, temp_sibling};

/// One line of a scan manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Path relative to the scanned root, forward slashes.
    pub path_rel: String,
    pub algo: String,
    pub hash_hex: String,
    pub size_bytes: u64,
    /// Modification time, seconds since the epoch.
    pub modified_at: Option<i64>,
}

impl CasStore {
    /// Path of the manifest file for a scan.
    pub fn manifest_path(&self, scan_id: i64) -> PathBuf {
        self.root().join("manifests").join(format!("{scan_id}.ndjson"))
    }

    /// Atomically write the manifest for `scan_id`.
    ///
    /// Entries are sorted by `path_rel` before writing so the manifest is a
    /// deterministic function of the scanned tree.
    pub fn write_manifest(&self, scan_id: i64, entries: &[ManifestEntry]) -> Result<PathBuf, CasError> {
        let mut sorted: Vec<&ManifestEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.path_rel.cmp(&b.path_rel));

        let dest = self.manifest_path(scan_id);
        let parent = dest.parent().ok_or(CasError::ManifestMissing(scan_id))?;
        let tmp = temp_sibling(parent, &format!("{scan_id}.ndjson"));

        {
            let mut file = fs::File::create(&tmp)?;
            for entry in &sorted {
                let line = serde_json::to_string(entry).map_err(|e| CasError::ManifestLine {
                    line: 0,
                    message: e.to_string(),
                })?;
                writeln!(file, "{line}")?;
            }
            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&tmp, &dest) {
            let _ = fs::remove_file(&tmp);
            return Err(CasError::Io(e));
        }
        log::debug!("Wrote manifest for scan {scan_id}: {} entries", sorted.len());
        Ok(dest)
    }

    /// Read the manifest for `scan_id`, in file (sorted) order.
    pub fn read_manifest(&self, scan_id: i64) -> Result<Vec<ManifestEntry>, CasError> {
        let path = self.manifest_path(scan_id);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CasError::ManifestMissing(scan_id));
            }
            Err(e) => return Err(CasError::Io(e)),
        };

        let mut entries = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ManifestEntry =
                serde_json::from_str(&line).map_err(|e| CasError::ManifestLine {
                    line: idx + 1,
                    message: e.to_string(),
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Whether a manifest exists for the given scan.
    pub fn has_manifest(&self, scan_id: i64) -> bool {
        self.manifest_path(scan_id).is_file()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
