//! Shared per-scan counters, atomically updated by every pipeline stage.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::store::scans::ScanSummaryRow;

#[derive(Debug, Default)]
pub struct ScanMetrics {
    pub files_total: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub bytes_hashed: AtomicU64,
    pub new_count: AtomicU64,
    pub modified_count: AtomicU64,
    pub moved_count: AtomicU64,
    pub unchanged_count: AtomicU64,
    pub deleted_count: AtomicU64,
    pub walk_errors: AtomicU64,
    pub hash_errors: AtomicU64,
    pub skipped_size: AtomicU64,
    pub skipped_disabled: AtomicU64,
    pub db_retries: AtomicU64,
    pub issues_dropped: AtomicU64,
    pub db_lookup_hits: AtomicU64,
    pub db_lookup_miss: AtomicU64,
    /// Subtrees skipped by exclusion rules; not part of the summary row.
    pub dirs_skipped: AtomicU64,
}

impl ScanMetrics {
    pub fn add(field: &AtomicU64, n: u64) {
        field.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bump(field: &AtomicU64) {
        field.fetch_add(1, Ordering::Relaxed);
    }

    /// Freeze the counters into the summary row for `scan_id`.
    pub fn to_summary(&self, scan_id: i64) -> ScanSummaryRow {
        let get = |field: &AtomicU64| field.load(Ordering::Relaxed);
        ScanSummaryRow {
            scan_id,
            files_total: get(&self.files_total),
            bytes_scanned: get(&self.bytes_scanned),
            bytes_hashed: get(&self.bytes_hashed),
            new_count: get(&self.new_count),
            modified_count: get(&self.modified_count),
            moved_count: get(&self.moved_count),
            unchanged_count: get(&self.unchanged_count),
            deleted_count: get(&self.deleted_count),
            walk_errors: get(&self.walk_errors),
            hash_errors: get(&self.hash_errors),
            skipped_size: get(&self.skipped_size),
            skipped_disabled: get(&self.skipped_disabled),
            db_retries: get(&self.db_retries),
            issues_dropped: get(&self.issues_dropped),
            db_lookup_hits: get(&self.db_lookup_hits),
            db_lookup_miss: get(&self.db_lookup_miss),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reflects_counters() {
        let metrics = ScanMetrics::default();
        ScanMetrics::add(&metrics.files_total, 10);
        ScanMetrics::bump(&metrics.new_count);
        ScanMetrics::bump(&metrics.new_count);
        ScanMetrics::add(&metrics.bytes_scanned, 512);

        let summary = metrics.to_summary(9);
        assert_eq!(summary.scan_id, 9);
        assert_eq!(summary.files_total, 10);
        assert_eq!(summary.new_count, 2);
        assert_eq!(summary.bytes_scanned, 512);
        assert_eq!(summary.deleted_count, 0);
    }
}
