//! Scan rows, per-scan summaries and the external-facing backup history.

use rusqlite::{Connection, OptionalExtension, params};

use super::{StoreError, now_ms};

/// Default and hard cap for backup-history listings.
pub const HISTORY_DEFAULT_LIMIT: usize = 20;
pub const HISTORY_MAX_LIMIT: usize = 200;

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "RUNNING",
            ScanStatus::Success => "SUCCESS",
            ScanStatus::Failed => "FAILED",
            ScanStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(ScanStatus::Running),
            "SUCCESS" => Some(ScanStatus::Success),
            "FAILED" => Some(ScanStatus::Failed),
            "CANCELLED" => Some(ScanStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRow {
    pub id: i64,
    pub root_path: String,
    pub dest_path: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: ScanStatus,
    pub error_message: Option<String>,
}

/// Aggregate counters upserted when a scan completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummaryRow {
    pub scan_id: i64,
    pub files_total: u64,
    pub bytes_scanned: u64,
    pub bytes_hashed: u64,
    pub new_count: u64,
    pub modified_count: u64,
    pub moved_count: u64,
    pub unchanged_count: u64,
    pub deleted_count: u64,
    pub walk_errors: u64,
    pub hash_errors: u64,
    pub skipped_size: u64,
    pub skipped_disabled: u64,
    pub db_retries: u64,
    pub issues_dropped: u64,
    pub db_lookup_hits: u64,
    pub db_lookup_miss: u64,
}

/// Row shape consumed by the `/history` endpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHistoryRow {
    pub id: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    /// OK | ERROR | RUNNING
    pub status: String,
    /// scan | restore
    pub backup_type: String,
    pub root_path: String,
    pub dest_path: String,
    pub files_processed: u64,
    pub errors: u64,
    pub scan_id: Option<i64>,
    pub message: Option<String>,
}

// ── Scan lifecycle ───────────────────────────────────────────────────

/// Insert a RUNNING scan row plus its backup-history entry; returns the scan id.
pub fn open_scan(conn: &Connection, root_path: &str, dest_path: &str) -> Result<i64, StoreError> {
    let started = now_ms();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO scans (root_path, dest_path, started_at, status) VALUES (?1, ?2, ?3, 'RUNNING')",
        params![root_path, dest_path, started],
    )?;
    let scan_id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO backup_history
             (started_at, status, backup_type, root_path, dest_path, scan_id)
         VALUES (?1, 'RUNNING', 'scan', ?2, ?3, ?4)",
        params![started, root_path, dest_path, scan_id],
    )?;
    tx.commit()?;
    Ok(scan_id)
}

/// Close a scan row. `finished_at` becomes non-null exactly here.
pub fn finish_scan(
    conn: &Connection,
    scan_id: i64,
    status: ScanStatus,
    error_message: Option<&str>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE scans SET status = ?2, finished_at = ?3, error_message = ?4 WHERE id = ?1",
        params![scan_id, status.as_str(), now_ms(), error_message],
    )?;
    Ok(())
}

pub fn get_scan(conn: &Connection, scan_id: i64) -> Result<Option<ScanRow>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, root_path, dest_path, started_at, finished_at, status, error_message
         FROM scans WHERE id = ?1",
    )?;
    let row = stmt
        .query_row(params![scan_id], |row| {
            let status: String = row.get(5)?;
            Ok(ScanRow {
                id: row.get(0)?,
                root_path: row.get(1)?,
                dest_path: row.get(2)?,
                started_at: row.get(3)?,
                finished_at: row.get(4)?,
                status: ScanStatus::parse(&status).unwrap_or(ScanStatus::Failed),
                error_message: row.get(6)?,
            })
        })
        .optional()?;
    Ok(row)
}

// ── Summary ──────────────────────────────────────────────────────────

pub fn upsert_summary(conn: &Connection, summary: &ScanSummaryRow) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO scan_summary
             (scan_id, files_total, bytes_scanned, bytes_hashed, new_count, modified_count,
              moved_count, unchanged_count, deleted_count, walk_errors, hash_errors,
              skipped_size, skipped_disabled, db_retries, issues_dropped,
              db_lookup_hits, db_lookup_miss)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            summary.scan_id,
            summary.files_total as i64,
            summary.bytes_scanned as i64,
            summary.bytes_hashed as i64,
            summary.new_count as i64,
            summary.modified_count as i64,
            summary.moved_count as i64,
            summary.unchanged_count as i64,
            summary.deleted_count as i64,
            summary.walk_errors as i64,
            summary.hash_errors as i64,
            summary.skipped_size as i64,
            summary.skipped_disabled as i64,
            summary.db_retries as i64,
            summary.issues_dropped as i64,
            summary.db_lookup_hits as i64,
            summary.db_lookup_miss as i64,
        ],
    )?;
    Ok(())
}

pub fn get_summary(conn: &Connection, scan_id: i64) -> Result<Option<ScanSummaryRow>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT scan_id, files_total, bytes_scanned, bytes_hashed, new_count, modified_count,
                moved_count, unchanged_count, deleted_count, walk_errors, hash_errors,
                skipped_size, skipped_disabled, db_retries, issues_dropped,
                db_lookup_hits, db_lookup_miss
         FROM scan_summary WHERE scan_id = ?1",
    )?;
    let row = stmt
        .query_row(params![scan_id], |row| {
            Ok(ScanSummaryRow {
                scan_id: row.get(0)?,
                files_total: row.get::<_, i64>(1)? as u64,
                bytes_scanned: row.get::<_, i64>(2)? as u64,
                bytes_hashed: row.get::<_, i64>(3)? as u64,
                new_count: row.get::<_, i64>(4)? as u64,
                modified_count: row.get::<_, i64>(5)? as u64,
                moved_count: row.get::<_, i64>(6)? as u64,
                unchanged_count: row.get::<_, i64>(7)? as u64,
                deleted_count: row.get::<_, i64>(8)? as u64,
                walk_errors: row.get::<_, i64>(9)? as u64,
                hash_errors: row.get::<_, i64>(10)? as u64,
                skipped_size: row.get::<_, i64>(11)? as u64,
                skipped_disabled: row.get::<_, i64>(12)? as u64,
                db_retries: row.get::<_, i64>(13)? as u64,
                issues_dropped: row.get::<_, i64>(14)? as u64,
                db_lookup_hits: row.get::<_, i64>(15)? as u64,
                db_lookup_miss: row.get::<_, i64>(16)? as u64,
            })
        })
        .optional()?;
    Ok(row)
}

// ── Backup history ───────────────────────────────────────────────────

/// Insert a RUNNING restore entry; returns the history row id.
pub fn open_restore_history(
    conn: &Connection,
    root_path: &str,
    dest_path: &str,
    scan_id: i64,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO backup_history
             (started_at, status, backup_type, root_path, dest_path, scan_id)
         VALUES (?1, 'RUNNING', 'restore', ?2, ?3, ?4)",
        params![now_ms(), root_path, dest_path, scan_id],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close a backup-history row by id.
pub fn finish_backup_history(
    conn: &Connection,
    history_id: i64,
    status: &str,
    files_processed: u64,
    errors: u64,
    message: Option<&str>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE backup_history
         SET status = ?2, finished_at = ?3, files_processed = ?4, errors = ?5, message = ?6
         WHERE id = ?1",
        params![history_id, status, now_ms(), files_processed as i64, errors as i64, message],
    )?;
    Ok(())
}

/// Close the backup-history row belonging to a scan.
pub fn finish_backup_history_for_scan(
    conn: &Connection,
    scan_id: i64,
    status: &str,
    files_processed: u64,
    errors: u64,
    message: Option<&str>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE backup_history
         SET status = ?2, finished_at = ?3, files_processed = ?4, errors = ?5, message = ?6
         WHERE scan_id = ?1 AND backup_type = 'scan'",
        params![scan_id, status, now_ms(), files_processed as i64, errors as i64, message],
    )?;
    Ok(())
}

/// Most recent history rows, newest first. `limit` is clamped to [1, 200];
/// `None` means the default of 20.
pub fn list_backup_history(
    conn: &Connection,
    limit: Option<usize>,
) -> Result<Vec<BackupHistoryRow>, StoreError> {
    let limit = limit.unwrap_or(HISTORY_DEFAULT_LIMIT).clamp(1, HISTORY_MAX_LIMIT);
    let mut stmt = conn.prepare_cached(
        "SELECT id, started_at, finished_at, status, backup_type, root_path, dest_path,
                files_processed, errors, scan_id, message
         FROM backup_history ORDER BY started_at DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], map_history_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn find_backup_history_by_id(
    conn: &Connection,
    history_id: i64,
) -> Result<Option<BackupHistoryRow>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, started_at, finished_at, status, backup_type, root_path, dest_path,
                files_processed, errors, scan_id, message
         FROM backup_history WHERE id = ?1",
    )?;
    let row = stmt.query_row(params![history_id], map_history_row).optional()?;
    Ok(row)
}

pub fn find_backup_history_by_scan(
    conn: &Connection,
    scan_id: i64,
) -> Result<Option<BackupHistoryRow>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, started_at, finished_at, status, backup_type, root_path, dest_path,
                files_processed, errors, scan_id, message
         FROM backup_history WHERE scan_id = ?1 AND backup_type = 'scan'",
    )?;
    let row = stmt.query_row(params![scan_id], map_history_row).optional()?;
    Ok(row)
}

fn map_history_row(row: &rusqlite::Row<'_>) -> Result<BackupHistoryRow, rusqlite::Error> {
    Ok(BackupHistoryRow {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        status: row.get(3)?,
        backup_type: row.get(4)?,
        root_path: row.get(5)?,
        dest_path: row.get(6)?,
        files_processed: row.get::<_, i64>(7)? as u64,
        errors: row.get::<_, i64>(8)? as u64,
        scan_id: row.get(9)?,
        message: row.get(10)?,
    })
}

// ── Crash recovery ───────────────────────────────────────────────────

/// Mark scans (and their history rows) that are still RUNNING but older than
/// `older_than_ms` as failed. Returns the number of scans recovered.
pub fn recover_stale_running(
    conn: &Connection,
    older_than_ms: i64,
    message: &str,
) -> Result<usize, StoreError> {
    let cutoff = now_ms() - older_than_ms;
    let tx = conn.unchecked_transaction()?;
    let recovered = tx.execute(
        "UPDATE scans SET status = 'FAILED', finished_at = ?1, error_message = ?2
         WHERE status = 'RUNNING' AND started_at < ?3",
        params![now_ms(), message, cutoff],
    )?;
    tx.execute(
        "UPDATE backup_history SET status = 'ERROR', finished_at = ?1, message = ?2
         WHERE status = 'RUNNING' AND started_at < ?3",
        params![now_ms(), message, cutoff],
    )?;
    tx.commit()?;
    Ok(recovered)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn test_conn() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Store::open(&dir.path().join("scans.keeply"), "secret", 1).expect("open");
        (store, dir)
    }

    #[test]
    fn open_and_finish_scan() {
        let (store, _dir) = test_conn();
        let conn = store.open_single_connection().unwrap();

        let id = open_scan(&conn, "/src", "/dst").unwrap();
        let row = get_scan(&conn, id).unwrap().unwrap();
        assert_eq!(row.status, ScanStatus::Running);
        assert!(row.finished_at.is_none());

        finish_scan(&conn, id, ScanStatus::Success, None).unwrap();
        let row = get_scan(&conn, id).unwrap().unwrap();
        assert_eq!(row.status, ScanStatus::Success);
        assert!(row.finished_at.is_some());
    }

    #[test]
    fn scan_ids_are_monotone() {
        let (store, _dir) = test_conn();
        let conn = store.open_single_connection().unwrap();
        let a = open_scan(&conn, "/src", "/dst").unwrap();
        let b = open_scan(&conn, "/src", "/dst").unwrap();
        assert!(b > a);
    }

    #[test]
    fn summary_upsert_roundtrip() {
        let (store, _dir) = test_conn();
        let conn = store.open_single_connection().unwrap();
        let id = open_scan(&conn, "/src", "/dst").unwrap();

        let summary = ScanSummaryRow {
            scan_id: id,
            files_total: 10,
            new_count: 4,
            modified_count: 3,
            unchanged_count: 3,
            bytes_scanned: 1234,
            ..Default::default()
        };
        upsert_summary(&conn, &summary).unwrap();
        assert_eq!(get_summary(&conn, id).unwrap().unwrap(), summary);

        // Re-upsert replaces.
        let updated = ScanSummaryRow {
            deleted_count: 1,
            ..summary.clone()
        };
        upsert_summary(&conn, &updated).unwrap();
        assert_eq!(get_summary(&conn, id).unwrap().unwrap().deleted_count, 1);
    }

    #[test]
    fn history_list_is_capped_and_newest_first() {
        let (store, _dir) = test_conn();
        let conn = store.open_single_connection().unwrap();

        for i in 0..25 {
            let id = open_scan(&conn, &format!("/src{i}"), "/dst").unwrap();
            finish_backup_history_for_scan(&conn, id, "OK", i, 0, None).unwrap();
        }

        let rows = list_backup_history(&conn, None).unwrap();
        assert_eq!(rows.len(), HISTORY_DEFAULT_LIMIT);
        assert_eq!(rows[0].root_path, "/src24");

        let rows = list_backup_history(&conn, Some(5)).unwrap();
        assert_eq!(rows.len(), 5);

        let rows = list_backup_history(&conn, Some(10_000)).unwrap();
        assert_eq!(rows.len(), 25, "hard cap applies but we only have 25 rows");
    }

    #[test]
    fn find_history_by_scan() {
        let (store, _dir) = test_conn();
        let conn = store.open_single_connection().unwrap();
        let id = open_scan(&conn, "/a", "/b").unwrap();
        finish_backup_history_for_scan(&conn, id, "OK", 7, 1, Some("done")).unwrap();

        let row = find_backup_history_by_scan(&conn, id).unwrap().unwrap();
        assert_eq!(row.status, "OK");
        assert_eq!(row.files_processed, 7);
        assert_eq!(row.errors, 1);
        assert_eq!(row.scan_id, Some(id));

        assert!(find_backup_history_by_scan(&conn, 9999).unwrap().is_none());
    }

    #[test]
    fn restore_history_rows() {
        let (store, _dir) = test_conn();
        let conn = store.open_single_connection().unwrap();
        let scan_id = open_scan(&conn, "/a", "/b").unwrap();

        let hist = open_restore_history(&conn, "/a", "/restore-target", scan_id).unwrap();
        finish_backup_history(&conn, hist, "OK", 12, 0, None).unwrap();

        let rows = list_backup_history(&conn, Some(10)).unwrap();
        let restore = rows.iter().find(|r| r.backup_type == "restore").unwrap();
        assert_eq!(restore.files_processed, 12);
        assert_eq!(restore.scan_id, Some(scan_id));
    }

    #[test]
    fn recover_stale_running_marks_old_rows() {
        let (store, _dir) = test_conn();
        let conn = store.open_single_connection().unwrap();

        let stale = open_scan(&conn, "/stale", "/dst").unwrap();
        // Backdate the stale scan by an hour.
        conn.execute(
            "UPDATE scans SET started_at = started_at - 3600000 WHERE id = ?1",
            params![stale],
        )
        .unwrap();
        conn.execute(
            "UPDATE backup_history SET started_at = started_at - 3600000 WHERE scan_id = ?1",
            params![stale],
        )
        .unwrap();
        let fresh = open_scan(&conn, "/fresh", "/dst").unwrap();

        let recovered = recover_stale_running(&conn, 10 * 60 * 1000, "stale job recovered on boot").unwrap();
        assert_eq!(recovered, 1);

        let stale_row = get_scan(&conn, stale).unwrap().unwrap();
        assert_eq!(stale_row.status, ScanStatus::Failed);
        assert_eq!(stale_row.error_message.as_deref(), Some("stale job recovered on boot"));

        let fresh_row = get_scan(&conn, fresh).unwrap().unwrap();
        assert_eq!(fresh_row.status, ScanStatus::Running);
    }
}
