//! File-state snapshot, change log, history and issue accessors.
//!
//! `file_state` is the live per-root snapshot keyed by file identity;
//! `file_change` is the append-only change log; `file_history` the per-path
//! timeline of NEW/MODIFIED events. Deletion reconciliation is the only
//! operation that removes `file_state` rows.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension, params};

use super::{StoreError, now_ms};

// ── Value types ──────────────────────────────────────────────────────

/// How a file is identified across scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityType {
    /// OS-provided inode-like key; enables move detection.
    FileKey,
    /// Fallback when no file key is available.
    Path,
}

impl IdentityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityType::FileKey => "FILE_KEY",
            IdentityType::Path => "PATH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FILE_KEY" => Some(IdentityType::FileKey),
            "PATH" => Some(IdentityType::Path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStatus {
    None,
    Ok,
    SkippedSize,
    Disabled,
    Failed,
}

impl HashStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashStatus::None => "NONE",
            HashStatus::Ok => "OK",
            HashStatus::SkippedSize => "SKIPPED_SIZE",
            HashStatus::Disabled => "DISABLED",
            HashStatus::Failed => "FAILED",
        }
    }
}

/// `file_state.status` — drives the end-of-scan history snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateStatus {
    New,
    Modified,
    Stable,
}

impl StateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateStatus::New => "NEW",
            StateStatus::Modified => "MODIFIED",
            StateStatus::Stable => "STABLE",
        }
    }
}

/// Prior-state view used by the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct PrevState {
    pub size_bytes: u64,
    pub modified_at: Option<i64>,
    /// Full path the identity was last seen at.
    pub known_path: String,
    pub content_algo: Option<String>,
    pub content_hash: Option<String>,
}

/// Full upsert payload for one `file_state` row.
#[derive(Debug, Clone)]
pub struct FileStateUpsert {
    pub root_path: String,
    pub identity_type: IdentityType,
    pub identity_value: String,
    pub path_id: i64,
    pub file_key: Option<String>,
    pub size_bytes: u64,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub content_algo: Option<String>,
    pub content_hash: Option<String>,
    pub hash_status: HashStatus,
    pub status: StateStatus,
    pub last_scan_id: i64,
}

#[derive(Debug, Clone)]
pub struct FileChangeRow {
    pub scan_id: i64,
    pub root_path: String,
    pub identity_type: IdentityType,
    pub identity_value: String,
    pub size_bytes: Option<u64>,
    pub modified_at: Option<i64>,
    pub content_algo: Option<String>,
    pub content_hash: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStage {
    Walk,
    Hash,
    Db,
    Ignore,
}

impl IssueStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStage::Walk => "WALK",
            IssueStage::Hash => "HASH",
            IssueStage::Db => "DB",
            IssueStage::Ignore => "IGNORE",
        }
    }
}

/// One diagnostic row. Best-effort: the pipeline drops these under pressure.
#[derive(Debug, Clone)]
pub struct IssueRow {
    pub stage: IssueStage,
    pub path: Option<String>,
    pub identity_type: Option<IdentityType>,
    pub identity_value: Option<String>,
    pub error_type: String,
    pub message: String,
    pub rule: Option<String>,
}

/// A changed file joined back to its current path; source for blob copies.
#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub full_path: String,
    pub path_rel: String,
    pub content_algo: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub modified_at: Option<i64>,
}

/// One manifest entry source row (every hashed file the scan touched).
#[derive(Debug, Clone)]
pub struct ManifestSourceRow {
    pub path_rel: String,
    pub content_algo: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub modified_at: Option<i64>,
}

// ── Prior-state lookups ──────────────────────────────────────────────

/// 1-based character position where the root-relative part of a full path
/// starts (for SQL `substr`). Works for "/" roots too.
fn rel_start(root_path: &str) -> i64 {
    (root_path.trim_end_matches('/').len() + 2) as i64
}

/// Load the prior `file_state` snapshot for a root, up to `max_rows` rows.
///
/// Returns `(map, truncated)`. When `truncated` is true the caller MUST skip
/// deletion reconciliation: absent keys can simply mean "not loaded".
pub fn load_index_snapshot(
    conn: &Connection,
    root_path: &str,
    max_rows: usize,
) -> Result<(HashMap<(IdentityType, String), PrevState>, bool), StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT fs.identity_type, fs.identity_value, fs.size_bytes, fs.modified_at,
                p.full_path, fs.content_algo, fs.content_hash
         FROM file_state fs JOIN path p ON p.id = fs.path_id
         WHERE fs.root_path = ?1
         LIMIT ?2",
    )?;
    // Fetch one extra row to detect truncation.
    let rows = stmt.query_map(params![root_path, (max_rows + 1) as i64], |row| {
        let itype: String = row.get(0)?;
        Ok((
            itype,
            row.get::<_, String>(1)?,
            PrevState {
                size_bytes: row.get::<_, i64>(2)? as u64,
                modified_at: row.get(3)?,
                known_path: row.get(4)?,
                content_algo: row.get(5)?,
                content_hash: row.get(6)?,
            },
        ))
    })?;

    let mut map = HashMap::new();
    let mut truncated = false;
    for row in rows {
        let (itype, ivalue, prev) = row?;
        if map.len() >= max_rows {
            truncated = true;
            break;
        }
        let itype = IdentityType::parse(&itype).unwrap_or(IdentityType::Path);
        map.insert((itype, ivalue), prev);
    }
    Ok((map, truncated))
}

/// Point lookup for one identity; the fallback path of the hybrid index.
pub fn find_prev(
    conn: &Connection,
    root_path: &str,
    identity_type: IdentityType,
    identity_value: &str,
) -> Result<Option<PrevState>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT fs.size_bytes, fs.modified_at, p.full_path, fs.content_algo, fs.content_hash
         FROM file_state fs JOIN path p ON p.id = fs.path_id
         WHERE fs.root_path = ?1 AND fs.identity_type = ?2 AND fs.identity_value = ?3",
    )?;
    let row = stmt
        .query_row(params![root_path, identity_type.as_str(), identity_value], |row| {
            Ok(PrevState {
                size_bytes: row.get::<_, i64>(0)? as u64,
                modified_at: row.get(1)?,
                known_path: row.get(2)?,
                content_algo: row.get(3)?,
                content_hash: row.get(4)?,
            })
        })
        .optional()?;
    Ok(row)
}

// ── Writes (used inside writer batches) ──────────────────────────────

/// Resolve or create the id for a full path.
pub fn resolve_path_id(conn: &Connection, full_path: &str) -> Result<i64, StoreError> {
    let mut insert = conn.prepare_cached("INSERT OR IGNORE INTO path (full_path) VALUES (?1)")?;
    insert.execute(params![full_path])?;
    let mut select = conn.prepare_cached("SELECT id FROM path WHERE full_path = ?1")?;
    let id = select.query_row(params![full_path], |row| row.get(0))?;
    Ok(id)
}

/// Record deduplicated content; idempotent.
pub fn upsert_content(conn: &Connection, algo: &str, hash_hex: &str, size_bytes: u64) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO content (algo, hash_hex, size_bytes) VALUES (?1, ?2, ?3)",
    )?;
    stmt.execute(params![algo, hash_hex, size_bytes as i64])?;
    Ok(())
}

pub fn upsert_file_state(conn: &Connection, row: &FileStateUpsert) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO file_state
             (root_path, identity_type, identity_value, path_id, file_key, size_bytes,
              created_at, modified_at, content_algo, content_hash, hash_status, status,
              last_scan_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT (root_path, identity_type, identity_value) DO UPDATE SET
             path_id = excluded.path_id,
             file_key = excluded.file_key,
             size_bytes = excluded.size_bytes,
             created_at = excluded.created_at,
             modified_at = excluded.modified_at,
             content_algo = excluded.content_algo,
             content_hash = excluded.content_hash,
             hash_status = excluded.hash_status,
             status = excluded.status,
             last_scan_id = excluded.last_scan_id",
    )?;
    stmt.execute(params![
        row.root_path,
        row.identity_type.as_str(),
        row.identity_value,
        row.path_id,
        row.file_key,
        row.size_bytes as i64,
        row.created_at,
        row.modified_at,
        row.content_algo,
        row.content_hash,
        row.hash_status.as_str(),
        row.status.as_str(),
        row.last_scan_id,
    ])?;
    Ok(())
}

/// Touch: advance `last_scan_id` on an otherwise unchanged row.
pub fn touch_file_state(
    conn: &Connection,
    root_path: &str,
    identity_type: IdentityType,
    identity_value: &str,
    scan_id: i64,
) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare_cached(
        "UPDATE file_state SET last_scan_id = ?4
         WHERE root_path = ?1 AND identity_type = ?2 AND identity_value = ?3",
    )?;
    let n = stmt.execute(params![root_path, identity_type.as_str(), identity_value, scan_id])?;
    Ok(n > 0)
}

pub fn append_file_change(conn: &Connection, row: &FileChangeRow) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO file_change
             (scan_id, root_path, identity_type, identity_value, size_bytes, modified_at,
              content_algo, content_hash, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    stmt.execute(params![
        row.scan_id,
        row.root_path,
        row.identity_type.as_str(),
        row.identity_value,
        row.size_bytes.map(|v| v as i64),
        row.modified_at,
        row.content_algo,
        row.content_hash,
        row.reason,
    ])?;
    Ok(())
}

/// Serialize a batch of issues; `created_at` is stamped here.
pub fn insert_issue_batch(conn: &Connection, scan_id: i64, issues: &[IssueRow]) -> Result<(), StoreError> {
    if issues.is_empty() {
        return Ok(());
    }
    let created = now_ms();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO scan_issue
             (scan_id, stage, path, identity_type, identity_value, error_type, message, rule,
              created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for issue in issues {
        stmt.execute(params![
            scan_id,
            issue.stage.as_str(),
            issue.path,
            issue.identity_type.map(|t| t.as_str()),
            issue.identity_value,
            issue.error_type,
            issue.message,
            issue.rule,
            created,
        ])?;
    }
    Ok(())
}

// ── End-of-scan operations ───────────────────────────────────────────

/// Deletion reconciliation: log and remove every row for `root_path` that the
/// scan did not touch. Returns the number of deletions.
pub fn delete_stale_files(conn: &Connection, scan_id: i64, root_path: &str) -> Result<u64, StoreError> {
    let tx = conn.unchecked_transaction()?;
    let logged = tx.execute(
        "INSERT INTO file_change
             (scan_id, root_path, identity_type, identity_value, size_bytes, modified_at,
              content_algo, content_hash, reason)
         SELECT ?1, root_path, identity_type, identity_value, size_bytes, modified_at,
                content_algo, content_hash, 'DELETED'
         FROM file_state WHERE root_path = ?2 AND last_scan_id < ?1",
        params![scan_id, root_path],
    )?;
    let removed = tx.execute(
        "DELETE FROM file_state WHERE root_path = ?2 AND last_scan_id < ?1",
        params![scan_id, root_path],
    )?;
    tx.commit()?;
    debug_assert_eq!(logged, removed);
    Ok(removed as u64)
}

/// Copy this scan's NEW/MODIFIED rows into `file_history` and reset their
/// status to STABLE. Returns the number of history rows written.
pub fn snapshot_to_history(conn: &Connection, scan_id: i64, root_path: &str) -> Result<u64, StoreError> {
    let start = rel_start(root_path);
    let tx = conn.unchecked_transaction()?;
    let copied = tx.execute(
        "INSERT INTO file_history (scan_id, path_rel, hash_hex, size_bytes, status_event, created_at)
         SELECT fs.last_scan_id, substr(p.full_path, ?3), fs.content_hash, fs.size_bytes,
                fs.status, ?4
         FROM file_state fs JOIN path p ON p.id = fs.path_id
         WHERE fs.root_path = ?2 AND fs.last_scan_id = ?1
           AND fs.status IN ('NEW', 'MODIFIED')",
        params![scan_id, root_path, start, now_ms()],
    )?;
    tx.execute(
        "UPDATE file_state SET status = 'STABLE'
         WHERE root_path = ?2 AND last_scan_id = ?1 AND status IN ('NEW', 'MODIFIED')",
        params![scan_id, root_path],
    )?;
    tx.commit()?;
    Ok(copied as u64)
}

/// Every hashed file the scan touched, for the manifest. Sorted by path.
pub fn manifest_entries_for_scan(
    conn: &Connection,
    scan_id: i64,
    root_path: &str,
) -> Result<Vec<ManifestSourceRow>, StoreError> {
    let start = rel_start(root_path);
    let mut stmt = conn.prepare_cached(
        "SELECT substr(p.full_path, ?3), fs.content_algo, fs.content_hash, fs.size_bytes,
                fs.modified_at
         FROM file_state fs JOIN path p ON p.id = fs.path_id
         WHERE fs.root_path = ?2 AND fs.last_scan_id = ?1 AND fs.content_hash IS NOT NULL
         ORDER BY p.full_path",
    )?;
    let rows = stmt.query_map(params![scan_id, root_path, start], |row| {
        Ok(ManifestSourceRow {
            path_rel: row.get(0)?,
            content_algo: row.get(1)?,
            content_hash: row.get(2)?,
            size_bytes: row.get::<_, i64>(3)? as u64,
            modified_at: row.get(4)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// Files this scan classified NEW or MODIFIED, joined to their current path;
/// these are the contents the blob store still needs.
pub fn changed_files_for_scan(
    conn: &Connection,
    scan_id: i64,
    root_path: &str,
) -> Result<Vec<ChangedFile>, StoreError> {
    let start = rel_start(root_path);
    let mut stmt = conn.prepare_cached(
        "SELECT p.full_path, substr(p.full_path, ?3), fs.content_algo, fs.content_hash,
                fs.size_bytes, fs.modified_at
         FROM file_change fc
         JOIN file_state fs ON fs.root_path = fc.root_path
                           AND fs.identity_type = fc.identity_type
                           AND fs.identity_value = fc.identity_value
         JOIN path p ON p.id = fs.path_id
         WHERE fc.scan_id = ?1 AND fc.root_path = ?2
           AND (fc.reason LIKE 'NEW%' OR fc.reason LIKE 'MODIFIED%')
           AND fs.content_hash IS NOT NULL
         ORDER BY p.full_path",
    )?;
    let rows = stmt.query_map(params![scan_id, root_path, start], |row| {
        Ok(ChangedFile {
            full_path: row.get(0)?,
            path_rel: row.get(1)?,
            content_algo: row.get(2)?,
            content_hash: row.get(3)?,
            size_bytes: row.get::<_, i64>(4)? as u64,
            modified_at: row.get(5)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ── Read helpers (tests, diagnostics) ────────────────────────────────

pub fn count_file_state(conn: &Connection, root_path: &str) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT count(*) FROM file_state WHERE root_path = ?1",
        params![root_path],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// All change-log reasons for a scan, for assertions and debugging.
pub fn change_reasons_for_scan(conn: &Connection, scan_id: i64) -> Result<Vec<String>, StoreError> {
    let mut stmt =
        conn.prepare_cached("SELECT reason FROM file_change WHERE scan_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![scan_id], |row| row.get(0))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// History events for one relative path, ordered by scan then time.
pub fn history_for_path(
    conn: &Connection,
    path_rel: &str,
) -> Result<Vec<(i64, String)>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT scan_id, status_event FROM file_history
         WHERE path_rel = ?1 ORDER BY scan_id, created_at",
    )?;
    let rows = stmt.query_map(params![path_rel], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ── Tests ────────────────────────────────────────────────────────────
