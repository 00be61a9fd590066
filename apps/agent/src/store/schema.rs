//! Schema bootstrap for the inventory database.

use rusqlite::Connection;

use super::StoreError;

const SCHEMA_VERSION: &str = "1";

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS scans (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        root_path     TEXT    NOT NULL,
        dest_path     TEXT,
        started_at    INTEGER NOT NULL,
        finished_at   INTEGER,
        status        TEXT    NOT NULL,
        error_message TEXT
    );

    CREATE TABLE IF NOT EXISTS path (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        full_path TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS content (
        algo       TEXT    NOT NULL,
        hash_hex   TEXT    NOT NULL,
        size_bytes INTEGER NOT NULL,
        PRIMARY KEY (algo, hash_hex)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS file_state (
        root_path      TEXT    NOT NULL,
        identity_type  TEXT    NOT NULL,
        identity_value TEXT    NOT NULL,
        path_id        INTEGER NOT NULL REFERENCES path(id),
        file_key       TEXT,
        size_bytes     INTEGER NOT NULL,
        created_at     INTEGER,
        modified_at    INTEGER,
        content_algo   TEXT,
        content_hash   TEXT,
        hash_status    TEXT    NOT NULL DEFAULT 'NONE',
        status         TEXT    NOT NULL DEFAULT 'NEW',
        last_scan_id   INTEGER NOT NULL,
        PRIMARY KEY (root_path, identity_type, identity_value)
    );

    CREATE INDEX IF NOT EXISTS idx_file_state_last_scan
        ON file_state (root_path, last_scan_id);

    CREATE TABLE IF NOT EXISTS file_change (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_id        INTEGER NOT NULL,
        root_path      TEXT    NOT NULL,
        identity_type  TEXT    NOT NULL,
        identity_value TEXT    NOT NULL,
        size_bytes     INTEGER,
        modified_at    INTEGER,
        content_algo   TEXT,
        content_hash   TEXT,
        reason         TEXT    NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_file_change_scan ON file_change (scan_id);

    CREATE TABLE IF NOT EXISTS file_history (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_id      INTEGER NOT NULL,
        path_rel     TEXT    NOT NULL,
        hash_hex     TEXT,
        size_bytes   INTEGER NOT NULL,
        status_event TEXT    NOT NULL,
        created_at   INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_file_history_path
        ON file_history (path_rel, scan_id, created_at);

    CREATE TABLE IF NOT EXISTS scan_issue (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_id        INTEGER NOT NULL,
        stage          TEXT    NOT NULL,
        path           TEXT,
        identity_type  TEXT,
        identity_value TEXT,
        error_type     TEXT    NOT NULL,
        message        TEXT    NOT NULL,
        rule           TEXT,
        created_at     INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_scan_issue_scan ON scan_issue (scan_id);

    CREATE TABLE IF NOT EXISTS scan_summary (
        scan_id          INTEGER PRIMARY KEY,
        files_total      INTEGER NOT NULL DEFAULT 0,
        bytes_scanned    INTEGER NOT NULL DEFAULT 0,
        bytes_hashed     INTEGER NOT NULL DEFAULT 0,
        new_count        INTEGER NOT NULL DEFAULT 0,
        modified_count   INTEGER NOT NULL DEFAULT 0,
        moved_count      INTEGER NOT NULL DEFAULT 0,
        unchanged_count  INTEGER NOT NULL DEFAULT 0,
        deleted_count    INTEGER NOT NULL DEFAULT 0,
        walk_errors      INTEGER NOT NULL DEFAULT 0,
        hash_errors      INTEGER NOT NULL DEFAULT 0,
        skipped_size     INTEGER NOT NULL DEFAULT 0,
        skipped_disabled INTEGER NOT NULL DEFAULT 0,
        db_retries       INTEGER NOT NULL DEFAULT 0,
        issues_dropped   INTEGER NOT NULL DEFAULT 0,
        db_lookup_hits   INTEGER NOT NULL DEFAULT 0,
        db_lookup_miss   INTEGER NOT NULL DEFAULT 0
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS backup_history (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at      INTEGER NOT NULL,
        finished_at     INTEGER,
        status          TEXT    NOT NULL,
        backup_type     TEXT    NOT NULL,
        root_path       TEXT    NOT NULL,
        dest_path       TEXT    NOT NULL,
        files_processed INTEGER NOT NULL DEFAULT 0,
        errors          INTEGER NOT NULL DEFAULT 0,
        scan_id         INTEGER,
        message         TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_backup_history_started
        ON backup_history (started_at DESC);

    CREATE TABLE IF NOT EXISTS agent_state (
        state_key  TEXT PRIMARY KEY,
        value_json TEXT    NOT NULL,
        updated_at INTEGER NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

/// Create all tables and indexes. Idempotent; safe to call from several
/// connections concurrently (the busy timeout serializes the DDL).
pub fn init(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(CREATE_TABLES_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Read the stored schema version.
pub fn version(conn: &Connection) -> Result<Option<String>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT value FROM meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    match rows.next() {
        Some(Ok(v)) => Ok(Some(v)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

// ── Tests ────────────────────────────────────────────────────────────
