//! Session/preferences key-value store (`session.keeply`).
//!
//! A small unencrypted SQLite file next to the main database, consumed by the
//! transport layer for login sessions and UI preferences. Two tables with the
//! same shape: `session_kv` and `prefs_kv`.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use super::{StoreError, now_ms};

const CREATE_KV_SQL: &str = "
    CREATE TABLE IF NOT EXISTS session_kv (
        key        TEXT PRIMARY KEY,
        value      TEXT    NOT NULL,
        updated_at INTEGER NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS prefs_kv (
        key        TEXT PRIMARY KEY,
        value      TEXT    NOT NULL,
        updated_at INTEGER NOT NULL
    ) WITHOUT ROWID;
";

pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(CREATE_KV_SQL)?;
        Ok(Self { conn })
    }

    pub fn session_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.get("session_kv", key)
    }

    pub fn session_put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put("session_kv", key, value)
    }

    pub fn session_delete(&self, key: &str) -> Result<bool, StoreError> {
        self.delete("session_kv", key)
    }

    pub fn prefs_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.get("prefs_kv", key)
    }

    pub fn prefs_put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put("prefs_kv", key, value)
    }

    pub fn prefs_delete(&self, key: &str) -> Result<bool, StoreError> {
        self.delete("prefs_kv", key)
    }

    // Table names are the two compile-time constants above, never user input.
    fn get(&self, table: &str, key: &str) -> Result<Option<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT value FROM {table} WHERE key = ?1"))?;
        let row = stmt.query_row(params![key], |row| row.get(0)).optional()?;
        Ok(row)
    }

    fn put(&self, table: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "INSERT INTO {table} (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                                             updated_at = excluded.updated_at"
        ))?;
        stmt.execute(params![key, value, now_ms()])?;
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("DELETE FROM {table} WHERE key = ?1"))?;
        Ok(stmt.execute(params![key])? > 0)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SessionStore::open(&dir.path().join("session.keeply")).expect("open");
        (store, dir)
    }

    #[test]
    fn session_kv_roundtrip() {
        let (store, _dir) = open_temp();
        assert!(store.session_get("token").unwrap().is_none());
        store.session_put("token", "abc").unwrap();
        assert_eq!(store.session_get("token").unwrap().as_deref(), Some("abc"));
        store.session_put("token", "def").unwrap();
        assert_eq!(store.session_get("token").unwrap().as_deref(), Some("def"));
        assert!(store.session_delete("token").unwrap());
        assert!(store.session_get("token").unwrap().is_none());
    }

    #[test]
    fn prefs_are_separate_from_session() {
        let (store, _dir) = open_temp();
        store.session_put("shared-key", "session-value").unwrap();
        store.prefs_put("shared-key", "prefs-value").unwrap();
        assert_eq!(store.session_get("shared-key").unwrap().as_deref(), Some("session-value"));
        assert_eq!(store.prefs_get("shared-key").unwrap().as_deref(), Some("prefs-value"));
        assert!(!store.prefs_delete("missing").unwrap());
    }

    #[test]
    fn updated_at_advances_on_overwrite() {
        let (store, _dir) = open_temp();
        store.prefs_put("theme", "dark").unwrap();
        let first: i64 = store
            .conn
            .query_row("SELECT updated_at FROM prefs_kv WHERE key = 'theme'", [], |r| r.get(0))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.prefs_put("theme", "light").unwrap();
        let second: i64 = store
            .conn
            .query_row("SELECT updated_at FROM prefs_kv WHERE key = 'theme'", [], |r| r.get(0))
            .unwrap();
        assert!(second >= first);
    }
}
