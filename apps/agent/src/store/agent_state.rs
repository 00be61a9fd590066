//! Agent state: device identity, pairing state, link state.
//!
//! Single-row JSON blobs inside the encrypted database, keyed by state key.
//! The transport layer reads and writes these through the typed accessors; the
//! engine itself never interprets them. A legacy JSON file from older agents
//! is imported once and deleted.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{StoreError, now_ms};

pub const KEY_DEVICE_IDENTITY: &str = "agent.device_identity";
pub const KEY_PAIRING_STATE: &str = "agent.pairing_state";
pub const KEY_LINK_STATE: &str = "agent.link_state";

// ── Typed state blobs ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub public_key: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingState {
    pub paired: bool,
    pub pairing_code: Option<String>,
    pub paired_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkState {
    pub linked: bool,
    pub server_url: Option<String>,
    pub last_seen_at: Option<i64>,
}

/// Shape of the legacy on-disk JSON file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyAgentState {
    device_identity: Option<DeviceIdentity>,
    pairing_state: Option<PairingState>,
    link_state: Option<LinkState>,
}

// ── Raw accessors ────────────────────────────────────────────────────

pub fn get_raw(conn: &Connection, state_key: &str) -> Result<Option<String>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT value_json FROM agent_state WHERE state_key = ?1")?;
    let row = stmt.query_row(params![state_key], |row| row.get(0)).optional()?;
    Ok(row)
}

pub fn put_raw(conn: &Connection, state_key: &str, value_json: &str) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO agent_state (state_key, value_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (state_key) DO UPDATE SET value_json = excluded.value_json,
                                               updated_at = excluded.updated_at",
    )?;
    stmt.execute(params![state_key, value_json, now_ms()])?;
    Ok(())
}

// ── Typed accessors ──────────────────────────────────────────────────

fn get_typed<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>, StoreError> {
    match get_raw(conn, key)? {
        Some(json) => match serde_json::from_str(&json) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::warn!("Ignoring malformed agent state for {key}: {e}");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

fn put_typed<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string(value)
        .map_err(|e| StoreError::Encryption(format!("serialize {key}: {e}")))?;
    put_raw(conn, key, &json)
}

pub fn get_device_identity(conn: &Connection) -> Result<Option<DeviceIdentity>, StoreError> {
    get_typed(conn, KEY_DEVICE_IDENTITY)
}

pub fn put_device_identity(conn: &Connection, value: &DeviceIdentity) -> Result<(), StoreError> {
    put_typed(conn, KEY_DEVICE_IDENTITY, value)
}

pub fn get_pairing_state(conn: &Connection) -> Result<Option<PairingState>, StoreError> {
    get_typed(conn, KEY_PAIRING_STATE)
}

pub fn put_pairing_state(conn: &Connection, value: &PairingState) -> Result<(), StoreError> {
    put_typed(conn, KEY_PAIRING_STATE, value)
}

pub fn get_link_state(conn: &Connection) -> Result<Option<LinkState>, StoreError> {
    get_typed(conn, KEY_LINK_STATE)
}

pub fn put_link_state(conn: &Connection, value: &LinkState) -> Result<(), StoreError> {
    put_typed(conn, KEY_LINK_STATE, value)
}

// ── Legacy migration ─────────────────────────────────────────────────

/// Import a legacy agent-state JSON file if no state rows exist yet.
///
/// Returns true when a migration happened. The legacy file is deleted after a
/// successful import so this runs at most once.
pub fn migrate_legacy(conn: &Connection, legacy_path: &Path) -> Result<bool, StoreError> {
    let any_row: i64 = conn.query_row("SELECT count(*) FROM agent_state", [], |row| row.get(0))?;
    if any_row > 0 || !legacy_path.is_file() {
        return Ok(false);
    }

    let raw = std::fs::read_to_string(legacy_path)?;
    let legacy: LegacyAgentState = match serde_json::from_str(&raw) {
        Ok(state) => state,
        Err(e) => {
            log::warn!("Legacy agent state at {} is malformed ({e}); leaving it in place", legacy_path.display());
            return Ok(false);
        }
    };

    if let Some(identity) = &legacy.device_identity {
        put_device_identity(conn, identity)?;
    }
    if let Some(pairing) = &legacy.pairing_state {
        put_pairing_state(conn, pairing)?;
    }
    if let Some(link) = &legacy.link_state {
        put_link_state(conn, link)?;
    }

    std::fs::remove_file(legacy_path)?;
    log::info!("Imported legacy agent state from {}", legacy_path.display());
    Ok(true)
}

// ── Tests ────────────────────────────────────────────────────────────
