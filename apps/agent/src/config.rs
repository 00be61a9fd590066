//! Agent configuration.
//!
//! A plain record threaded through construction of the store, blob store and
//! job controller. No process-wide state: whoever builds the agent decides
//! where the values come from. `from_env` covers the standalone binary, which
//! reads `KEEPLY_*` environment variables on top of the defaults.

use std::path::PathBuf;

/// Default database file name inside the data directory.
pub const DEFAULT_DB_NAME: &str = "data.keeply";

/// Session/preferences KV file name inside the data directory.
pub const SESSION_DB_NAME: &str = "session.keeply";

/// Legacy agent-state JSON file migrated into the database on first read.
pub const LEGACY_AGENT_STATE_FILE: &str = "agent-state.json";

#[derive(Debug, Clone)]
pub struct Config {
    /// Per-OS application data directory holding the databases.
    pub data_dir: PathBuf,
    /// Database file base name.
    pub db_name: String,
    /// Encryption secret for the inventory database. Mandatory: opening the
    /// database with an empty secret fails.
    pub secret_key: String,
    /// When set, the HTTP layer requires `Authorization: Bearer <token>`.
    pub api_token: Option<String>,
    pub bind_host: String,
    pub port: u16,
    /// Worker threads per scan. Clamped to 2..=32.
    pub scan_workers: usize,
    /// Writer buffer threshold before a batch is flushed.
    pub batch_limit: usize,
    /// Files larger than this are recorded without a content hash.
    pub hash_max_bytes: u64,
    /// Content hashing can be switched off entirely.
    pub hashing_enabled: bool,
    /// Cap on rows preloaded into the in-memory prior-state index.
    pub preload_index_max_rows: usize,
    /// Per-worker LRU size for on-demand prior-state lookups.
    pub lru_cache_size: usize,
    /// Connections in the writer pool.
    pub db_pool_size: usize,
    /// Capacity of the walker->worker and worker->writer channels.
    pub queue_capacity: usize,
    /// Exclusion globs matched against paths relative to the scan root.
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_name: DEFAULT_DB_NAME.to_string(),
            secret_key: String::new(),
            api_token: None,
            bind_host: "127.0.0.1".to_string(),
            port: 9821,
            scan_workers: default_workers(),
            batch_limit: 2_000,
            hash_max_bytes: 200 * 1024 * 1024,
            hashing_enabled: true,
            preload_index_max_rows: 500_000,
            lru_cache_size: 4_096,
            db_pool_size: 4,
            queue_capacity: 4_096,
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

impl Config {
    /// Build a config from `KEEPLY_*` environment variables over the defaults.
    ///
    /// Environment resolution (dotenv files, service managers) is the
    /// caller's concern; this only reads what is already in the process
    /// environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(dir) = env_var("KEEPLY_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(name) = env_var("KEEPLY_DB_NAME") {
            cfg.db_name = name;
        }
        if let Some(secret) = env_var("KEEPLY_SECRET_KEY") {
            cfg.secret_key = secret;
        }
        cfg.api_token = env_var("KEEPLY_API_TOKEN");
        if let Some(host) = env_var("KEEPLY_BIND_HOST") {
            cfg.bind_host = host;
        }
        if let Some(port) = env_parsed("KEEPLY_PORT") {
            cfg.port = port;
        }
        if let Some(n) = env_parsed("KEEPLY_SCAN_WORKERS") {
            cfg.scan_workers = n;
        }
        if let Some(n) = env_parsed("KEEPLY_BATCH_LIMIT") {
            cfg.batch_limit = n;
        }
        if let Some(n) = env_parsed("KEEPLY_HASH_MAX_BYTES") {
            cfg.hash_max_bytes = n;
        }
        if let Some(enabled) = env_parsed("KEEPLY_HASHING_ENABLED") {
            cfg.hashing_enabled = enabled;
        }
        if let Some(n) = env_parsed("KEEPLY_PRELOAD_INDEX_MAX_ROWS") {
            cfg.preload_index_max_rows = n;
        }
        if let Some(n) = env_parsed("KEEPLY_LRU_CACHE_SIZE") {
            cfg.lru_cache_size = n;
        }
        if let Some(n) = env_parsed("KEEPLY_DB_POOL_SIZE") {
            cfg.db_pool_size = n;
        }
        if let Some(n) = env_parsed("KEEPLY_QUEUE_CAPACITY") {
            cfg.queue_capacity = n;
        }
        if let Some(globs) = env_var("KEEPLY_EXCLUDE") {
            cfg.exclude_globs = globs
                .split(',')
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect();
        }
        cfg
    }

    /// Full path of the encrypted inventory database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_name)
    }

    /// Full path of the session/preferences KV database.
    pub fn session_db_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_DB_NAME)
    }

    /// Well-known path of the legacy agent-state JSON file.
    pub fn legacy_agent_state_path(&self) -> PathBuf {
        self.data_dir.join(LEGACY_AGENT_STATE_FILE)
    }

    /// Worker count clamped to the supported range.
    pub fn effective_workers(&self) -> usize {
        self.scan_workers.clamp(2, 32)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keeply")
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.parse().ok())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.db_name, "data.keeply");
        assert_eq!(cfg.batch_limit, 2_000);
        assert_eq!(cfg.hash_max_bytes, 200 * 1024 * 1024);
        assert!(cfg.effective_workers() >= 2);
        assert!(cfg.effective_workers() <= 32);
        assert!(cfg.hashing_enabled);
    }

    #[test]
    fn db_paths_live_under_data_dir() {
        let mut cfg = Config::default();
        cfg.data_dir = PathBuf::from("/tmp/keeply-test");
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/keeply-test/data.keeply"));
        assert_eq!(
            cfg.session_db_path(),
            PathBuf::from("/tmp/keeply-test/session.keeply")
        );
    }

    #[test]
    fn worker_clamp_bounds() {
        let mut cfg = Config::default();
        cfg.scan_workers = 1;
        assert_eq!(cfg.effective_workers(), 2);
        cfg.scan_workers = 128;
        assert_eq!(cfg.effective_workers(), 32);
        cfg.scan_workers = 8;
        assert_eq!(cfg.effective_workers(), 8);
    }
}
