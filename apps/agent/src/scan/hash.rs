//! Streaming SHA-256 with skip policy.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::store::file_state::HashStatus;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Hashing policy for one scan.
#[derive(Debug, Clone, Copy)]
pub struct HashPolicy {
    pub enabled: bool,
    pub max_bytes: u64,
}

/// Result of applying the policy to one file.
#[derive(Debug, Clone)]
pub struct HashOutcome {
    pub status: HashStatus,
    pub algo: Option<String>,
    pub hash_hex: Option<String>,
    /// Bytes actually read and hashed; zero when skipped.
    pub bytes_hashed: u64,
    pub error: Option<String>,
}

impl HashOutcome {
    fn skipped(status: HashStatus) -> Self {
        Self {
            status,
            algo: None,
            hash_hex: None,
            bytes_hashed: 0,
            error: None,
        }
    }
}

/// Hash `path` under `policy`. Never panics; I/O problems come back as
/// `HashStatus::Failed` with the error message for the issue log.
pub fn hash_file(path: &Path, size_bytes: u64, policy: &HashPolicy) -> HashOutcome {
    if !policy.enabled {
        return HashOutcome::skipped(HashStatus::Disabled);
    }
    if size_bytes > policy.max_bytes {
        return HashOutcome::skipped(HashStatus::SkippedSize);
    }

    match stream_sha256(path) {
        Ok((hash_hex, bytes_hashed)) => HashOutcome {
            status: HashStatus::Ok,
            algo: Some(keeply_cas::ALGO_SHA256.to_string()),
            hash_hex: Some(hash_hex),
            bytes_hashed,
            error: None,
        },
        Err(e) => HashOutcome {
            status: HashStatus::Failed,
            algo: None,
            hash_hex: None,
            bytes_hashed: 0,
            error: Some(e.to_string()),
        },
    }
}

fn stream_sha256(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

// ── Tests ────────────────────────────────────────────────────────────
