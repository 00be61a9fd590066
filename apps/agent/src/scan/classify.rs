//! Incremental classification against prior file state.

use crate::scan::types::{ChangeKind, FileMeta};
use crate::store::file_state::PrevState;

/// What the classifier decided for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: ChangeKind,
    pub needs_hash: bool,
    /// Prior content carried over for MOVED and UNCHANGED files.
    pub reuse_algo: Option<String>,
    pub reuse_hash: Option<String>,
    /// Detail recorded after the status in the change reason.
    pub reason_extra: Option<String>,
}

/// Decide NEW / MODIFIED / MOVED / UNCHANGED for `meta` given the prior state.
///
/// Size or mtime drift forces a rehash. A path change with identical size and
/// mtime is a move (only reachable with file-key identities) and reuses the
/// prior hash. Path comparison is case-insensitive so case-preserving
/// filesystems do not produce phantom moves.
pub fn classify(meta: &FileMeta, prev: Option<&PrevState>) -> Classification {
    let Some(prev) = prev else {
        return Classification {
            kind: ChangeKind::New,
            needs_hash: true,
            reuse_algo: None,
            reuse_hash: None,
            reason_extra: None,
        };
    };

    if prev.size_bytes != meta.size_bytes {
        return Classification {
            kind: ChangeKind::Modified,
            needs_hash: true,
            reuse_algo: None,
            reuse_hash: None,
            reason_extra: Some("size".to_string()),
        };
    }
    if prev.modified_at != meta.modified_at {
        return Classification {
            kind: ChangeKind::Modified,
            needs_hash: true,
            reuse_algo: None,
            reuse_hash: None,
            reason_extra: Some("mtime".to_string()),
        };
    }

    if !prev.known_path.eq_ignore_ascii_case(&meta.full_path) {
        return Classification {
            kind: ChangeKind::Moved,
            needs_hash: false,
            reuse_algo: prev.content_algo.clone(),
            reuse_hash: prev.content_hash.clone(),
            reason_extra: Some(prev.known_path.clone()),
        };
    }

    Classification {
        kind: ChangeKind::Unchanged,
        needs_hash: false,
        reuse_algo: prev.content_algo.clone(),
        reuse_hash: prev.content_hash.clone(),
        reason_extra: None,
    }
}

// ── Tests ────────────────────────────────────────────────────────────
