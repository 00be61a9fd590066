//! End-to-end scan/restore scenarios against real temp directories.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use keeply_cas::{CasStore, RestoreMode, restore_changed_files_from_scan};

use crate::config::Config;
use crate::scan::{ScanOutcome, run_scan};
use crate::store::scans::ScanStatus;
use crate::store::{Store, file_state};

const SHA_HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
const SHA_WORLD: &str = "486ea46224d1bb4fb680f34f7c9ad96a8f24ec88be73ea8e5a6c65260e9cb8a7";

struct Fixture {
    store: Store,
    config: Config,
    root: std::path::PathBuf,
    dest: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let root = dir.path().join("root");
    let dest = dir.path().join("dest");
    fs::create_dir_all(&root).unwrap();

    let mut config = Config::default();
    config.data_dir = dir.path().join("data");
    config.secret_key = "test-secret".to_string();
    config.scan_workers = 2;
    config.db_pool_size = 2;

    let store = Store::open(&config.db_path(), &config.secret_key, config.db_pool_size).unwrap();
    Fixture {
        store,
        config,
        root,
        dest,
        _dir: dir,
    }
}

fn scan(fx: &Fixture) -> ScanOutcome {
    run_scan(
        &fx.store,
        &fx.config,
        &fx.root,
        &fx.dest,
        Arc::new(AtomicBool::new(false)),
    )
    .expect("scan failed")
}

fn blob_count(fx: &Fixture) -> u64 {
    CasStore::open(&fx.dest).unwrap().blob_count().unwrap()
}

#[test]
fn empty_root_scans_clean() {
    let fx = fixture();
    let outcome = scan(&fx);

    assert_eq!(outcome.status, ScanStatus::Success);
    assert_eq!(outcome.summary.files_total, 0);

    let cas = CasStore::open(&fx.dest).unwrap();
    assert!(cas.has_manifest(outcome.scan_id));
    assert!(cas.read_manifest(outcome.scan_id).unwrap().is_empty());

    // Restoring an empty scan restores nothing.
    let cancel = AtomicBool::new(false);
    let sink = |_: &str| {};
    let restored = restore_changed_files_from_scan(
        &fx.dest,
        outcome.scan_id,
        &fx.root,
        None,
        RestoreMode::OriginalPath,
        &cancel,
        &sink,
    )
    .unwrap();
    assert_eq!(restored.files_restored, 0);
    assert_eq!(restored.errors, 0);
}

#[test]
fn fresh_files_are_new_and_deduplicated_into_cas() {
    let fx = fixture();
    fs::write(fx.root.join("a.txt"), "hello").unwrap();
    fs::write(fx.root.join("b.txt"), "world").unwrap();

    let outcome = scan(&fx);
    assert_eq!(outcome.status, ScanStatus::Success);
    assert_eq!(outcome.summary.files_total, 2);
    assert_eq!(outcome.summary.new_count, 2);
    assert_eq!(outcome.summary.unchanged_count, 0);

    // Exactly the two content blobs, byte-identical to the sources.
    let cas = CasStore::open(&fx.dest).unwrap();
    assert_eq!(cas.blob_count().unwrap(), 2);
    let hello_blob = cas.blob_path("SHA-256", SHA_HELLO).unwrap();
    let world_blob = cas.blob_path("SHA-256", SHA_WORLD).unwrap();
    assert_eq!(fs::read(hello_blob).unwrap(), b"hello");
    assert_eq!(fs::read(world_blob).unwrap(), b"world");

    // Two NEW history rows.
    let conn = fx.store.open_read_connection().unwrap();
    assert_eq!(
        file_state::history_for_path(&conn, "a.txt").unwrap(),
        vec![(outcome.scan_id, "NEW".to_string())]
    );
    assert_eq!(
        file_state::history_for_path(&conn, "b.txt").unwrap(),
        vec![(outcome.scan_id, "NEW".to_string())]
    );
}

#[test]
fn rescan_without_changes_is_idempotent() {
    let fx = fixture();
    fs::write(fx.root.join("a.txt"), "hello").unwrap();
    fs::write(fx.root.join("b.txt"), "world").unwrap();

    let first = scan(&fx);
    let second = scan(&fx);

    assert_eq!(second.summary.unchanged_count, 2);
    assert_eq!(second.summary.new_count, 0);
    assert_eq!(second.summary.modified_count, 0);

    // Zero change rows and zero new blobs for the second scan.
    let conn = fx.store.open_read_connection().unwrap();
    assert!(file_state::change_reasons_for_scan(&conn, second.scan_id).unwrap().is_empty());
    assert_eq!(blob_count(&fx), 2);

    // The second manifest still describes the full tree.
    let cas = CasStore::open(&fx.dest).unwrap();
    assert_eq!(cas.read_manifest(second.scan_id).unwrap().len(), 2);
    assert!(second.scan_id > first.scan_id);
}

#[test]
fn modified_file_is_rehashed_and_stored() {
    let fx = fixture();
    fs::write(fx.root.join("a.txt"), "hello").unwrap();
    fs::write(fx.root.join("b.txt"), "world").unwrap();
    scan(&fx);

    fs::write(fx.root.join("a.txt"), "hello!!").unwrap();
    let outcome = scan(&fx);

    assert_eq!(outcome.summary.modified_count, 1);
    assert_eq!(outcome.summary.unchanged_count, 1);
    assert_eq!(blob_count(&fx), 3, "old blob retained, new content added");

    let conn = fx.store.open_read_connection().unwrap();
    let reasons = file_state::change_reasons_for_scan(&conn, outcome.scan_id).unwrap();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].starts_with("MODIFIED"), "got {reasons:?}");

    // History gains a MODIFIED event for a.txt.
    let history = file_state::history_for_path(&conn, "a.txt").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1], (outcome.scan_id, "MODIFIED".to_string()));
}

#[cfg(unix)]
#[test]
fn renamed_file_is_a_move_with_hash_reuse() {
    let fx = fixture();
    fs::write(fx.root.join("a.txt"), "hello").unwrap();
    fs::write(fx.root.join("b.txt"), "world").unwrap();
    scan(&fx);

    fs::create_dir_all(fx.root.join("sub")).unwrap();
    fs::rename(fx.root.join("a.txt"), fx.root.join("sub/a.txt")).unwrap();
    let outcome = scan(&fx);

    assert_eq!(outcome.summary.moved_count, 1);
    assert_eq!(outcome.summary.unchanged_count, 1);
    assert_eq!(outcome.summary.new_count, 0);
    assert_eq!(outcome.summary.deleted_count, 0);
    assert_eq!(blob_count(&fx), 2, "no new blob for a move");

    let conn = fx.store.open_read_connection().unwrap();
    let reasons = file_state::change_reasons_for_scan(&conn, outcome.scan_id).unwrap();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].starts_with("MOVED"), "got {reasons:?}");

    // The moved row kept its content hash.
    let hash: String = conn
        .query_row(
            "SELECT fs.content_hash FROM file_state fs JOIN path p ON p.id = fs.path_id
             WHERE p.full_path LIKE '%sub/a.txt'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(hash, SHA_HELLO);
}

#[test]
fn deleted_file_is_reconciled_but_blob_retained() {
    let fx = fixture();
    fs::write(fx.root.join("a.txt"), "hello").unwrap();
    fs::write(fx.root.join("b.txt"), "world").unwrap();
    scan(&fx);

    fs::remove_file(fx.root.join("b.txt")).unwrap();
    let outcome = scan(&fx);

    assert_eq!(outcome.summary.deleted_count, 1);
    assert_eq!(outcome.summary.unchanged_count, 1);

    let conn = fx.store.open_read_connection().unwrap();
    let reasons = file_state::change_reasons_for_scan(&conn, outcome.scan_id).unwrap();
    assert_eq!(reasons, vec!["DELETED".to_string()]);
    assert_eq!(
        file_state::count_file_state(&conn, &crate::scan::types::normalize_path(&fx.root)).unwrap(),
        1,
        "b.txt's row is gone"
    );

    // No GC: the content of b.txt stays in the store.
    let cas = CasStore::open(&fx.dest).unwrap();
    assert!(cas.has_blob("SHA-256", SHA_WORLD).unwrap());
}

#[test]
fn restore_reproduces_the_scanned_tree() {
    let fx = fixture();
    fs::write(fx.root.join("a.txt"), "hello").unwrap();
    fs::write(fx.root.join("b.txt"), "world").unwrap();
    let outcome = scan(&fx);

    let target = fx._dir.path().join("restored");
    let cancel = AtomicBool::new(false);
    let sink = |_: &str| {};
    let restored = restore_changed_files_from_scan(
        &fx.dest,
        outcome.scan_id,
        &fx.root,
        Some(&target),
        RestoreMode::DestWithStructure,
        &cancel,
        &sink,
    )
    .unwrap();

    assert_eq!(restored.files_restored, 2);
    assert_eq!(restored.errors, 0);
    assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"hello");
    assert_eq!(fs::read(target.join("b.txt")).unwrap(), b"world");
}

#[test]
fn restore_prior_snapshot_after_later_changes() {
    let fx = fixture();
    fs::write(fx.root.join("a.txt"), "hello").unwrap();
    fs::write(fx.root.join("b.txt"), "world").unwrap();
    let first = scan(&fx);

    // Mutate the tree and scan again; the first manifest must still restore.
    fs::write(fx.root.join("a.txt"), "changed completely").unwrap();
    fs::remove_file(fx.root.join("b.txt")).unwrap();
    scan(&fx);

    let target = fx._dir.path().join("pit");
    let cancel = AtomicBool::new(false);
    let sink = |_: &str| {};
    let restored = restore_changed_files_from_scan(
        &fx.dest,
        first.scan_id,
        &fx.root,
        Some(&target),
        RestoreMode::DestWithStructure,
        &cancel,
        &sink,
    )
    .unwrap();

    assert_eq!(restored.files_restored, 2);
    assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"hello");
    assert_eq!(fs::read(target.join("b.txt")).unwrap(), b"world");
}

#[test]
fn truncated_index_skips_deletion_reconciliation() {
    let mut fx = fixture();
    fs::write(fx.root.join("a.txt"), "hello").unwrap();
    fs::write(fx.root.join("b.txt"), "world").unwrap();
    scan(&fx);

    // Prior state has 2 rows; cap the preload below that and delete a file.
    fx.config.preload_index_max_rows = 1;
    fs::remove_file(fx.root.join("b.txt")).unwrap();
    let outcome = scan(&fx);

    assert_eq!(outcome.summary.deleted_count, 0);
    let conn = fx.store.open_read_connection().unwrap();
    let reasons = file_state::change_reasons_for_scan(&conn, outcome.scan_id).unwrap();
    assert!(
        !reasons.iter().any(|r| r == "DELETED"),
        "truncation must suppress deletions, got {reasons:?}"
    );
}

#[test]
fn summary_counters_are_consistent() {
    let fx = fixture();
    fs::create_dir_all(fx.root.join("docs")).unwrap();
    for i in 0..10 {
        fs::write(fx.root.join(format!("f{i}.dat")), format!("content-{i}")).unwrap();
    }
    fs::write(fx.root.join("docs/readme.md"), "# readme").unwrap();

    let outcome = scan(&fx);
    let s = &outcome.summary;
    assert_eq!(s.files_total, 11);
    assert_eq!(
        s.files_total,
        s.new_count + s.modified_count + s.moved_count + s.unchanged_count,
        "every scanned file is classified exactly once"
    );
    assert!(s.bytes_scanned > 0);
    assert_eq!(s.bytes_hashed, s.bytes_scanned, "all small files hashed");
    assert_eq!(s.walk_errors, 0);
    assert_eq!(s.hash_errors, 0);
}

#[test]
fn excluded_files_and_dirs_never_enter_the_index() {
    let mut fx = fixture();
    fx.config.exclude_globs = vec!["skipme".to_string(), "*.tmp".to_string()];
    fs::create_dir_all(fx.root.join("skipme")).unwrap();
    fs::write(fx.root.join("skipme/hidden.txt"), "nope").unwrap();
    fs::write(fx.root.join("scratch.tmp"), "nope").unwrap();
    fs::write(fx.root.join("kept.txt"), "yes").unwrap();

    let outcome = scan(&fx);
    assert_eq!(outcome.summary.files_total, 1);

    let conn = fx.store.open_read_connection().unwrap();
    let n: i64 = conn
        .query_row(
            "SELECT count(*) FROM scan_issue WHERE scan_id = ?1 AND stage = 'IGNORE'",
            [outcome.scan_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(n, 1, "the *.tmp file is recorded as ignored");
}

#[test]
fn cancelled_before_start_reports_cancelled() {
    let fx = fixture();
    fs::write(fx.root.join("a.txt"), "hello").unwrap();

    let outcome = run_scan(
        &fx.store,
        &fx.config,
        &fx.root,
        &fx.dest,
        Arc::new(AtomicBool::new(true)),
    )
    .expect("cancellation is not an error");
    assert_eq!(outcome.status, ScanStatus::Cancelled);

    let conn = fx.store.open_read_connection().unwrap();
    let row = crate::store::scans::get_scan(&conn, outcome.scan_id).unwrap().unwrap();
    assert_eq!(row.status, ScanStatus::Cancelled);
    assert!(row.finished_at.is_some());
}

#[test]
fn invalid_root_is_rejected_before_any_row() {
    let fx = fixture();
    let result = run_scan(
        &fx.store,
        &fx.config,
        Path::new("/definitely/not/a/real/root"),
        &fx.dest,
        Arc::new(AtomicBool::new(false)),
    );
    assert!(matches!(result, Err(crate::scan::ScanError::InvalidInput(_))));

    let conn = fx.store.open_read_connection().unwrap();
    let n: i64 = conn.query_row("SELECT count(*) FROM scans", [], |r| r.get(0)).unwrap();
    assert_eq!(n, 0);
}
