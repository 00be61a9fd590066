//! Asynchronous job controller for scans and restores.
//!
//! Keeps an in-memory map of jobs, serializes execution per kind, heartbeats
//! running jobs, and runs a janitor that kills runtime/heartbeat breaches
//! (exit code 124) and evicts finished jobs after their TTL. On boot it
//! recovers `scans` rows left RUNNING by a crash. State transitions are
//! broadcast as events for the WebSocket layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use keeply_cas::{RestoreMode, RestoreOutcome, restore_changed_files_from_scan};
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use uuid::Uuid;

use crate::config::Config;
use crate::scan::{ScanError, run_scan};
use crate::store::scans::{self, ScanStatus};
use crate::store::{Store, StoreError, now_ms};

// ── Policy constants ─────────────────────────────────────────────────

pub const MAX_SCAN_RUNTIME: Duration = Duration::from_secs(45 * 60);
pub const MAX_SCAN_HEARTBEAT_GAP: Duration = Duration::from_secs(2 * 60);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const JANITOR_PERIOD: Duration = Duration::from_secs(30);
pub const COMPLETED_JOB_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// RUNNING `scans` rows older than this are recovered on boot.
pub const STALE_HISTORY_RUNNING_AGE: Duration = Duration::from_secs(10 * 60);
/// Exit code recorded on watchdog kills, mirroring `timeout(1)`.
pub const WATCHDOG_EXIT_CODE: i32 = 124;

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Scan,
    Restore,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scan => "scan",
            JobKind::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Cancelled)
    }
}

/// How scan jobs are executed. The agent runs scans in-process; the external
/// variant shells out to a worker binary and reads its exit code.
#[derive(Debug, Clone)]
pub enum CliMode {
    Embedded,
    External { program: String, args: Vec<String> },
}

struct JobRecord {
    id: String,
    kind: JobKind,
    state: JobState,
    root: String,
    dest: String,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    last_heartbeat_at: Option<i64>,
    exit_code: Option<i32>,
    message: Option<String>,
    scan_id: Option<i64>,
    cancel: Arc<AtomicBool>,
}

/// Serializable snapshot of a job, consumed by `/scan/{jobId}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub kind: String,
    pub state: String,
    pub root: String,
    pub dest: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<i64>,
}

impl JobRecord {
    fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            kind: self.kind.as_str().to_string(),
            state: self.state.as_str().to_string(),
            root: self.root.clone(),
            dest: self.dest.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_heartbeat_at: self.last_heartbeat_at,
            exit_code: self.exit_code,
            message: self.message.clone(),
            scan_id: self.scan_id,
        }
    }
}

/// Broadcast payload for the WebSocket layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    /// "scan.created", "scan.failed", "restore.success", ...
    pub event: String,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
}

#[derive(Debug)]
pub enum SubmitError {
    InvalidInput(String),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
        }
    }
}

impl std::error::Error for SubmitError {}

#[derive(Debug)]
pub enum RestoreError {
    ScanNotFound(i64),
    InvalidInput(String),
    Store(StoreError),
    Failed(String),
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreError::ScanNotFound(id) => write!(f, "No scan with id {id}"),
            RestoreError::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            RestoreError::Store(e) => write!(f, "Store error: {e}"),
            RestoreError::Failed(msg) => write!(f, "Restore failed: {msg}"),
        }
    }
}

impl std::error::Error for RestoreError {}

impl From<StoreError> for RestoreError {
    fn from(err: StoreError) -> Self {
        RestoreError::Store(err)
    }
}

/// Outcome returned to the `/restore` caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub scan_id: i64,
    pub mode: String,
    pub files_restored: u64,
    pub errors: u64,
}

// ── Controller ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    config: Config,
    cli_mode: CliMode,
    jobs: Mutex<HashMap<String, JobRecord>>,
    events: broadcast::Sender<JobEvent>,
    scan_slots: Arc<Semaphore>,
    restore_slots: Arc<Semaphore>,
}

impl JobController {
    pub fn new(store: Arc<Store>, config: Config) -> Self {
        Self::with_mode(store, config, CliMode::Embedded)
    }

    pub fn with_mode(store: Arc<Store>, config: Config, cli_mode: CliMode) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                cli_mode,
                jobs: Mutex::new(HashMap::new()),
                events,
                scan_slots: Arc::new(Semaphore::new(1)),
                restore_slots: Arc::new(Semaphore::new(1)),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Mark scans left RUNNING by a previous process as failed.
    pub fn recover_on_boot(&self) -> Result<usize, StoreError> {
        let conn = self.inner.store.pool().borrow();
        let recovered = scans::recover_stale_running(
            &conn,
            STALE_HISTORY_RUNNING_AGE.as_millis() as i64,
            "stale job recovered on boot",
        )?;
        if recovered > 0 {
            log::info!("Recovered {recovered} stale running scans on boot");
        }
        Ok(recovered)
    }

    /// Validate and enqueue a scan job. Must be called within a tokio runtime.
    pub fn submit_scan(&self, root: &str, dest: &str) -> Result<JobView, SubmitError> {
        validate_path_arg("root", root)?;
        validate_path_arg("dest", dest)?;
        if !Path::new(root).is_dir() {
            return Err(SubmitError::InvalidInput(format!("root is not a directory: {root}")));
        }

        let id = Uuid::new_v4().to_string();
        let record = JobRecord {
            id: id.clone(),
            kind: JobKind::Scan,
            state: JobState::Created,
            root: root.to_string(),
            dest: dest.to_string(),
            created_at: now_ms(),
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            exit_code: None,
            message: None,
            scan_id: None,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let view = record.view();
        lock_jobs(&self.inner).insert(id.clone(), record);
        self.emit("scan.created", Some(&id), None, None, None, None);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_scan_job(inner, id));
        Ok(view)
    }

    pub fn get(&self, job_id: &str) -> Option<JobView> {
        lock_jobs(&self.inner).get(job_id).map(JobRecord::view)
    }

    /// Request cancellation. Returns `(accepted, current_state)`.
    pub fn cancel(&self, job_id: &str) -> Option<(bool, JobState)> {
        let mut jobs = lock_jobs(&self.inner);
        let record = jobs.get_mut(job_id)?;
        if record.state.is_terminal() {
            return Some((false, record.state));
        }
        record.cancel.store(true, Ordering::Relaxed);
        Some((true, record.state))
    }

    /// Spawn the periodic janitor. Runs until the controller is dropped.
    pub fn start_janitor(&self) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                controller.sweep_at(now_ms());
            }
        })
    }

    /// One janitor pass at the given clock: watchdog kills + TTL eviction.
    pub fn sweep_at(&self, now: i64) -> usize {
        let mut timed_out: Vec<(String, Option<i64>)> = Vec::new();
        let mut removed = 0usize;
        {
            let mut jobs = lock_jobs(&self.inner);
            for record in jobs.values_mut() {
                if record.state != JobState::Running {
                    continue;
                }
                let runtime_breach = record
                    .started_at
                    .is_some_and(|t| t + MAX_SCAN_RUNTIME.as_millis() as i64 <= now);
                let heartbeat_breach = record
                    .last_heartbeat_at
                    .is_some_and(|t| t + MAX_SCAN_HEARTBEAT_GAP.as_millis() as i64 <= now);
                if runtime_breach || heartbeat_breach {
                    record.cancel.store(true, Ordering::Relaxed);
                    record.state = JobState::Failed;
                    record.exit_code = Some(WATCHDOG_EXIT_CODE);
                    record.finished_at = Some(now);
                    record.message = Some(
                        if runtime_breach {
                            "watchdog: max runtime exceeded"
                        } else {
                            "watchdog: heartbeat gap exceeded"
                        }
                        .to_string(),
                    );
                    timed_out.push((record.id.clone(), record.scan_id));
                }
            }
            jobs.retain(|_, record| {
                let evict = record.state.is_terminal()
                    && record
                        .finished_at
                        .is_some_and(|t| t + COMPLETED_JOB_TTL.as_millis() as i64 <= now);
                if evict {
                    removed += 1;
                }
                !evict
            });
        }

        for (job_id, scan_id) in &timed_out {
            log::warn!("Watchdog: job {job_id} timed out");
            self.emit(
                "scan.failed",
                Some(job_id),
                *scan_id,
                Some(WATCHDOG_EXIT_CODE),
                Some("watchdog timeout"),
                None,
            );
        }
        if removed > 0 {
            self.emit("scan.cleanup", None, None, None, None, Some(removed));
        }
        removed
    }

    /// Run a restore synchronously (serialized with other restores),
    /// emitting restore.* events and recording backup history.
    pub async fn run_restore(
        &self,
        scan_id: i64,
        mode: RestoreMode,
        target: Option<PathBuf>,
    ) -> Result<RestoreResult, RestoreError> {
        let inner = Arc::clone(&self.inner);
        let _permit = inner
            .restore_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RestoreError::Failed("controller shut down".to_string()))?;

        let (scan, base_dir) = {
            let conn = inner.store.pool().borrow();
            let scan = scans::get_scan(&conn, scan_id)?.ok_or(RestoreError::ScanNotFound(scan_id))?;
            if scan.status != ScanStatus::Success {
                return Err(RestoreError::InvalidInput(format!(
                    "scan {scan_id} is not restorable (status {})",
                    scan.status.as_str()
                )));
            }
            let base = scan
                .dest_path
                .clone()
                .ok_or_else(|| RestoreError::InvalidInput(format!("scan {scan_id} has no destination")))?;
            (scan, base)
        };
        if mode == RestoreMode::DestWithStructure && target.is_none() {
            return Err(RestoreError::InvalidInput(
                "targetPath is required for dest mode".to_string(),
            ));
        }

        let history_id = {
            let conn = inner.store.pool().borrow();
            let target_str = target
                .as_deref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| scan.root_path.clone());
            scans::open_restore_history(&conn, &scan.root_path, &target_str, scan_id)?
        };
        self.emit("restore.running", None, Some(scan_id), None, None, None);

        let root = PathBuf::from(scan.root_path.clone());
        let base = PathBuf::from(base_dir);
        let cancel = Arc::new(AtomicBool::new(false));
        let outcome: Result<RestoreOutcome, String> = tokio::task::spawn_blocking(move || {
            let sink = |line: &str| log::info!("Restore: {line}");
            restore_changed_files_from_scan(
                &base,
                scan_id,
                &root,
                target.as_deref(),
                mode,
                &cancel,
                &sink,
            )
            .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| RestoreError::Failed(format!("restore task panicked: {e}")))?;

        let conn = inner.store.pool().borrow();
        match outcome {
            Ok(result) => {
                let status = if result.errors == 0 { "OK" } else { "ERROR" };
                scans::finish_backup_history(
                    &conn,
                    history_id,
                    status,
                    result.files_restored,
                    result.errors,
                    None,
                )?;
                self.emit("restore.success", None, Some(scan_id), None, None, None);
                Ok(RestoreResult {
                    scan_id,
                    mode: mode.as_str().to_string(),
                    files_restored: result.files_restored,
                    errors: result.errors,
                })
            }
            Err(message) => {
                scans::finish_backup_history(&conn, history_id, "ERROR", 0, 0, Some(&message))?;
                self.emit("restore.failed", None, Some(scan_id), None, Some(&message), None);
                Err(RestoreError::Failed(message))
            }
        }
    }

    fn emit(
        &self,
        event: &str,
        job_id: Option<&str>,
        scan_id: Option<i64>,
        exit_code: Option<i32>,
        message: Option<&str>,
        removed: Option<usize>,
    ) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.inner.events.send(JobEvent {
            event: event.to_string(),
            ts: now_ms(),
            job_id: job_id.map(str::to_string),
            scan_id,
            exit_code,
            message: message.map(str::to_string),
            removed,
        });
    }

    #[cfg(test)]
    fn insert_test_job(&self, state: JobState, started_at: Option<i64>, heartbeat: Option<i64>, finished_at: Option<i64>) -> (String, Arc<AtomicBool>) {
        let id = Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        lock_jobs(&self.inner).insert(
            id.clone(),
            JobRecord {
                id: id.clone(),
                kind: JobKind::Scan,
                state,
                root: "/r".to_string(),
                dest: "/d".to_string(),
                created_at: started_at.unwrap_or_else(now_ms),
                started_at,
                finished_at,
                last_heartbeat_at: heartbeat,
                exit_code: None,
                message: None,
                scan_id: None,
                cancel: Arc::clone(&cancel),
            },
        );
        (id, cancel)
    }
}

fn lock_jobs(inner: &Inner) -> MutexGuard<'_, HashMap<String, JobRecord>> {
    inner
        .jobs
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn validate_path_arg(name: &str, value: &str) -> Result<(), SubmitError> {
    if value.trim().is_empty() {
        return Err(SubmitError::InvalidInput(format!("{name} must not be empty")));
    }
    if value.contains('\0') {
        return Err(SubmitError::InvalidInput(format!("{name} contains a NUL byte")));
    }
    Ok(())
}

// ── Scan job execution ───────────────────────────────────────────────

async fn run_scan_job(inner: Arc<Inner>, job_id: String) {
    let permit = match inner.scan_slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let (root, dest, cancel) = {
        let mut jobs = lock_jobs(&inner);
        let Some(record) = jobs.get_mut(&job_id) else { return };
        if record.cancel.load(Ordering::Relaxed) {
            record.state = JobState::Cancelled;
            record.finished_at = Some(now_ms());
            drop(jobs);
            emit_on(&inner, "scan.cancelled", Some(&job_id), None, None, None, None);
            return;
        }
        record.state = JobState::Running;
        record.started_at = Some(now_ms());
        record.last_heartbeat_at = Some(now_ms());
        (record.root.clone(), record.dest.clone(), Arc::clone(&record.cancel))
    };
    emit_on(&inner, "scan.running", Some(&job_id), None, None, None, None);

    // Heartbeat ticker: stops once the job leaves RUNNING.
    let hb_inner = Arc::clone(&inner);
    let hb_job = job_id.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let mut jobs = lock_jobs(&hb_inner);
            match jobs.get_mut(&hb_job) {
                Some(record) if record.state == JobState::Running => {
                    record.last_heartbeat_at = Some(now_ms());
                }
                _ => return,
            }
        }
    });

    let store = Arc::clone(&inner.store);
    let config = inner.config.clone();
    let mode = inner.cli_mode.clone();
    let scan_cancel = Arc::clone(&cancel);
    let result = tokio::task::spawn_blocking(move || {
        execute_scan(&mode, &store, &config, &root, &dest, scan_cancel)
    })
    .await;
    heartbeat.abort();
    drop(permit);

    let mut jobs = lock_jobs(&inner);
    let Some(record) = jobs.get_mut(&job_id) else { return };
    if record.state != JobState::Running {
        // The watchdog already closed this job.
        return;
    }
    record.finished_at = Some(now_ms());

    let (event, scan_id, exit_code, message) = match result {
        Ok(Ok(outcome)) => {
            record.scan_id = Some(outcome.scan_id);
            match outcome.status {
                ScanStatus::Cancelled => {
                    record.state = JobState::Cancelled;
                    record.exit_code = Some(0);
                    ("scan.cancelled", Some(outcome.scan_id), Some(0), None)
                }
                _ => {
                    record.state = JobState::Success;
                    record.exit_code = Some(0);
                    ("scan.success", Some(outcome.scan_id), Some(0), None)
                }
            }
        }
        Ok(Err(err)) => {
            record.state = JobState::Failed;
            record.exit_code = Some(1);
            record.message = Some(err.to_string());
            ("scan.failed", record.scan_id, Some(1), record.message.clone())
        }
        Err(join_err) => {
            record.state = JobState::Failed;
            record.exit_code = Some(1);
            record.message = Some(format!("scan task panicked: {join_err}"));
            ("scan.failed", record.scan_id, Some(1), record.message.clone())
        }
    };
    drop(jobs);
    emit_on(&inner, event, Some(&job_id), scan_id, exit_code, message.as_deref(), None);
}

/// Embedded mode runs the engine in-process; external mode shells out.
fn execute_scan(
    mode: &CliMode,
    store: &Store,
    config: &Config,
    root: &str,
    dest: &str,
    cancel: Arc<AtomicBool>,
) -> Result<crate::scan::ScanOutcome, ScanError> {
    match mode {
        CliMode::Embedded => run_scan(store, config, Path::new(root), Path::new(dest), cancel),
        CliMode::External { program, args } => {
            let status = std::process::Command::new(program)
                .args(args)
                .arg("--root")
                .arg(root)
                .arg("--dest")
                .arg(dest)
                .status()
                .map_err(ScanError::Thread)?;
            if status.success() {
                // The external worker owns its scan rows; report the latest.
                let conn = store.pool().borrow();
                let scan_id: i64 = conn
                    .query_row("SELECT COALESCE(MAX(id), 0) FROM scans", [], |r| r.get(0))
                    .map_err(|e| ScanError::Store(StoreError::Sqlite(e)))?;
                let summary = scans::get_summary(&conn, scan_id)
                    .map_err(ScanError::Store)?
                    .unwrap_or_default();
                Ok(crate::scan::ScanOutcome {
                    scan_id,
                    status: ScanStatus::Success,
                    summary,
                })
            } else {
                Err(ScanError::InvalidInput(format!(
                    "external scan worker exited with {status}"
                )))
            }
        }
    }
}

fn emit_on(
    inner: &Arc<Inner>,
    event: &str,
    job_id: Option<&str>,
    scan_id: Option<i64>,
    exit_code: Option<i32>,
    message: Option<&str>,
    removed: Option<usize>,
) {
    let _ = inner.events.send(JobEvent {
        event: event.to_string(),
        ts: now_ms(),
        job_id: job_id.map(str::to_string),
        scan_id,
        exit_code,
        message: message.map(str::to_string),
        removed,
    });
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;

    fn controller() -> (JobController, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.secret_key = "secret".to_string();
        config.scan_workers = 2;
        let store =
            Arc::new(Store::open(&config.db_path(), &config.secret_key, config.db_pool_size).unwrap());
        (JobController::new(store, config), dir)
    }

    async fn wait_terminal(controller: &JobController, job_id: &str) -> JobView {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let view = controller.get(job_id).expect("job exists");
            if view.state == "success" || view.state == "failed" || view.state == "cancelled" {
                return view;
            }
            assert!(Instant::now() < deadline, "job did not finish in time");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submitted_scan_runs_to_success() {
        let (controller, dir) = controller();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), "hello").unwrap();
        let dest = dir.path().join("dest");

        let mut events = controller.subscribe();
        let view = controller
            .submit_scan(&root.to_string_lossy(), &dest.to_string_lossy())
            .unwrap();
        assert_eq!(view.state, "created");

        let done = wait_terminal(&controller, &view.id).await;
        assert_eq!(done.state, "success");
        assert_eq!(done.exit_code, Some(0));
        assert!(done.scan_id.is_some());
        assert!(done.started_at.is_some());
        assert!(done.finished_at.is_some());

        // created -> running -> success, in order.
        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.event);
        }
        assert_eq!(names, vec!["scan.created", "scan.running", "scan.success"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submit_rejects_bad_input() {
        let (controller, dir) = controller();
        assert!(matches!(
            controller.submit_scan("", "/dest"),
            Err(SubmitError::InvalidInput(_))
        ));
        assert!(matches!(
            controller.submit_scan("/root\0evil", "/dest"),
            Err(SubmitError::InvalidInput(_))
        ));
        let missing = dir.path().join("missing");
        assert!(matches!(
            controller.submit_scan(&missing.to_string_lossy(), "/dest"),
            Err(SubmitError::InvalidInput(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scan_failure_is_reported() {
        let (controller, dir) = controller();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        // Destination path is an existing FILE, so the blob store cannot open.
        let dest = dir.path().join("not-a-dir");
        fs::write(&dest, "occupied").unwrap();

        let view = controller
            .submit_scan(&root.to_string_lossy(), &dest.to_string_lossy())
            .unwrap();
        let done = wait_terminal(&controller, &view.id).await;
        assert_eq!(done.state, "failed");
        assert_eq!(done.exit_code, Some(1));
        assert!(done.message.is_some());
    }

    #[tokio::test]
    async fn watchdog_fails_heartbeat_breach_with_124() {
        let (controller, _dir) = controller();
        let now = now_ms();
        let stale_heartbeat = now - MAX_SCAN_HEARTBEAT_GAP.as_millis() as i64 - 1_000;
        let (id, cancel) =
            controller.insert_test_job(JobState::Running, Some(now - 10_000), Some(stale_heartbeat), None);

        let mut events = controller.subscribe();
        controller.sweep_at(now);

        let view = controller.get(&id).unwrap();
        assert_eq!(view.state, "failed");
        assert_eq!(view.exit_code, Some(WATCHDOG_EXIT_CODE));
        assert!(cancel.load(Ordering::Relaxed), "underlying task is cancelled");

        let event = events.try_recv().unwrap();
        assert_eq!(event.event, "scan.failed");
        assert_eq!(event.exit_code, Some(WATCHDOG_EXIT_CODE));
    }

    #[tokio::test]
    async fn watchdog_fails_runtime_breach() {
        let (controller, _dir) = controller();
        let now = now_ms();
        let started = now - MAX_SCAN_RUNTIME.as_millis() as i64 - 1_000;
        let (id, _cancel) = controller.insert_test_job(JobState::Running, Some(started), Some(now), None);

        controller.sweep_at(now);
        let view = controller.get(&id).unwrap();
        assert_eq!(view.state, "failed");
        assert_eq!(view.exit_code, Some(WATCHDOG_EXIT_CODE));
    }

    #[tokio::test]
    async fn healthy_running_job_survives_sweep() {
        let (controller, _dir) = controller();
        let now = now_ms();
        let (id, cancel) = controller.insert_test_job(JobState::Running, Some(now - 5_000), Some(now - 1_000), None);

        controller.sweep_at(now);
        assert_eq!(controller.get(&id).unwrap().state, "running");
        assert!(!cancel.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn ttl_evicts_old_completed_jobs() {
        let (controller, _dir) = controller();
        let now = now_ms();
        let old = now - COMPLETED_JOB_TTL.as_millis() as i64 - 1_000;
        let (old_id, _) = controller.insert_test_job(JobState::Success, Some(old), None, Some(old));
        let (fresh_id, _) = controller.insert_test_job(JobState::Success, Some(now), None, Some(now));

        let mut events = controller.subscribe();
        let removed = controller.sweep_at(now);
        assert_eq!(removed, 1);
        assert!(controller.get(&old_id).is_none());
        assert!(controller.get(&fresh_id).is_some());

        let event = events.try_recv().unwrap();
        assert_eq!(event.event, "scan.cleanup");
        assert_eq!(event.removed, Some(1));
    }

    #[tokio::test]
    async fn cancel_flags_running_job() {
        let (controller, _dir) = controller();
        let now = now_ms();
        let (id, cancel) = controller.insert_test_job(JobState::Running, Some(now), Some(now), None);

        let (accepted, state) = controller.cancel(&id).unwrap();
        assert!(accepted);
        assert_eq!(state, JobState::Running);
        assert!(cancel.load(Ordering::Relaxed));

        // Cancelling a finished job is a no-op.
        let (done_id, _) = controller.insert_test_job(JobState::Success, Some(now), None, Some(now));
        let (accepted, state) = controller.cancel(&done_id).unwrap();
        assert!(!accepted);
        assert_eq!(state, JobState::Success);

        assert!(controller.cancel("no-such-job").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restore_roundtrip_through_controller() {
        let (controller, dir) = controller();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("data.txt"), "payload").unwrap();
        let dest = dir.path().join("dest");

        let view = controller
            .submit_scan(&root.to_string_lossy(), &dest.to_string_lossy())
            .unwrap();
        let done = wait_terminal(&controller, &view.id).await;
        let scan_id = done.scan_id.unwrap();

        let target = dir.path().join("restored");
        let result = controller
            .run_restore(scan_id, RestoreMode::DestWithStructure, Some(target.clone()))
            .await
            .unwrap();
        assert_eq!(result.files_restored, 1);
        assert_eq!(result.errors, 0);
        assert_eq!(fs::read(target.join("data.txt")).unwrap(), b"payload");

        // History now shows the restore row.
        let conn = controller.inner.store.open_read_connection().unwrap();
        let rows = scans::list_backup_history(&conn, Some(10)).unwrap();
        assert!(rows.iter().any(|r| r.backup_type == "restore" && r.status == "OK"));
    }

    #[tokio::test]
    async fn restore_unknown_scan_fails() {
        let (controller, _dir) = controller();
        let result = controller.run_restore(424242, RestoreMode::OriginalPath, None).await;
        assert!(matches!(result, Err(RestoreError::ScanNotFound(424242))));
    }

    #[tokio::test]
    async fn restore_dest_mode_requires_target() {
        let (controller, dir) = controller();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let dest = dir.path().join("dest");
        let view = controller
            .submit_scan(&root.to_string_lossy(), &dest.to_string_lossy())
            .unwrap();
        let done = wait_terminal(&controller, &view.id).await;
        let scan_id = done.scan_id.unwrap();

        let result = controller
            .run_restore(scan_id, RestoreMode::DestWithStructure, None)
            .await;
        assert!(matches!(result, Err(RestoreError::InvalidInput(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recover_on_boot_counts_stale_scans() {
        let (controller, _dir) = controller();
        {
            let conn = controller.inner.store.pool().borrow();
            let id = scans::open_scan(&conn, "/stale", "/dst").unwrap();
            conn.execute(
                "UPDATE scans SET started_at = started_at - 6000000 WHERE id = ?1",
                rusqlite::params![id],
            )
            .unwrap();
        }
        assert_eq!(controller.recover_on_boot().unwrap(), 1);
        assert_eq!(controller.recover_on_boot().unwrap(), 0);
    }
}
