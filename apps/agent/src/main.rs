//! Keeply agent binary: `scan`, `restore` and `serve` subcommands.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};

use keeply_agent::api::{self, ApiState};
use keeply_agent::config::Config;
use keeply_agent::jobs::JobController;
use keeply_agent::scan::run_scan;
use keeply_agent::store::scans::ScanStatus;
use keeply_agent::store::{Store, agent_state, session::SessionStore};
use keeply_cas::{RestoreMode, restore_changed_files_from_scan};

#[derive(Parser)]
#[command(name = "keeply-agent", version, about = "Local file-backup agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a directory tree and store changed contents at the destination.
    Scan {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        dest: PathBuf,
        /// Database encryption secret (overrides KEEPLY_SECRET_KEY).
        #[arg(long)]
        password: Option<String>,
    },
    /// Restore a historical scan from its manifest and blob store.
    Restore {
        #[arg(long)]
        scan_id: i64,
        /// Blob-store destination directory the scan was written to.
        #[arg(long)]
        dest: PathBuf,
        /// Restore into this directory, mirroring the scanned tree.
        #[arg(long, conflicts_with = "original")]
        target: Option<PathBuf>,
        /// Restore files back to their original paths under --root.
        #[arg(long, requires = "root")]
        original: bool,
        /// Original scan root (required with --original).
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Run the HTTP/WebSocket API and the job controller.
    Serve,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command {
        Command::Scan { root, dest, password } => {
            if let Some(password) = password {
                config.secret_key = password;
            }
            cmd_scan(&config, &root, &dest)
        }
        Command::Restore {
            scan_id,
            dest,
            target,
            original,
            root,
        } => cmd_restore(scan_id, &dest, target, original, root),
        Command::Serve => cmd_serve(config),
    }
}

fn cmd_scan(config: &Config, root: &std::path::Path, dest: &std::path::Path) -> ExitCode {
    let store = match Store::open(&config.db_path(), &config.secret_key, config.db_pool_size) {
        Ok(store) => store,
        Err(e) => {
            log::error!("Cannot open store: {e}");
            return ExitCode::FAILURE;
        }
    };
    match run_scan(&store, config, root, dest, Arc::new(AtomicBool::new(false))) {
        Ok(outcome) if outcome.status == ScanStatus::Success => ExitCode::SUCCESS,
        Ok(outcome) => {
            log::error!("Scan {} ended as {}", outcome.scan_id, outcome.status.as_str());
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("Scan failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_restore(
    scan_id: i64,
    dest: &std::path::Path,
    target: Option<PathBuf>,
    original: bool,
    root: Option<PathBuf>,
) -> ExitCode {
    let (mode, original_root) = if original {
        // Clap enforces --root alongside --original.
        let Some(root) = root else {
            return ExitCode::FAILURE;
        };
        (RestoreMode::OriginalPath, root)
    } else {
        if target.is_none() {
            log::error!("--target is required unless --original is set");
            return ExitCode::FAILURE;
        }
        (RestoreMode::DestWithStructure, PathBuf::new())
    };

    let cancel = AtomicBool::new(false);
    let sink = |line: &str| log::info!("{line}");
    match restore_changed_files_from_scan(
        dest,
        scan_id,
        &original_root,
        target.as_deref(),
        mode,
        &cancel,
        &sink,
    ) {
        Ok(outcome) => {
            log::info!(
                "Restored {} files ({} errors)",
                outcome.files_restored,
                outcome.errors
            );
            if outcome.errors == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            log::error!("Restore failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_serve(config: Config) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result: Result<(), Box<dyn std::error::Error>> = runtime.block_on(async {
        let store = Arc::new(Store::open(
            &config.db_path(),
            &config.secret_key,
            config.db_pool_size,
        )?);

        // One-time migration of pre-database agent state, then the session KV
        // used by the transport layer.
        {
            let conn = store.pool().borrow();
            agent_state::migrate_legacy(&conn, &config.legacy_agent_state_path())?;
        }
        let _session = SessionStore::open(&config.session_db_path())?;

        let controller = JobController::new(Arc::clone(&store), config.clone());
        let recovered = controller.recover_on_boot()?;
        if recovered > 0 {
            log::warn!("Recovered {recovered} stale running scans");
        }
        controller.start_janitor();

        let host: IpAddr = config.bind_host.parse()?;
        let addr = SocketAddr::new(host, config.port);
        let state = Arc::new(ApiState {
            controller,
            store,
            api_token: config.api_token.clone(),
        });
        api::serve(state, addr).await?;
        Ok(())
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Serve failed: {e}");
            ExitCode::FAILURE
        }
    }
}
