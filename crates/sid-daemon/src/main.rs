//! `sid` — the storage instantiation daemon binary.
//!
//! Runs the bridge by default; the hidden `worker` subcommand is the
//! entry point for the worker processes the daemon spawns. Process
//! management (spawning workers, inheriting the channel descriptor)
//! happens around a manually constructed current-thread runtime: every
//! SID process is single-threaded and cooperative by design.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use sid_daemon::config::{DaemonConfig, WorkerTimeout};
use sid_daemon::module::ModuleRegistry;
use sid_daemon::worker::WorkerOptions;
use sid_daemon::{bridge, worker};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sid", version, about = "Storage Instantiation Daemon")]
struct Cli {
    /// Listening socket path.
    #[arg(long, default_value = sid_daemon::config::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Persistent snapshot path.
    #[arg(long, default_value = sid_daemon::config::DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Reload the persistent snapshot at startup.
    #[arg(long)]
    load_db: bool,

    /// Worker execution timeout in milliseconds.
    #[arg(long)]
    worker_timeout_ms: Option<u64>,

    /// Signal delivered to a worker whose execution timeout fired.
    #[arg(long, default_value = "SIGTERM")]
    worker_timeout_signal: String,

    /// Root of the sysfs mount.
    #[arg(long, default_value = "/sys")]
    sysfs_root: PathBuf,

    /// Root of the procfs mount.
    #[arg(long, default_value = "/proc")]
    proc_root: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Internal worker entry point.
    #[command(hide = true)]
    Worker {
        /// Inherited channel descriptor.
        #[arg(long)]
        channel_fd: i32,
        /// PID of the spawning daemon.
        #[arg(long)]
        parent_pid: i32,
        /// Worker identifier.
        #[arg(long)]
        worker_id: String,
        /// Root of the sysfs mount.
        #[arg(long, default_value = "/sys")]
        sysfs_root: PathBuf,
        /// Root of the procfs mount.
        #[arg(long, default_value = "/proc")]
        proc_root: PathBuf,
    },
}

/// Modules compiled into this build. The module loader proper is an
/// external collaborator; an empty registry still runs the full core
/// pipeline.
fn builtin_modules() -> ModuleRegistry {
    ModuleRegistry::new()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    // One single-threaded event loop per process; built manually so
    // process setup stays outside any runtime thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    match cli.command {
        Some(Command::Worker {
            channel_fd,
            parent_pid,
            worker_id,
            sysfs_root,
            proc_root,
        }) => {
            let opts = WorkerOptions {
                channel_fd,
                parent_pid,
                worker_id,
                sysfs_root,
                proc_root,
            };
            runtime.block_on(worker::process::worker_main(opts, builtin_modules()))
        }
        None => {
            let timeout = match cli.worker_timeout_ms {
                Some(ms) => Some(WorkerTimeout {
                    duration: Duration::from_millis(ms),
                    signal: parse_signal(&cli.worker_timeout_signal)?,
                }),
                None => None,
            };
            let config = DaemonConfig {
                socket_path: cli.socket,
                db_path: cli.db,
                load_db: cli.load_db,
                worker_timeout: timeout,
                sysfs_root: cli.sysfs_root,
                proc_root: cli.proc_root,
            };
            runtime.block_on(bridge::run(config, builtin_modules()))
        }
    }
}

fn parse_signal(name: &str) -> Result<Signal> {
    let canonical = if name.starts_with("SIG") {
        name.to_string()
    } else {
        format!("SIG{name}")
    };
    canonical
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown signal {name:?}"))
}
