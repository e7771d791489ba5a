//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default listening socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/sid.socket";

/// Default path for persistent DB snapshots.
pub const DEFAULT_DB_PATH: &str = "/run/sid.db";

/// Execution timeout applied to a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimeout {
    /// Time allowed from proxy creation.
    pub duration: Duration,
    /// Signal delivered to the worker when the timeout fires.
    pub signal: nix::sys::signal::Signal,
}

/// Runtime configuration of the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Listening socket path (unless socket activation provides one).
    pub socket_path: PathBuf,
    /// Persistent snapshot path.
    pub db_path: PathBuf,
    /// Reload the persistent snapshot at startup.
    pub load_db: bool,
    /// Worker execution timeout, if any.
    pub worker_timeout: Option<WorkerTimeout>,
    /// Root of the sysfs mount.
    pub sysfs_root: PathBuf,
    /// Root of the procfs mount.
    pub proc_root: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.into(),
            db_path: DEFAULT_DB_PATH.into(),
            load_db: false,
            worker_timeout: None,
            sysfs_root: "/sys".into(),
            proc_root: "/proc".into(),
        }
    }
}
