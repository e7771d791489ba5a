//! Bridge front-end: the listening socket and its dispatch to workers.
//!
//! The bridge owns the listening socket (self-bound or inherited through
//! socket activation). Every accepted connection is handed to an idle
//! worker — or a freshly spawned one — by shipping the client descriptor
//! over the worker channel; the local copy is closed right after. System
//! RPCs between worker and proxy (store sync, resource trees) are served
//! by the per-worker proxy tasks owned by [`WorkerControl`].

use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;
use std::sync::{Arc, PoisonError};

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::context::CommonCtx;
use crate::module::ModuleRegistry;
use crate::sync;
use crate::worker::WorkerControl;

/// First descriptor passed by socket activation.
const ACTIVATION_FDS_START: RawFd = 3;

/// Run the daemon bridge until terminated.
///
/// # Errors
///
/// Startup failures (context, socket). Per-connection failures are
/// logged and do not stop the bridge.
pub async fn run(config: DaemonConfig, modules: ModuleRegistry) -> Result<()> {
    let common = CommonCtx::open(
        modules,
        config.sysfs_root.clone(),
        config.proc_root.clone(),
    )
    .context("failed to initialize common context")?;

    if config.load_db {
        load_snapshot_at_startup(&common, &config.db_path);
    }

    let (listener, bound_path) = bind_listener(&config.socket_path)?;
    info!(path = %config.socket_path.display(), "bridge listening");

    let control = WorkerControl::new(common, config.worker_timeout);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    if let Err(err) = dispatch_connection(&control, stream.as_raw_fd()).await {
                        error!(%err, "failed to dispatch connection");
                    }
                    // The worker holds its own duplicate now.
                    drop(stream);
                }
                Err(err) => error!(%err, "accept failed"),
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigusr2.recv() => {
                info!(path = %config.db_path.display(), "snapshot requested");
                if let Err(err) = trigger_db_snapshot(&control, &config).await {
                    error!(%err, "snapshot failed");
                }
            }
        }
    }

    if let Some(path) = bound_path {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

/// Hand an accepted client off to a worker.
async fn dispatch_connection(control: &Arc<WorkerControl>, client_fd: RawFd) -> Result<()> {
    let proxy = control
        .get_worker()
        .await
        .context("failed to obtain worker")?;
    debug!(worker = %proxy.id, "dispatching client connection");
    proxy
        .assign_client(client_fd)
        .await
        .context("failed to forward client to worker")?;
    Ok(())
}

/// Inject a persistent-snapshot command, executed by a worker against
/// its (seeded) snapshot of the store.
async fn trigger_db_snapshot(control: &Arc<WorkerControl>, config: &DaemonConfig) -> Result<()> {
    let proxy = control.get_worker().await?;
    let path = config.db_path.to_string_lossy();
    proxy
        .send_self_dbdump(Some(&path))
        .await
        .context("failed to send snapshot command")?;
    Ok(())
}

/// Reload the persistent snapshot through the regular sync merge path.
/// A missing file is not an error; anything else is logged and the
/// daemon starts from an empty store.
fn load_snapshot_at_startup(common: &CommonCtx, db_path: &Path) {
    if !db_path.exists() {
        debug!(path = %db_path.display(), "no snapshot to load");
        return;
    }
    let mut kv = common.kv.lock().unwrap_or_else(PoisonError::into_inner);
    match sync::load_snapshot(&mut kv, db_path) {
        Ok(stats) => {
            info!(
                path = %db_path.display(),
                merged = stats.merged,
                skipped = stats.skipped,
                "loaded persistent snapshot"
            );
        }
        Err(err) => warn!(path = %db_path.display(), %err, "failed to load snapshot"),
    }
}

/// Bind the listening socket: the first activation descriptor when
/// socket activation is present, otherwise a fresh bind at `path`.
///
/// Returns the listener and the path to unlink at shutdown (`None` for
/// an inherited socket).
fn bind_listener(path: &Path) -> Result<(UnixListener, Option<std::path::PathBuf>)> {
    if let Some(listener) = take_activation_listener()? {
        info!("using socket-activation listener");
        return Ok((listener, None));
    }

    if path.exists() {
        std::fs::remove_file(path).context("failed to remove stale socket")?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create socket directory")?;
    }
    let listener = UnixListener::bind(path).context("failed to bind listening socket")?;
    Ok((listener, Some(path.to_path_buf())))
}

/// The very first activation FD, when the environment carries one for
/// this process.
fn take_activation_listener() -> Result<Option<UnixListener>> {
    let Ok(pid) = std::env::var("LISTEN_PID") else {
        return Ok(None);
    };
    if pid.parse::<u32>() != Ok(std::process::id()) {
        return Ok(None);
    }
    let fds: u32 = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if fds == 0 {
        return Ok(None);
    }

    // SAFETY: the activation protocol hands us ownership of this
    // descriptor.
    let std_listener = unsafe { StdUnixListener::from_raw_fd(ACTIVATION_FDS_START) };
    std_listener
        .set_nonblocking(true)
        .context("failed to make activation socket nonblocking")?;
    let listener =
        UnixListener::from_std(std_listener).context("failed to adopt activation socket")?;
    Ok(Some(listener))
}
