//! Worker control: spawning, tracking and multiplexing IPC with the pool
//! of short-lived worker processes.
//!
//! Each worker handles a single device command in isolation. On the main
//! side a *proxy* owns the channel endpoint, watches the child, enforces
//! the execution timeout, and serves the worker's system requests (store
//! synchronization, resource-tree dumps).
//!
//! Workers are spawned by re-executing the daemon binary in worker mode;
//! the channel socketpair is inherited across the exec at a fixed
//! descriptor. Right after spawn the proxy seeds the worker with a full
//! snapshot of the main store over the sync protocol — the store is
//! never shared by memory between processes.
//!
//! Worker lifecycle as seen by the proxy:
//!
//! ```text
//! NEW → IDLE → ASSIGNED → { EXITING | TIMED_OUT } → EXITED
//! ```
//!
//! The current yield policy is immediate termination: a worker that
//! yields is sent SIGTERM instead of being parked idle.

pub mod channel;
pub mod process;

use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sid_core::buffer::{read_size_prefixed, ExportBuffer};
use sid_core::value::encode_record;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::cmd::UcmdError;
use crate::config::WorkerTimeout;
use crate::context::CommonCtx;
use crate::dump;
use crate::protocol::{InternalMsgHeader, MsgCategory, OutputFormat, SelfCmd, SystemCmd};
use crate::sync;
use channel::{Channel, ChannelCmd, ChannelError, ChannelMsg};

/// Descriptor number at which the worker inherits its channel endpoint.
pub const WORKER_CHANNEL_FD: RawFd = 3;

/// Worker lifecycle states tracked by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet seeded.
    New,
    /// Ready for an assignment.
    Idle,
    /// Serving a command.
    Assigned,
    /// Told to exit after a yield.
    Exiting,
    /// Execution timeout fired.
    TimedOut,
    /// Child has exited.
    Exited,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "WORKER_NEW",
            Self::Idle => "WORKER_IDLE",
            Self::Assigned => "WORKER_ASSIGNED",
            Self::Exiting => "WORKER_EXITING",
            Self::TimedOut => "WORKER_TIMED_OUT",
            Self::Exited => "WORKER_EXITED",
        };
        f.write_str(s)
    }
}

/// Proxy-side representation of one worker.
pub struct WorkerProxy {
    /// Worker identifier, also used as the udev session ID.
    pub id: String,
    /// Worker process ID.
    pub pid: u32,
    state: Mutex<WorkerState>,
    channel: Channel,
}

impl WorkerProxy {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        let mut slot = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *slot != state {
            *slot = state;
            debug!(worker = %self.id, %state, "worker state changed");
        }
    }

    /// Forward an accepted client connection to the worker. The
    /// descriptor stays owned by the caller and is closed there after
    /// the send returns.
    ///
    /// # Errors
    ///
    /// Channel failures.
    pub async fn assign_client(&self, client_fd: RawFd) -> Result<(), ChannelError> {
        self.set_state(WorkerState::Assigned);
        let payload = InternalMsgHeader::client().encode_with(&[]);
        self.channel
            .send(ChannelCmd::DataExt, &payload, Some(client_fd))
            .await
    }

    /// Inject a self-induced DB dump command into the worker.
    ///
    /// # Errors
    ///
    /// Channel failures.
    pub async fn send_self_dbdump(&self, file_path: Option<&str>) -> Result<(), ChannelError> {
        self.set_state(WorkerState::Assigned);
        let header = InternalMsgHeader::self_induced(SelfCmd::DbDump, 0);
        let mut trailer = Vec::new();
        if let Some(path) = file_path {
            trailer.extend_from_slice(path.as_bytes());
            trailer.push(0);
        }
        self.channel
            .send(ChannelCmd::Data, &header.encode_with(&trailer), None)
            .await
    }

    fn signal_worker(&self, signal: Signal) {
        #[allow(clippy::cast_possible_wrap)]
        if let Err(err) = kill(Pid::from_raw(self.pid as i32), signal) {
            warn!(worker = %self.id, %signal, %err, "failed to signal worker");
        }
    }
}

/// Spawns and tracks worker proxies.
pub struct WorkerControl {
    common: CommonCtx,
    timeout: Option<WorkerTimeout>,
    workers: Mutex<Vec<Arc<WorkerProxy>>>,
}

impl WorkerControl {
    /// New control with the given execution timeout policy.
    #[must_use]
    pub fn new(common: CommonCtx, timeout: Option<WorkerTimeout>) -> Arc<Self> {
        Arc::new(Self {
            common,
            timeout,
            workers: Mutex::new(Vec::new()),
        })
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<WorkerProxy>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An idle worker if one exists, otherwise a freshly spawned one.
    ///
    /// # Errors
    ///
    /// Spawn or seeding failures.
    pub async fn get_worker(self: &Arc<Self>) -> Result<Arc<WorkerProxy>, UcmdError> {
        if let Some(proxy) = self
            .workers()
            .iter()
            .find(|w| w.state() == WorkerState::Idle)
            .cloned()
        {
            return Ok(proxy);
        }
        debug!("idle worker not found, creating a new one");
        self.spawn_worker().await
    }

    /// Look up a live worker by its session ID.
    #[must_use]
    pub fn find_worker_by_session(&self, session_id: &str) -> Option<Arc<WorkerProxy>> {
        self.workers()
            .iter()
            .find(|w| w.id == session_id && w.state() != WorkerState::Exited)
            .cloned()
    }

    /// Snapshot of the worker table for the resource-tree dump.
    #[must_use]
    pub fn resource_snapshot(&self) -> Vec<dump::WorkerResource> {
        self.workers()
            .iter()
            .map(|w| dump::WorkerResource {
                id: w.id.clone(),
                pid: w.pid,
                state: w.state().to_string(),
            })
            .collect()
    }

    async fn spawn_worker(self: &Arc<Self>) -> Result<Arc<WorkerProxy>, UcmdError> {
        let id = format!("worker-{}", uuid::Uuid::new_v4());
        let (chan, theirs) = Channel::pair()?;

        let exe = std::env::current_exe()?;
        let mut command = Command::new(exe);
        command
            .arg("worker")
            .arg("--channel-fd")
            .arg(WORKER_CHANNEL_FD.to_string())
            .arg("--parent-pid")
            .arg(std::process::id().to_string())
            .arg("--worker-id")
            .arg(&id)
            .arg("--sysfs-root")
            .arg(&self.common.sysfs_root)
            .arg("--proc-root")
            .arg(&self.common.proc_root)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let theirs_fd = {
            use std::os::fd::AsRawFd;
            theirs.as_raw_fd()
        };
        // SAFETY: only async-signal-safe calls; the closure runs between
        // fork and exec and touches nothing else.
        unsafe {
            command.pre_exec(move || {
                if theirs_fd == WORKER_CHANNEL_FD {
                    // dup2 onto itself would keep FD_CLOEXEC set; clear it
                    // directly instead.
                    let flags = libc::fcntl(theirs_fd, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(theirs_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(theirs_fd, WORKER_CHANNEL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        drop(theirs);
        let pid = child
            .id()
            .ok_or_else(|| UcmdError::InvalidInput("spawned worker has no PID".into()))?;
        info!(worker = %id, pid, "created new worker process");

        let proxy = Arc::new(WorkerProxy {
            id,
            pid,
            state: Mutex::new(WorkerState::New),
            channel: chan,
        });

        self.seed_worker(&proxy).await?;
        proxy.set_state(WorkerState::Idle);

        self.workers().push(proxy.clone());
        let control = Arc::clone(self);
        let task_proxy = proxy.clone();
        tokio::spawn(async move {
            run_proxy(control, task_proxy, child).await;
        });

        Ok(proxy)
    }

    /// Replicate the main store into the fresh worker over the sync
    /// protocol.
    async fn seed_worker(&self, proxy: &Arc<WorkerProxy>) -> Result<(), UcmdError> {
        let mut buf = ExportBuffer::memfd("sid-worker-seed")?;
        let mut stream = Vec::new();
        {
            let kv = self
                .common
                .kv
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for (key, record) in kv.iter_records() {
                encode_record(key, record, &mut stream);
            }
        }
        buf.write_all(&stream)?;
        buf.finish()?;

        let payload = InternalMsgHeader::system(SystemCmd::Sync).encode_with(&[]);
        proxy
            .channel
            .send(ChannelCmd::DataExt, &payload, Some(buf.as_raw_fd()))
            .await
            .map_err(|e| UcmdError::Io(std::io::Error::other(e)))?;
        debug!(worker = %proxy.id, bytes = buf.payload_len(), "seeded worker store");
        Ok(())
    }
}

/// Proxy event loop: channel traffic, execution timeout, child exit.
async fn run_proxy(control: Arc<WorkerControl>, proxy: Arc<WorkerProxy>, mut child: Child) {
    let timeout = control.timeout;
    let timeout_sleep = tokio::time::sleep(
        timeout.map_or(Duration::from_secs(3600 * 24 * 365), |t| t.duration),
    );
    tokio::pin!(timeout_sleep);
    let mut timeout_armed = timeout.is_some();

    loop {
        tokio::select! {
            msg = proxy.channel.recv() => match msg {
                Ok(Some(msg)) => {
                    if let Err(err) = handle_proxy_msg(&control, &proxy, msg).await {
                        warn!(worker = %proxy.id, %err, "message handling failed");
                    }
                }
                Ok(None) => {
                    debug!(worker = %proxy.id, "worker closed its channel");
                    break;
                }
                Err(err) => {
                    error!(worker = %proxy.id, %err, "channel error");
                    break;
                }
            },
            () = &mut timeout_sleep, if timeout_armed => {
                timeout_armed = false;
                proxy.set_state(WorkerState::TimedOut);
                if let Some(spec) = timeout {
                    debug!(worker = %proxy.id, signal = %spec.signal, "execution timeout expired, signalling worker");
                    proxy.signal_worker(spec.signal);
                }
            },
            status = child.wait() => {
                match status {
                    Ok(status) => debug!(worker = %proxy.id, %status, "worker exited"),
                    Err(err) => warn!(worker = %proxy.id, %err, "failed to reap worker"),
                }
                // Late replies may still sit in the channel; drain them
                // before tearing the proxy down.
                while let Ok(Ok(Some(msg))) =
                    tokio::time::timeout(Duration::from_millis(50), proxy.channel.recv()).await
                {
                    if let Err(err) = handle_proxy_msg(&control, &proxy, msg).await {
                        warn!(worker = %proxy.id, %err, "late message handling failed");
                    }
                }
                break;
            },
        }
    }

    proxy.set_state(WorkerState::Exited);
    control.workers().retain(|w| w.id != proxy.id);
}

/// Handle one message from the worker.
async fn handle_proxy_msg(
    control: &Arc<WorkerControl>,
    proxy: &Arc<WorkerProxy>,
    msg: ChannelMsg,
) -> Result<(), UcmdError> {
    match msg.cmd {
        ChannelCmd::Yield => {
            // Simplified policy: a yielded worker terminates immediately.
            proxy.set_state(WorkerState::Exiting);
            proxy.signal_worker(Signal::SIGTERM);
            Ok(())
        }
        ChannelCmd::Data | ChannelCmd::DataExt => {
            let Some((header, trailer)) = InternalMsgHeader::decode(&msg.payload) else {
                return Err(UcmdError::InvalidInput("short internal message".into()));
            };
            if header.cat != MsgCategory::System {
                return Err(UcmdError::InvalidInput(format!(
                    "unexpected message category {:?} from worker",
                    header.cat
                )));
            }
            match SystemCmd::from_u8(header.header.cmd) {
                SystemCmd::Sync => {
                    proxy_recv_sync(control, proxy, &msg.payload, trailer, msg.fd).await
                }
                SystemCmd::Resources => {
                    proxy_recv_resources(control, proxy, &msg.payload, header).await
                }
                other => Err(UcmdError::InvalidInput(format!(
                    "unknown system command {other:?}"
                ))),
            }
        }
        ChannelCmd::Noop => Ok(()),
    }
}

/// Merge a worker's export buffer into the main store and acknowledge.
async fn proxy_recv_sync(
    control: &Arc<WorkerControl>,
    proxy: &Arc<WorkerProxy>,
    payload: &[u8],
    trailer: &[u8],
    fd: Option<std::os::fd::OwnedFd>,
) -> Result<(), UcmdError> {
    let Some(fd) = fd else {
        return Err(UcmdError::InvalidInput(
            "sync request without export buffer".into(),
        ));
    };

    let mut file = std::fs::File::from(fd);
    let stream = read_size_prefixed(&mut file)?;
    let stats = {
        let mut kv = control
            .common
            .kv
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sync::import_export_stream(&mut kv, &stream)?
    };
    debug!(
        worker = %proxy.id,
        merged = stats.merged,
        skipped = stats.skipped,
        cmd = %String::from_utf8_lossy(trailer),
        "merged worker export buffer"
    );

    // Ack with the same header and command id so the worker can
    // correlate.
    proxy
        .channel
        .send(ChannelCmd::Data, payload, None)
        .await
        .map_err(|e| UcmdError::Io(std::io::Error::other(e)))
}

/// Reply to a worker's resource-tree request with a buffer of the
/// rendered tree.
async fn proxy_recv_resources(
    control: &Arc<WorkerControl>,
    proxy: &Arc<WorkerProxy>,
    payload: &[u8],
    header: InternalMsgHeader,
) -> Result<(), UcmdError> {
    let format = OutputFormat::from_flags(header.header.flags);
    let rendered = dump::render_resource_tree(&control.resource_snapshot(), format);

    let mut buf = ExportBuffer::memfd("sid-resource-tree")?;
    buf.write_all(&rendered)?;
    buf.finish()?;

    proxy
        .channel
        .send(ChannelCmd::DataExt, payload, Some(buf.as_raw_fd()))
        .await
        .map_err(|e| UcmdError::Io(std::io::Error::other(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn test_proxy() -> (WorkerProxy, Channel) {
        let (ours, theirs) = Channel::pair().unwrap();
        let proxy = WorkerProxy {
            id: "worker-test".into(),
            pid: u32::MAX,
            state: Mutex::new(WorkerState::Idle),
            channel: ours,
        };
        (proxy, Channel::from_std(theirs).unwrap())
    }

    #[tokio::test]
    async fn assignment_moves_state_and_ships_the_fd() {
        let (proxy, peer) = test_proxy();

        let file = tempfile::tempfile().unwrap();
        proxy.assign_client(file.as_raw_fd()).await.unwrap();
        assert_eq!(proxy.state(), WorkerState::Assigned);

        let msg = peer.recv().await.unwrap().unwrap();
        assert_eq!(msg.cmd, ChannelCmd::DataExt);
        let (header, _) = InternalMsgHeader::decode(&msg.payload).unwrap();
        assert_eq!(header.cat, MsgCategory::Client);
        assert!(msg.fd.is_some());
    }

    #[tokio::test]
    async fn self_dbdump_carries_the_target_path() {
        let (proxy, peer) = test_proxy();
        proxy.send_self_dbdump(Some("/tmp/sid-test.db")).await.unwrap();

        let msg = peer.recv().await.unwrap().unwrap();
        assert_eq!(msg.cmd, ChannelCmd::Data);
        let (header, trailer) = InternalMsgHeader::decode(&msg.payload).unwrap();
        assert_eq!(header.cat, MsgCategory::SelfInduced);
        assert_eq!(SelfCmd::from_u8(header.header.cmd), SelfCmd::DbDump);
        assert_eq!(trailer, b"/tmp/sid-test.db\0");
    }

    #[test]
    fn state_names() {
        assert_eq!(WorkerState::TimedOut.to_string(), "WORKER_TIMED_OUT");
        assert_eq!(WorkerState::Idle.to_string(), "WORKER_IDLE");
    }
}

/// Options a worker process is spawned with.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Inherited channel descriptor.
    pub channel_fd: RawFd,
    /// PID of the spawning daemon.
    pub parent_pid: i32,
    /// Worker/session identifier.
    pub worker_id: String,
    /// Root of the sysfs mount.
    pub sysfs_root: PathBuf,
    /// Root of the procfs mount.
    pub proc_root: PathBuf,
}
