//! Worker process entry: serves one client command at a time over the
//! inherited channel.
//!
//! A worker installs its parent-death signal and re-checks its parent PID
//! immediately at entry, then waits for the proxy to seed its private
//! store snapshot. After executing a command it either replies straight
//! away or, for commands that must synchronize (`SCAN`), ships its export
//! buffer to the proxy and holds the client response until the ack
//! arrives. Once the response is flushed the worker yields, which under
//! the current policy means the proxy terminates it.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream as StdUnixStream;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nix::sys::signal::Signal;
use sid_core::buffer::{read_size_prefixed, FrameCodec};
use sid_core::store::KvStore;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::channel::{Channel, ChannelCmd, ChannelMsg};
use super::WorkerOptions;
use crate::cmd::{CmdFlags, CmdState, UcmdCtx};
use crate::context::CommonCtx;
use crate::dump;
use crate::module::ModuleRegistry;
use crate::protocol::{
    InternalMsgHeader, MsgCategory, MsgHeader, OutputFormat, PeerCredentials, SidCmd, SystemCmd,
    SID_PROTOCOL, STATUS_FAILURE,
};
use crate::scan;
use crate::sync;

type ClientFramed = Framed<UnixStream, FrameCodec>;

/// A command waiting for a system reply from the main process.
enum Pending {
    /// Export buffer sent, waiting for the sync ack.
    AwaitAck {
        ctx: Box<UcmdCtx>,
        client: ClientFramed,
    },
    /// Resource-tree request sent, waiting for the data reply.
    AwaitData {
        ctx: Box<UcmdCtx>,
        client: ClientFramed,
    },
}

/// Run the worker process.
///
/// # Errors
///
/// Setup failures (signal handling, channel rebuild, missing seed). Once
/// serving, per-command errors are reported to the client, not up the
/// stack.
pub async fn worker_main(opts: WorkerOptions, modules: ModuleRegistry) -> Result<()> {
    // Ask for a signal should the daemon die under us, then re-check the
    // parent actually is who spawned us; it may have died between fork
    // and now.
    nix::sys::prctl::set_pdeathsig(Signal::SIGUSR1).context("failed to set parent-death signal")?;
    if nix::unistd::getppid().as_raw() != opts.parent_pid {
        bail!("parent died before worker setup completed");
    }

    // SAFETY: the spawning daemon placed our channel endpoint at this
    // descriptor and nothing else owns it.
    let channel =
        unsafe { Channel::from_raw_fd(opts.channel_fd) }.context("failed to rebuild channel")?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut parent_exited = false;

    // The first message is the proxy seeding our store snapshot.
    let common = loop {
        let Some(msg) = channel.recv().await? else {
            bail!("proxy closed channel before seeding the store");
        };
        if let Some(common) = try_seed(&opts, &modules, &msg)? {
            break common;
        }
        warn!("ignoring pre-seed message");
    };
    info!(worker = %opts.worker_id, gennum = common.gennum, "worker store seeded");

    let mut pending: Option<Pending> = None;

    loop {
        tokio::select! {
            msg = channel.recv() => {
                let msg = match msg {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!("proxy closed channel, exiting");
                        return Ok(());
                    }
                    Err(err) => {
                        error!(%err, "channel failure, exiting");
                        return Err(err.into());
                    }
                };
                if let Err(err) =
                    handle_channel_msg(&opts, &channel, &common, msg, &mut pending).await
                {
                    error!(%err, "message handling failed");
                }
            }
            _ = sigterm.recv() => {
                debug!("received SIGTERM, exiting");
                return Ok(());
            }
            _ = sigint.recv() => {
                debug!("received SIGINT, exiting");
                return Ok(());
            }
            _ = sigusr1.recv() => {
                debug!("parent exited");
                parent_exited = true;
            }
        }
        if parent_exited && pending.is_none() {
            return Ok(());
        }
    }
}

/// Interpret a message as the initial store seed, if it is one.
fn try_seed(
    opts: &WorkerOptions,
    modules: &ModuleRegistry,
    msg: &ChannelMsg,
) -> Result<Option<CommonCtx>> {
    if msg.cmd != ChannelCmd::DataExt {
        return Ok(None);
    }
    let Some((header, _)) = InternalMsgHeader::decode(&msg.payload) else {
        return Ok(None);
    };
    if header.cat != MsgCategory::System || SystemCmd::from_u8(header.header.cmd) != SystemCmd::Sync
    {
        return Ok(None);
    }
    let Some(fd) = msg.fd.as_ref() else {
        return Ok(None);
    };

    let mut file = std::fs::File::from(fd.try_clone()?);
    let stream = read_size_prefixed(&mut file)?;
    let mut kv = KvStore::new();
    sync::import_export_stream(&mut kv, &stream)
        .map_err(|e| anyhow::anyhow!("seed import failed: {e}"))?;

    let boot_id = std::fs::read_to_string(opts.proc_root.join("sys/kernel/random/boot_id"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let common = CommonCtx::with_store(
        take_registry(modules),
        opts.sysfs_root.clone(),
        opts.proc_root.clone(),
        boot_id,
        kv,
    );
    Ok(Some(common))
}

// The registry is moved into the common context once; worker_main owns a
// single registry and seeds exactly once, so a clone-free handoff needs
// this small indirection.
fn take_registry(modules: &ModuleRegistry) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for module in modules.block_modules() {
        registry.register_block(module.clone());
    }
    for name in modules.type_names() {
        if let Some(module) = modules.type_module(name) {
            registry.register_type(module);
        }
    }
    registry
}

async fn handle_channel_msg(
    opts: &WorkerOptions,
    channel: &Channel,
    common: &CommonCtx,
    msg: ChannelMsg,
    pending: &mut Option<Pending>,
) -> Result<()> {
    match msg.cmd {
        ChannelCmd::Data | ChannelCmd::DataExt => {}
        ChannelCmd::Noop | ChannelCmd::Yield => return Ok(()),
    }
    let Some((header, trailer)) = InternalMsgHeader::decode(&msg.payload) else {
        bail!("short internal message");
    };

    match header.cat {
        MsgCategory::Client => {
            let Some(fd) = msg.fd else {
                bail!("client command without connection handle");
            };
            handle_client_connection(opts, channel, common, fd, pending).await
        }
        MsgCategory::System => match SystemCmd::from_u8(header.header.cmd) {
            SystemCmd::Sync => complete_after_ack(channel, trailer, pending).await,
            SystemCmd::Resources => complete_with_data(channel, trailer, msg.fd, pending).await,
            other => bail!("unexpected system command {other:?}"),
        },
        MsgCategory::SelfInduced => {
            handle_self_command(channel, common, header, trailer).await
        }
    }
}

/// Serve one client connection: read the request, run the command, and
/// either respond now or park the command until the main process
/// replies.
async fn handle_client_connection(
    opts: &WorkerOptions,
    channel: &Channel,
    common: &CommonCtx,
    fd: OwnedFd,
    pending: &mut Option<Pending>,
) -> Result<()> {
    let std_stream = StdUnixStream::from(fd);
    std_stream.set_nonblocking(true)?;
    let stream = UnixStream::from_std(std_stream)?;
    let mut client = Framed::new(stream, FrameCodec::new());

    let Some(frame) = client.next().await else {
        debug!("client disconnected before sending a request");
        return yield_to_proxy(channel).await;
    };
    let frame = frame.context("failed to read client request")?;

    let header = match MsgHeader::decode(&frame) {
        Ok(header) => header,
        Err(err) => {
            warn!(%err, "malformed request");
            reply_failure(&mut client, SID_PROTOCOL).await;
            return yield_to_proxy(channel).await;
        }
    };
    let payload = &frame[crate::protocol::MSG_HEADER_LEN..];

    // Authorization comes from socket credentials, never from the
    // request.
    let authorized = PeerCredentials::from_stream(client.get_ref())
        .map(|creds| creds.is_capable(header.command()))
        .unwrap_or(false);
    if !authorized {
        warn!(cmd = ?header.command(), "peer lacks permission");
        reply_failure(&mut client, header.prot).await;
        return yield_to_proxy(channel).await;
    }

    let mut ctx = match UcmdCtx::new(
        MsgCategory::Client,
        header,
        payload,
        common.clone(),
        &opts.worker_id,
    ) {
        Ok(ctx) => Box::new(ctx),
        Err(err) => {
            warn!(%err, "failed to initialize command");
            reply_failure(&mut client, header.prot.min(SID_PROTOCOL)).await;
            return yield_to_proxy(channel).await;
        }
    };

    ctx.advance(CmdState::Executing);
    let exec_result = execute_client_cmd(&mut ctx);

    match exec_result {
        Ok(CmdDisposition::Finished) => {
            ctx.advance(CmdState::ExecFinished);
            finish_command(channel, *ctx, client, pending).await
        }
        Ok(CmdDisposition::AwaitingMainData) => {
            ctx.advance(CmdState::ExpectingData);
            let request = InternalMsgHeader {
                cat: MsgCategory::System,
                header: MsgHeader {
                    status: 0,
                    prot: 0,
                    cmd: SystemCmd::Resources as u8,
                    flags: ctx.req_hdr.flags,
                },
            };
            let mut trailer = ctx.id.clone().into_bytes();
            trailer.push(0);
            channel
                .send(ChannelCmd::Data, &request.encode_with(&trailer), None)
                .await?;
            *pending = Some(Pending::AwaitData {
                ctx,
                client,
            });
            Ok(())
        }
        Err(err) => {
            warn!(cmd = %ctx.id, %err, "command execution failed");
            ctx.fail();
            let _ = client.send(Bytes::from(ctx.response_bytes())).await;
            yield_to_proxy(channel).await
        }
    }
}

/// How a command left its execution handler.
enum CmdDisposition {
    /// Ready to build results.
    Finished,
    /// Waiting for a resource-tree reply from the main process.
    AwaitingMainData,
}

fn execute_client_cmd(ctx: &mut UcmdCtx) -> Result<CmdDisposition, crate::cmd::UcmdError> {
    let format = OutputFormat::from_flags(ctx.req_hdr.flags);
    match ctx.req_hdr.command() {
        SidCmd::Active | SidCmd::Checkpoint => Ok(CmdDisposition::Finished),
        SidCmd::Version => {
            ctx.res_buf = dump::render_version(format);
            Ok(CmdDisposition::Finished)
        }
        SidCmd::Scan => {
            scan::run_scan(ctx)?;
            Ok(CmdDisposition::Finished)
        }
        SidCmd::DbDump => {
            let kv = ctx
                .common
                .kv
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            ctx.res_buf = dump::render_records(&kv, format, false);
            Ok(CmdDisposition::Finished)
        }
        SidCmd::DbStats => {
            let stats = {
                let kv = ctx
                    .common
                    .kv
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                kv.stats()
            };
            ctx.res_buf = dump::render_stats(&stats, format);
            Ok(CmdDisposition::Finished)
        }
        SidCmd::Resources => {
            if let Some(data) = ctx.main_data.take() {
                ctx.res_buf = data;
                Ok(CmdDisposition::Finished)
            } else {
                Ok(CmdDisposition::AwaitingMainData)
            }
        }
        SidCmd::Undefined | SidCmd::Unknown | SidCmd::Reply => Err(
            crate::cmd::UcmdError::InvalidInput("unknown client command".into()),
        ),
    }
}

/// Build export buffers and either respond or wait for the main-process
/// ack.
async fn finish_command(
    channel: &Channel,
    mut ctx: UcmdCtx,
    mut client: ClientFramed,
    pending: &mut Option<Pending>,
) -> Result<()> {
    if let Err(err) = sync::build_cmd_kv_buffers(&mut ctx) {
        warn!(cmd = %ctx.id, %err, "failed to export KV store");
        ctx.fail();
        let _ = client.send(Bytes::from(ctx.response_bytes())).await;
        return yield_to_proxy(channel).await;
    }

    let needs_ack = ctx.flags.contains(CmdFlags::EXPECT_EXPBUF_ACK)
        && ctx.flags.contains(CmdFlags::EXPBUF_TO_MAIN)
        && ctx.exp_buf.as_ref().is_some_and(|b| !b.is_empty());

    if needs_ack {
        let exp_fd = ctx.exp_buf.as_ref().map(sid_core::buffer::ExportBuffer::as_raw_fd);
        let header = InternalMsgHeader::system(SystemCmd::Sync);
        let mut trailer = ctx.id.clone().into_bytes();
        trailer.push(0);
        channel
            .send(
                ChannelCmd::DataExt,
                &header.encode_with(&trailer),
                exp_fd,
            )
            .await?;
        ctx.advance(CmdState::ExpectingExpbufAck);
        *pending = Some(Pending::AwaitAck {
            ctx: Box::new(ctx),
            client,
        });
        return Ok(());
    }

    respond_and_yield(channel, ctx, client).await
}

async fn respond_and_yield(
    channel: &Channel,
    mut ctx: UcmdCtx,
    mut client: ClientFramed,
) -> Result<()> {
    ctx.advance(CmdState::Ok);
    if let Err(err) = client.send(Bytes::from(ctx.response_bytes())).await {
        warn!(cmd = %ctx.id, %err, "failed to send command response to client");
    }
    yield_to_proxy(channel).await
}

/// The sync ack arrived: flush the parked command's response.
async fn complete_after_ack(
    channel: &Channel,
    trailer: &[u8],
    pending: &mut Option<Pending>,
) -> Result<()> {
    let cmd_id = trailer_cmd_id(trailer);
    match pending.take() {
        Some(Pending::AwaitAck { mut ctx, client }) if ctx.id == cmd_id => {
            ctx.advance(CmdState::ExpbufAcked);
            respond_and_yield(channel, *ctx, client).await
        }
        other => {
            *pending = other;
            bail!("sync ack for unknown command {cmd_id:?}");
        }
    }
}

/// The resource-tree data arrived: rerun the parked command with it.
async fn complete_with_data(
    channel: &Channel,
    trailer: &[u8],
    fd: Option<OwnedFd>,
    pending: &mut Option<Pending>,
) -> Result<()> {
    let cmd_id = trailer_cmd_id(trailer);
    match pending.take() {
        Some(Pending::AwaitData { mut ctx, client }) if ctx.id == cmd_id => {
            let Some(fd) = fd else {
                bail!("resource data reply without buffer");
            };
            let mut file = std::fs::File::from(fd);
            ctx.main_data = Some(read_size_prefixed(&mut file)?);

            ctx.advance(CmdState::ExecScheduled);
            ctx.advance(CmdState::Executing);
            match execute_client_cmd(&mut ctx) {
                Ok(_) => {
                    ctx.advance(CmdState::ExecFinished);
                    finish_command(channel, *ctx, client, pending).await
                }
                Err(err) => {
                    warn!(cmd = %ctx.id, %err, "command re-execution failed");
                    ctx.fail();
                    let mut client = client;
                    let _ = client.send(Bytes::from(ctx.response_bytes())).await;
                    yield_to_proxy(channel).await
                }
            }
        }
        other => {
            *pending = other;
            bail!("resource data for unknown command {cmd_id:?}");
        }
    }
}

/// Run a self-induced command (internally triggered DB dump).
async fn handle_self_command(
    channel: &Channel,
    common: &CommonCtx,
    header: InternalMsgHeader,
    trailer: &[u8],
) -> Result<()> {
    let mut ctx = UcmdCtx::new(
        MsgCategory::SelfInduced,
        header.header,
        trailer,
        common.clone(),
        "self",
    )?;
    ctx.advance(CmdState::Executing);
    ctx.advance(CmdState::ExecFinished);

    match sync::build_cmd_kv_buffers(&mut ctx) {
        Ok(()) => ctx.advance(CmdState::Ok),
        Err(err) => {
            warn!(cmd = %ctx.id, %err, "self-induced dump failed");
            ctx.fail();
        }
    }

    // Nothing external will make a self-serving worker yield, so do it
    // now.
    yield_to_proxy(channel).await
}

fn trailer_cmd_id(trailer: &[u8]) -> String {
    let end = trailer.iter().position(|&b| b == 0).unwrap_or(trailer.len());
    String::from_utf8_lossy(&trailer[..end]).into_owned()
}

async fn yield_to_proxy(channel: &Channel) -> Result<()> {
    channel.send(ChannelCmd::Yield, &[], None).await?;
    Ok(())
}

/// Send a bare failure reply when no command context exists yet.
async fn reply_failure(client: &mut ClientFramed, prot: u8) {
    let header = MsgHeader {
        status: STATUS_FAILURE,
        prot: prot.min(SID_PROTOCOL),
        cmd: SidCmd::Reply as u8,
        flags: 0,
    };
    if let Err(err) = client.send(Bytes::copy_from_slice(&header.encode())).await {
        debug!(%err, "failed to send failure reply");
    }
}
