//! `sidctl` — control and query the SID daemon.
//!
//! Connects to the daemon's listening socket, sends one framed request,
//! and prints the reply payload. Output format selection travels in the
//! request header flags.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use futures::{SinkExt, StreamExt};
use sid_core::FrameCodec;
use sid_daemon::protocol::{MsgHeader, OutputFormat, SidCmd, MSG_HEADER_LEN, SID_PROTOCOL};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sidctl", version, about = "Control and query the SID daemon")]
struct Cli {
    /// Daemon socket path.
    #[arg(long, default_value = sid_daemon::config::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    format: Format,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
    Env,
}

impl From<Format> for OutputFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Table => Self::Table,
            Format::Json => Self::Json,
            Format::Env => Self::Env,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Check the daemon is responding.
    Active,
    /// Get SIDCTL and SID daemon version.
    Version,
    /// Dump the SID daemon database.
    Dbdump,
    /// Show stats for the SID daemon database.
    Dbstats,
    /// Show the current SID resource tree.
    Resources,
}

impl Command {
    const fn cmd(&self) -> SidCmd {
        match self {
            Self::Active => SidCmd::Active,
            Self::Version => SidCmd::Version,
            Self::Dbdump => SidCmd::DbDump,
            Self::Dbstats => SidCmd::DbStats,
            Self::Resources => SidCmd::Resources,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format: OutputFormat = cli.format.into();

    if matches!(cli.command, Command::Version) {
        // Local half of the version report; the daemon's half follows.
        print!(
            "SIDCTL_PROTOCOL={SID_PROTOCOL}\nSIDCTL_VERSION={}\n",
            env!("CARGO_PKG_VERSION")
        );
    }

    let payload = request(&cli, cli.command.cmd(), format).await?;
    print!("{}", String::from_utf8_lossy(&payload));
    Ok(())
}

/// Send one request and return the reply payload.
async fn request(cli: &Cli, cmd: SidCmd, format: OutputFormat) -> Result<Vec<u8>> {
    let stream = UnixStream::connect(&cli.socket)
        .await
        .with_context(|| format!("failed to connect to {}", cli.socket.display()))?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    let header = MsgHeader::request(cmd, format.to_flags());
    framed
        .send(Bytes::copy_from_slice(&header.encode()))
        .await
        .context("failed to send request")?;

    let Some(reply) = framed.next().await else {
        bail!("daemon closed the connection without replying");
    };
    let reply = reply.context("failed to read reply")?;

    let reply_header = MsgHeader::decode(&reply).context("malformed reply")?;
    if reply_header.failed() {
        bail!("command failed");
    }
    Ok(reply[MSG_HEADER_LEN..].to_vec())
}
