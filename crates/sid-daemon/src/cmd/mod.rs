//! Command context and state machine.
//!
//! A command context is created from a validated request header, lives
//! through the command's execution (for `SCAN`, the whole phase
//! pipeline), and is destroyed once the terminal state is reached and the
//! results are flushed.
//!
//! ```text
//! INITIALIZING → EXEC_SCHEDULED → EXECUTING → EXEC_FINISHED → OK
//!                                     │              │
//!                                     │              └→ EXPECTING_EXPBUF_ACK
//!                                     │                     → EXPBUF_ACKED → OK
//!                                     └→ EXPECTING_DATA → EXEC_SCHEDULED …
//!
//! ERROR is terminal from any state.
//! ```
//!
//! Commands carrying the export-acknowledge capability (`SCAN`) must wait
//! for the main process to confirm it merged the export buffer before the
//! client response goes out, so a client that sees the reply can rely on
//! the main store already holding the scan's results.

pub mod api;

use std::fmt;
use std::path::PathBuf;

use sid_core::buffer::ExportBuffer;
use sid_core::error::{DecodeError, KvError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::{CommonCtx, UDEV_KEY_SESSION_ID};
use crate::device::{parse_udev_env, DeviceEnv};
use crate::module::OWNER_CORE;
use crate::protocol::{
    MsgCategory, MsgHeader, ProtocolError, SelfCmd, SidCmd, SID_PROTOCOL,
};
use crate::scan::ScanPhase;

/// Errors surfaced by command processing and the module-facing API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UcmdError {
    /// KV store refusal (flag conflict, stale seqnum, rejection).
    #[error(transparent)]
    Kv(#[from] KvError),

    /// The operation is not permitted in the current scan phase.
    #[error("operation not permitted in scan phase {phase:?}")]
    PhaseForbidden {
        /// Phase the command was in.
        phase: ScanPhase,
    },

    /// Caller-supplied input was invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Request-level protocol violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Malformed serialized record.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A scan phase failed fatally.
    #[error("scan phase {phase:?} failed")]
    ScanFailed {
        /// The failing phase.
        phase: ScanPhase,
    },

    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Command lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
    /// Context being built from the request.
    Initializing,
    /// Handler armed, waiting to run.
    ExecScheduled,
    /// Handler running.
    Executing,
    /// Waiting for data from the main process.
    ExpectingData,
    /// Handler done, results ready to build and send.
    ExecFinished,
    /// Export buffer sent, waiting for the main process ack.
    ExpectingExpbufAck,
    /// Export buffer acknowledged.
    ExpbufAcked,
    /// Terminal success.
    Ok,
    /// Terminal failure.
    Error,
}

impl CmdState {
    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        if next == Self::Error {
            return true;
        }
        matches!(
            (self, next),
            (Self::Initializing, Self::ExecScheduled)
                | (Self::ExecScheduled, Self::Executing)
                | (Self::Executing, Self::ExecFinished | Self::ExpectingData)
                | (Self::ExpectingData, Self::ExecScheduled)
                | (Self::ExecFinished, Self::Ok | Self::ExpectingExpbufAck)
                | (Self::ExpectingExpbufAck, Self::ExpbufAcked)
                | (Self::ExpbufAcked, Self::Ok)
        )
    }

    /// Whether this state ends the command.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }
}

impl fmt::Display for CmdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "CMD_INITIALIZING",
            Self::ExecScheduled => "CMD_EXEC_SCHEDULED",
            Self::Executing => "CMD_EXECUTING",
            Self::ExpectingData => "CMD_EXPECTING_DATA",
            Self::ExecFinished => "CMD_EXEC_FINISHED",
            Self::ExpectingExpbufAck => "CMD_EXPECTING_EXPBUF_ACK",
            Self::ExpbufAcked => "CMD_EXPBUF_ACKED",
            Self::Ok => "CMD_OK",
            Self::Error => "CMD_ERROR",
        };
        f.write_str(s)
    }
}

/// Capability flags of a command registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdFlags(u32);

impl CmdFlags {
    /// No capabilities.
    pub const NONE: Self = Self(0);
    /// Import the udev environment as UDEV-namespace records.
    pub const IMPORT_UDEV: Self = Self(1 << 0);
    /// Export UDEV-namespace records into the response buffer.
    pub const EXPORT_UDEV_TO_RESBUF: Self = Self(1 << 1);
    /// Export UDEV-namespace records into the export buffer.
    pub const EXPORT_UDEV_TO_EXPBUF: Self = Self(1 << 2);
    /// Export non-UDEV records into the response buffer.
    pub const EXPORT_SID_TO_RESBUF: Self = Self(1 << 3);
    /// Export non-UDEV records into the export buffer.
    pub const EXPORT_SID_TO_EXPBUF: Self = Self(1 << 4);
    /// Export only SYNC-flagged records (the alias range fast path).
    pub const EXPORT_SYNC: Self = Self(1 << 5);
    /// Export only PERSISTENT-flagged records.
    pub const EXPORT_PERSISTENT: Self = Self(1 << 6);
    /// Ship the export buffer to a file.
    pub const EXPBUF_TO_FILE: Self = Self(1 << 7);
    /// Ship the export buffer to the main process.
    pub const EXPBUF_TO_MAIN: Self = Self(1 << 8);
    /// Hold the client response until the main process acknowledges the
    /// export buffer.
    pub const EXPECT_EXPBUF_ACK: Self = Self(1 << 9);
    /// Record the worker session ID as a udev property.
    pub const SESSION_ID: Self = Self(1 << 10);

    /// Whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag in `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union_with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    const fn union(flags: &[Self]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < flags.len() {
            bits |= flags[i].0;
            i += 1;
        }
        Self(bits)
    }
}

/// Capability flags of a client command.
#[must_use]
pub fn client_cmd_flags(cmd: SidCmd) -> CmdFlags {
    match cmd {
        SidCmd::Checkpoint => CmdFlags::IMPORT_UDEV,
        SidCmd::Scan => CmdFlags::union(&[
            CmdFlags::IMPORT_UDEV,
            CmdFlags::EXPORT_UDEV_TO_RESBUF,
            CmdFlags::EXPORT_SID_TO_EXPBUF,
            CmdFlags::EXPBUF_TO_MAIN,
            CmdFlags::EXPORT_SYNC,
            CmdFlags::EXPECT_EXPBUF_ACK,
            CmdFlags::SESSION_ID,
        ]),
        _ => CmdFlags::NONE,
    }
}

/// Capability flags of a self-induced command.
#[must_use]
pub fn self_cmd_flags(cmd: SelfCmd) -> CmdFlags {
    match cmd {
        SelfCmd::DbDump => CmdFlags::union(&[
            CmdFlags::EXPORT_UDEV_TO_EXPBUF,
            CmdFlags::EXPORT_SID_TO_EXPBUF,
            CmdFlags::EXPBUF_TO_FILE,
            CmdFlags::EXPORT_PERSISTENT,
        ]),
        _ => CmdFlags::NONE,
    }
}

/// Per-request command context.
pub struct UcmdCtx {
    /// Command identifier, used to correlate system replies from the main
    /// process.
    pub id: String,
    /// Request category.
    pub cat: MsgCategory,
    /// Request header.
    pub req_hdr: MsgHeader,
    /// Capability flags of this command.
    pub flags: CmdFlags,
    /// Parsed device environment (`SCAN`/`CHECKPOINT`).
    pub dev: DeviceEnv,
    /// Export file path override (self-induced dump).
    pub exp_path: Option<PathBuf>,
    /// Shared per-process context.
    pub common: CommonCtx,
    /// Current scan phase.
    pub phase: ScanPhase,
    /// Current lifecycle state.
    pub state: CmdState,
    /// Response header, flushed ahead of the response payload.
    pub res_hdr: MsgHeader,
    /// Response payload.
    pub res_buf: Vec<u8>,
    /// Export buffer, when the command produced one.
    pub exp_buf: Option<ExportBuffer>,
    /// Payload delivered by the main process for this command
    /// (resource-tree dump).
    pub main_data: Option<Vec<u8>>,
}

impl UcmdCtx {
    /// Build a context from a validated request.
    ///
    /// Parses the udev environment when the command imports one, stores
    /// the session ID property when the command requests it, and leaves
    /// the context in [`CmdState::ExecScheduled`].
    ///
    /// # Errors
    ///
    /// Protocol-version mismatch, malformed payload, or a KV failure
    /// while importing the environment.
    pub fn new(
        cat: MsgCategory,
        req_hdr: MsgHeader,
        payload: &[u8],
        common: CommonCtx,
        worker_id: &str,
    ) -> Result<Self, UcmdError> {
        // Exact protocol version; backward compatibility can come with a
        // stable protocol.
        if req_hdr.prot != SID_PROTOCOL {
            return Err(ProtocolError::UnsupportedProtocol { got: req_hdr.prot }.into());
        }

        let flags = match cat {
            MsgCategory::Client => client_cmd_flags(req_hdr.command()),
            MsgCategory::SelfInduced => self_cmd_flags(SelfCmd::from_u8(req_hdr.cmd)),
            MsgCategory::System => CmdFlags::NONE,
        };

        let mut ctx = Self {
            id: format!("cmd-{}", uuid::Uuid::new_v4()),
            cat,
            req_hdr,
            flags,
            dev: DeviceEnv::default(),
            exp_path: None,
            common,
            phase: ScanPhase::Init,
            state: CmdState::Initializing,
            res_hdr: MsgHeader::reply(),
            res_buf: Vec::new(),
            exp_buf: None,
            main_data: None,
        };

        if flags.contains(CmdFlags::IMPORT_UDEV) {
            ctx.dev = parse_udev_env(payload)?;
            ctx.import_udev_pairs()?;
        }

        if flags.contains(CmdFlags::EXPBUF_TO_FILE) && !payload.is_empty() {
            let path = std::str::from_utf8(payload)
                .map_err(|_| UcmdError::InvalidInput("non-UTF-8 export path".into()))?
                .trim_end_matches('\0');
            if !path.is_empty() {
                ctx.exp_path = Some(PathBuf::from(path));
            }
        }

        if flags.contains(CmdFlags::SESSION_ID) {
            ctx.set_session_id(worker_id)?;
        }

        ctx.advance(CmdState::ExecScheduled);
        Ok(ctx)
    }

    /// Move the state machine, logging the transition.
    pub fn advance(&mut self, next: CmdState) {
        if !self.state.can_advance_to(next) {
            warn!(cmd = %self.id, from = %self.state, to = %next, "illegal command state transition");
        }
        self.state = next;
        debug!(cmd = %self.id, state = %self.state, "command state changed");
    }

    /// Mark the command failed: sets the response failure bit and enters
    /// the terminal error state.
    pub fn fail(&mut self) {
        self.res_hdr.set_failure();
        self.advance(CmdState::Error);
    }

    /// Serialize the response (header plus payload) for the client.
    #[must_use]
    pub fn response_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.res_buf.len() + 5);
        out.extend_from_slice(&self.res_hdr.encode());
        out.extend_from_slice(&self.res_buf);
        out
    }

    /// Import every udev `KEY=VALUE` pair as a UDEV-namespace record.
    fn import_udev_pairs(&mut self) -> Result<(), UcmdError> {
        let pairs = self.dev.pairs.clone();
        for (key, value) in &pairs {
            let mut bytes = value.clone().into_bytes();
            bytes.push(0);
            self.do_set_kv(
                OWNER_CORE,
                None,
                sid_core::key::KvNamespace::Udev,
                key,
                sid_core::value::ValueFlags::NONE,
                Some(&bytes),
            )?;
            debug!(cmd = %self.id, key = %key, value = %value, "imported udev property");
        }
        Ok(())
    }

    /// Record the worker session ID as a udev property.
    fn set_session_id(&mut self, worker_id: &str) -> Result<(), UcmdError> {
        let mut bytes = worker_id.as_bytes().to_vec();
        bytes.push(0);
        self.do_set_kv(
            OWNER_CORE,
            None,
            sid_core::key::KvNamespace::Udev,
            UDEV_KEY_SESSION_ID,
            sid_core::value::ValueFlags::SYNC | sid_core::value::ValueFlags::PERSISTENT,
            Some(&bytes),
        )?;
        Ok(())
    }
}

impl fmt::Debug for UcmdCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UcmdCtx")
            .field("id", &self.id)
            .field("cat", &self.cat)
            .field("cmd", &self.req_hdr.command())
            .field("state", &self.state)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CommonCtx;
    use crate::device::build_udev_env;
    use crate::module::ModuleRegistry;

    fn common() -> CommonCtx {
        CommonCtx::with_boot_id(
            ModuleRegistry::new(),
            "/sys".into(),
            "/proc".into(),
            "boot".into(),
        )
    }

    fn scan_ctx() -> UcmdCtx {
        let payload = build_udev_env(
            8,
            0,
            &[
                ("ACTION", "add"),
                ("DEVPATH", "/block/sda"),
                ("DEVTYPE", "disk"),
                ("SEQNUM", "42"),
            ],
        );
        UcmdCtx::new(
            MsgCategory::Client,
            MsgHeader::request(SidCmd::Scan, 0),
            &payload,
            common(),
            "worker-1",
        )
        .unwrap()
    }

    #[test]
    fn scan_ctx_imports_udev_and_session_id() {
        let ctx = scan_ctx();
        assert_eq!(ctx.state, CmdState::ExecScheduled);
        assert_eq!(ctx.dev.id, "8_0");

        let kv = ctx.common.kv.lock().unwrap();
        let action = kv.get("::U:8_0:::ACTION").unwrap();
        assert_eq!(action.data().unwrap(), b"add\0");
        let session = kv.get("::U:8_0:::SID_SESSION_ID").unwrap();
        assert_eq!(session.data().unwrap(), b"worker-1\0");
        // Session ID is synchronized back to the main store.
        assert!(session
            .header
            .flags
            .contains(sid_core::value::ValueFlags::SYNC));
    }

    #[test]
    fn protocol_mismatch_rejected() {
        let mut hdr = MsgHeader::request(SidCmd::Version, 0);
        hdr.prot = 99;
        let err = UcmdCtx::new(MsgCategory::Client, hdr, &[], common(), "w").unwrap_err();
        assert!(matches!(
            err,
            UcmdError::Protocol(ProtocolError::UnsupportedProtocol { got: 99 })
        ));
    }

    #[test]
    fn state_machine_legality() {
        use CmdState::*;
        assert!(Initializing.can_advance_to(ExecScheduled));
        assert!(ExecScheduled.can_advance_to(Executing));
        assert!(Executing.can_advance_to(ExecFinished));
        assert!(Executing.can_advance_to(ExpectingData));
        assert!(ExpectingData.can_advance_to(ExecScheduled));
        assert!(ExecFinished.can_advance_to(ExpectingExpbufAck));
        assert!(ExpectingExpbufAck.can_advance_to(ExpbufAcked));
        assert!(ExpbufAcked.can_advance_to(Ok));
        assert!(ExecFinished.can_advance_to(Ok));
        assert!(Executing.can_advance_to(Error));

        assert!(!Initializing.can_advance_to(Executing));
        assert!(!ExecFinished.can_advance_to(ExpbufAcked));
        assert!(!Ok.can_advance_to(ExecScheduled));
    }

    #[test]
    fn fail_sets_failure_bit() {
        let mut ctx = scan_ctx();
        ctx.fail();
        assert_eq!(ctx.state, CmdState::Error);
        assert!(ctx.res_hdr.failed());
        assert!(ctx.response_bytes()[0] & crate::protocol::STATUS_FAILURE != 0);
    }

    #[test]
    fn scan_flags_cover_sync_export() {
        let flags = client_cmd_flags(SidCmd::Scan);
        assert!(flags.contains(CmdFlags::IMPORT_UDEV));
        assert!(flags.contains(CmdFlags::EXPORT_SYNC));
        assert!(flags.contains(CmdFlags::EXPBUF_TO_MAIN));
        assert!(flags.contains(CmdFlags::EXPECT_EXPBUF_ACK));
        assert!(!flags.contains(CmdFlags::EXPBUF_TO_FILE));
    }
}
