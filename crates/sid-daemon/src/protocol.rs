//! External and internal wire protocol.
//!
//! Every request travels as one length-prefixed frame (see
//! [`sid_core::FrameCodec`]) whose payload starts with a fixed 5-byte
//! message header:
//!
//! ```text
//! +--------+--------+--------+-----------------+
//! | status | proto  | cmd    | flags (u16, LE) |
//! +--------+--------+--------+-----------------+
//! ```
//!
//! The protocol version must match [`SID_PROTOCOL`] exactly; there is no
//! negotiation. Privileged commands require the connecting peer to be
//! root, verified through `SO_PEERCRED` on the connected socket — never
//! from anything the client sends.
//!
//! Worker-proxy channels wrap the same header in an internal message that
//! additionally carries the message category (system, self-induced, or
//! forwarded client request) and, for system messages, the identifier of
//! the command the message belongs to.

use std::io;

use thiserror::Error;
use tokio::net::UnixStream;

/// Compiled protocol version; requests with any other version are
/// rejected.
pub const SID_PROTOCOL: u8 = 2;

/// Serialized length of [`MsgHeader`].
pub const MSG_HEADER_LEN: usize = 5;

/// Serialized length of [`InternalMsgHeader`].
pub const INTERNAL_MSG_HEADER_LEN: usize = 1 + MSG_HEADER_LEN;

/// Status bit: the command failed.
pub const STATUS_FAILURE: u8 = 0x1;

/// Mask of the output-format bits inside the header flags.
pub const FORMAT_MASK: u16 = 0x0003;

/// Protocol-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The request frame is shorter than the message header.
    #[error("request of {got} bytes is shorter than the {MSG_HEADER_LEN}-byte header")]
    ShortHeader {
        /// Received byte count.
        got: usize,
    },

    /// The peer speaks a different protocol version.
    #[error("protocol version {got} unsupported, this daemon speaks {SID_PROTOCOL}")]
    UnsupportedProtocol {
        /// Version claimed by the peer.
        got: u8,
    },

    /// The peer lacks permission for the requested command.
    #[error("peer (uid {uid}) is not permitted to run command {cmd:?}")]
    Unauthorized {
        /// Peer UID from `SO_PEERCRED`.
        uid: u32,
        /// The refused command.
        cmd: SidCmd,
    },

    /// The scan payload was malformed.
    #[error("malformed udev environment payload: {reason}")]
    BadUdevEnv {
        /// What was wrong.
        reason: String,
    },

    /// Underlying socket failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Client-visible commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SidCmd {
    /// Reserved zero value.
    Undefined = 0,
    /// Out-of-range command numbers map here.
    Unknown = 1,
    /// Liveness probe.
    Active = 2,
    /// Import a device's udev environment without scanning.
    Checkpoint = 3,
    /// Reply envelope (responses only).
    Reply = 4,
    /// Process one device uevent through the scan pipeline.
    Scan = 5,
    /// Report daemon and protocol versions.
    Version = 6,
    /// Dump the KV database.
    DbDump = 7,
    /// Report KV database size statistics.
    DbStats = 8,
    /// Dump the resource tree of the main process.
    Resources = 9,
}

impl SidCmd {
    /// Decode a command byte, mapping anything out of range to
    /// [`SidCmd::Unknown`].
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Undefined,
            2 => Self::Active,
            3 => Self::Checkpoint,
            4 => Self::Reply,
            5 => Self::Scan,
            6 => Self::Version,
            7 => Self::DbDump,
            8 => Self::DbStats,
            9 => Self::Resources,
            _ => Self::Unknown,
        }
    }

    /// Whether this command requires a root peer.
    #[must_use]
    pub const fn root_only(self) -> bool {
        matches!(
            self,
            Self::Checkpoint | Self::Scan | Self::DbDump | Self::DbStats | Self::Resources
        )
    }
}

/// Requested output format, selected by flag bits in the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// JSON document.
    Json,
    /// `KEY=VALUE` environment lines.
    Env,
}

impl OutputFormat {
    /// Decode the format from header flags.
    #[must_use]
    pub const fn from_flags(flags: u16) -> Self {
        match flags & FORMAT_MASK {
            1 => Self::Json,
            2 => Self::Env,
            _ => Self::Table,
        }
    }

    /// Encode the format into header flag bits.
    #[must_use]
    pub const fn to_flags(self) -> u16 {
        match self {
            Self::Table => 0,
            Self::Json => 1,
            Self::Env => 2,
        }
    }
}

/// Fixed header at the front of every request and response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Status bits; [`STATUS_FAILURE`] marks a failed command.
    pub status: u8,
    /// Protocol version.
    pub prot: u8,
    /// Command number.
    pub cmd: u8,
    /// Command flags (output format selection).
    pub flags: u16,
}

impl MsgHeader {
    /// A request header for `cmd` at the compiled protocol version.
    #[must_use]
    pub const fn request(cmd: SidCmd, flags: u16) -> Self {
        Self {
            status: 0,
            prot: SID_PROTOCOL,
            cmd: cmd as u8,
            flags,
        }
    }

    /// A success reply header mirroring the compiled protocol version.
    #[must_use]
    pub const fn reply() -> Self {
        Self {
            status: 0,
            prot: SID_PROTOCOL,
            cmd: SidCmd::Reply as u8,
            flags: 0,
        }
    }

    /// The decoded command.
    #[must_use]
    pub const fn command(&self) -> SidCmd {
        SidCmd::from_u8(self.cmd)
    }

    /// Whether the failure bit is set.
    #[must_use]
    pub const fn failed(&self) -> bool {
        self.status & STATUS_FAILURE != 0
    }

    /// Set the failure bit.
    pub fn set_failure(&mut self) {
        self.status |= STATUS_FAILURE;
    }

    /// Serialize into the 5-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; MSG_HEADER_LEN] {
        let flags = self.flags.to_le_bytes();
        [self.status, self.prot, self.cmd, flags[0], flags[1]]
    }

    /// Parse the header off the front of a frame.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ShortHeader`] when the frame is too short.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < MSG_HEADER_LEN {
            return Err(ProtocolError::ShortHeader { got: frame.len() });
        }
        Ok(Self {
            status: frame[0],
            prot: frame[1],
            cmd: frame[2],
            flags: u16::from_le_bytes([frame[3], frame[4]]),
        })
    }
}

/// Category of an internal worker⇄proxy message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgCategory {
    /// System-level message between worker and proxy.
    System = 0,
    /// Self-induced message (internally triggered command).
    SelfInduced = 1,
    /// Forwarded client request.
    Client = 2,
}

impl MsgCategory {
    /// Decode a category byte.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::System),
            1 => Some(Self::SelfInduced),
            2 => Some(Self::Client),
            _ => None,
        }
    }
}

/// System-level internal commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemCmd {
    /// Reserved zero value.
    Undefined = 0,
    /// Out-of-range command numbers map here.
    Unknown = 1,
    /// Export-buffer synchronization (worker → proxy) and its ack
    /// (proxy → worker).
    Sync = 2,
    /// Resource-tree dump request/reply.
    Resources = 3,
}

impl SystemCmd {
    /// Decode a system command byte.
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Undefined,
            2 => Self::Sync,
            3 => Self::Resources,
            _ => Self::Unknown,
        }
    }
}

/// Self-induced internal commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SelfCmd {
    /// Reserved zero value.
    Undefined = 0,
    /// Out-of-range command numbers map here.
    Unknown = 1,
    /// Dump the KV database to a file.
    DbDump = 2,
}

impl SelfCmd {
    /// Decode a self command byte.
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Undefined,
            2 => Self::DbDump,
            _ => Self::Unknown,
        }
    }
}

/// Internal message header: category plus the regular message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalMsgHeader {
    /// Message category.
    pub cat: MsgCategory,
    /// Embedded message header; its `cmd` field is interpreted per
    /// category.
    pub header: MsgHeader,
}

impl InternalMsgHeader {
    /// System message header for `cmd`.
    #[must_use]
    pub const fn system(cmd: SystemCmd) -> Self {
        Self {
            cat: MsgCategory::System,
            header: MsgHeader {
                status: 0,
                prot: 0,
                cmd: cmd as u8,
                flags: 0,
            },
        }
    }

    /// Self-induced message header for `cmd`.
    #[must_use]
    pub const fn self_induced(cmd: SelfCmd, flags: u16) -> Self {
        Self {
            cat: MsgCategory::SelfInduced,
            header: MsgHeader {
                status: 0,
                prot: SID_PROTOCOL,
                cmd: cmd as u8,
                flags,
            },
        }
    }

    /// Forwarded-client message header.
    #[must_use]
    pub const fn client() -> Self {
        Self {
            cat: MsgCategory::Client,
            header: MsgHeader {
                status: 0,
                prot: 0,
                cmd: 0,
                flags: 0,
            },
        }
    }

    /// Serialize, appending an optional trailing payload (typically the
    /// command identifier).
    #[must_use]
    pub fn encode_with(&self, trailer: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(INTERNAL_MSG_HEADER_LEN + trailer.len());
        out.push(self.cat as u8);
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(trailer);
        out
    }

    /// Parse from the front of a channel payload, returning the header
    /// and the trailing bytes.
    #[must_use]
    pub fn decode(payload: &[u8]) -> Option<(Self, &[u8])> {
        if payload.len() < INTERNAL_MSG_HEADER_LEN {
            return None;
        }
        let cat = MsgCategory::from_u8(payload[0])?;
        let header = MsgHeader::decode(&payload[1..]).ok()?;
        Some((Self { cat, header }, &payload[INTERNAL_MSG_HEADER_LEN..]))
    }
}

/// Peer credentials extracted from a connected Unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// User ID of the peer process.
    pub uid: u32,
    /// Group ID of the peer process.
    pub gid: u32,
    /// Process ID of the peer process, when the platform reports one.
    pub pid: Option<i32>,
}

impl PeerCredentials {
    /// Extract credentials via `SO_PEERCRED`.
    ///
    /// # Errors
    ///
    /// Returns the socket option failure.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let creds = stream.peer_cred()?;
        Ok(Self {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid(),
        })
    }

    /// Whether this peer may run `cmd`: root runs anything, everyone else
    /// only the unprivileged commands.
    #[must_use]
    pub const fn is_capable(&self, cmd: SidCmd) -> bool {
        self.uid == 0 || !cmd.root_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hdr = MsgHeader::request(SidCmd::Scan, OutputFormat::Json.to_flags());
        let decoded = MsgHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.command(), SidCmd::Scan);
        assert_eq!(OutputFormat::from_flags(decoded.flags), OutputFormat::Json);
    }

    #[test]
    fn short_header_rejected() {
        assert!(matches!(
            MsgHeader::decode(&[0, 0, 0]),
            Err(ProtocolError::ShortHeader { got: 3 })
        ));
    }

    #[test]
    fn out_of_range_command_maps_to_unknown() {
        assert_eq!(SidCmd::from_u8(200), SidCmd::Unknown);
        assert_eq!(SidCmd::from_u8(1), SidCmd::Unknown);
    }

    #[test]
    fn root_only_table() {
        for cmd in [
            SidCmd::Checkpoint,
            SidCmd::Scan,
            SidCmd::DbDump,
            SidCmd::DbStats,
            SidCmd::Resources,
        ] {
            assert!(cmd.root_only(), "{cmd:?} must be privileged");
        }
        for cmd in [SidCmd::Active, SidCmd::Version, SidCmd::Reply, SidCmd::Unknown] {
            assert!(!cmd.root_only(), "{cmd:?} must be unprivileged");
        }
    }

    #[test]
    fn failure_bit() {
        let mut hdr = MsgHeader::reply();
        assert!(!hdr.failed());
        hdr.set_failure();
        assert!(hdr.failed());
    }

    #[test]
    fn internal_header_roundtrip_with_cmd_id() {
        let msg = InternalMsgHeader::system(SystemCmd::Sync);
        let encoded = msg.encode_with(b"cmd-42\0");
        let (decoded, trailer) = InternalMsgHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(trailer, b"cmd-42\0");
        assert_eq!(SystemCmd::from_u8(decoded.header.cmd), SystemCmd::Sync);
    }

    #[test]
    fn nonroot_cannot_run_privileged_commands() {
        let creds = PeerCredentials {
            uid: 1000,
            gid: 1000,
            pid: Some(1),
        };
        assert!(!creds.is_capable(SidCmd::Scan));
        assert!(creds.is_capable(SidCmd::Version));

        let root = PeerCredentials {
            uid: 0,
            gid: 0,
            pid: Some(1),
        };
        assert!(root.is_capable(SidCmd::Scan));
    }
}
