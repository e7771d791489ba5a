//! # sid-daemon
//!
//! The SID daemon: processes kernel block-device uevents through a
//! per-device command pipeline and coordinates identification and
//! classification across pluggable modules.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐ accept  ┌──────────────┐ channel ┌────────────┐
//! │   bridge     │────────▶│ worker proxy │◀───────▶│   worker   │
//! │ (main store) │         │ (per worker) │  + FDs  │ (snapshot) │
//! └─────────────┘          └──────────────┘         └────────────┘
//!        ▲                        │                       │
//!        └──── sync merge ◀───────┘      scan pipeline ───┘
//! ```
//!
//! The main process owns the listening socket and the main KV store.
//! Every accepted connection is forwarded to a short-lived worker
//! process which runs the device through the scan phase sequence against
//! a private snapshot of the store; the records it flags for
//! synchronization travel back in an export buffer and are merged under
//! sequence-number and ownership rules.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bridge;
pub mod cmd;
pub mod config;
pub mod context;
pub mod device;
pub mod dump;
pub mod module;
pub mod protocol;
pub mod scan;
pub mod sync;
pub mod sysfs;
pub mod worker;

pub use cmd::{CmdState, UcmdCtx, UcmdError};
pub use config::DaemonConfig;
pub use context::CommonCtx;
pub use module::{ModuleRegistry, ScanModule};
pub use protocol::{MsgHeader, OutputFormat, SidCmd, SID_PROTOCOL};
pub use scan::ScanPhase;
