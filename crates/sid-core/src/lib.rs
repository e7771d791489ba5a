//! # sid-core
//!
//! Core library for SID, the storage instantiation daemon. This crate
//! holds the pieces that both the main process and its scan workers build
//! on:
//!
//! - **Framed buffers**: the length-prefixed frame codec used on every
//!   socket and the memfd/file-backed export buffer that carries KV
//!   records between processes.
//! - **KV store**: an ordered, predicate-gated key-value store with
//!   owner-tagged, flag-protected records and index aliases.
//! - **Key codec**: the seven-part composite key that namespaces every
//!   record.
//! - **Delta engine**: the SET/PLUS/MINUS vector algebra that keeps
//!   set-valued relations (group membership, device hierarchy)
//!   bidirectional and incrementally synchronizable.
//!
//! ## Example
//!
//! ```rust
//! use sid_core::key::{KeySpec, KvNamespace};
//! use sid_core::store::KvStore;
//! use sid_core::value::{KvRecord, ValueFlags, ValueHeader};
//!
//! let mut store = KvStore::new();
//! let key = KeySpec {
//!     ns: KvNamespace::Device,
//!     ns_part: "8_0".into(),
//!     core: "#RDY".into(),
//!     ..KeySpec::default()
//! }
//! .compose();
//!
//! let header = ValueHeader::new(1, 42, ValueFlags::CORE_DEFAULTS, "#core");
//! store.set(&key, KvRecord::blob(header, b"unprocessed".to_vec()));
//! assert!(store.get(&key).is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod buffer;
pub mod delta;
pub mod error;
pub mod key;
pub mod store;
pub mod value;

pub use buffer::{ExportBuffer, FrameCodec, MAX_FRAME_SIZE};
pub use error::{DecodeError, KvError};
pub use key::{KeySpec, KvNamespace, KvOp};
pub use store::{DbStats, IndexAction, KvStore};
pub use value::{KvRecord, ValueFlags, ValueHeader, ValuePayload};
