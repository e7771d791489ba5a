//! Composite key codec.
//!
//! Every record in the store is addressed by a seven-part composite key:
//!
//! ```text
//! <op>:<dom>:<ns>:<ns_part>:<id>:<id_part>:<core>
//! ```
//!
//! - `op` selects the delta operator slot (`""` SET, `"+"` PLUS, `"-"` MINUS)
//! - `dom` separates hierarchy-maintained records (`LYR`) from user/module
//!   records (`USR`)
//! - `ns` is the namespace prefix character
//! - `ns_part` scopes the namespace (`major_minor` for device-scoped
//!   namespaces, the module name for module scope)
//! - `id`/`id_part` address subgroups
//! - `core` is the caller-supplied key suffix
//!
//! A *prefix-only* form omits the final `:<core>` and serves as the anchor
//! element stored inside relation vectors.
//!
//! Records carrying the SYNC flag additionally get an index alias equal to
//! the primary key with a leading [`SYNC_ALIAS_PREFIX`] byte; iterating the
//! half-open range `[">", "?")` therefore yields exactly the SYNC-flagged
//! records in key order.

use std::fmt;

/// Delimiter between key parts.
pub const KEY_JOIN: char = ':';

/// Leading byte of a sync index alias key.
pub const SYNC_ALIAS_PREFIX: char = '>';

/// Exclusive upper bound of the sync alias range (the byte right after `>`).
pub const SYNC_ALIAS_END: char = '?';

/// Domain of records maintained by the layer/hierarchy subsystem.
pub const DOM_LAYER: &str = "LYR";

/// Domain of records written by modules on a user's behalf.
pub const DOM_USER: &str = "USR";

/// Empty domain/id placeholder.
pub const ID_NULL: &str = "";

/// Leading character of core-owned (system) key suffixes; user keys must
/// not start with it.
pub const SYS_KEY_PREFIX: char = '#';

/// Delta operator encoded in a key's operator slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KvOp {
    /// Replace the whole value.
    #[default]
    Set,
    /// Add elements to a vector value.
    Plus,
    /// Remove elements from a vector value.
    Minus,
    /// Unrecognized operator character.
    Illegal,
}

impl KvOp {
    /// The prefix string this operator contributes to a composed key.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Set => "",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Illegal => "X",
        }
    }
}

impl fmt::Display for KvOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Record namespace, selecting visibility and scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KvNamespace {
    /// No namespace; used for global reservations spanning all devices.
    #[default]
    Undefined,
    /// Per-device udev properties, re-exported to udev after a scan.
    Udev,
    /// Per-device SID records.
    Device,
    /// Per-module records.
    Module,
    /// Daemon-global records.
    Global,
}

impl KvNamespace {
    /// The prefix character this namespace contributes to a composed key.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Undefined => "",
            Self::Udev => "U",
            Self::Device => "D",
            Self::Module => "M",
            Self::Global => "G",
        }
    }
}

impl fmt::Display for KvNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Index of a part inside the composite key, in delimiter order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum KeyPart {
    /// Operator slot.
    Op = 0,
    /// Domain.
    Dom = 1,
    /// Namespace character.
    Ns = 2,
    /// Namespace scope part.
    NsPart = 3,
    /// Subgroup id.
    Id = 4,
    /// Subgroup id part.
    IdPart = 5,
    /// Caller-supplied suffix.
    Core = 6,
}

/// Total number of parts in a full key.
pub const KEY_PART_COUNT: usize = 7;

/// Specification from which a composite key is composed.
#[derive(Debug, Clone, Default)]
pub struct KeySpec {
    /// Delta operator slot.
    pub op: KvOp,
    /// Domain (`""`, [`DOM_LAYER`] or [`DOM_USER`]).
    pub dom: String,
    /// Namespace.
    pub ns: KvNamespace,
    /// Namespace scope part.
    pub ns_part: String,
    /// Subgroup id.
    pub id: String,
    /// Subgroup id part.
    pub id_part: String,
    /// Caller-supplied key suffix.
    pub core: String,
}

impl KeySpec {
    /// Compose the full key: `<op>:<dom>:<ns>:<ns_part>:<id>:<id_part>:<core>`.
    #[must_use]
    pub fn compose(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.op.prefix(),
            self.dom,
            self.ns.prefix(),
            self.ns_part,
            self.id,
            self.id_part,
            self.core
        )
    }

    /// Compose the prefix-only form: `<op>:<dom>:<ns>:<ns_part>:<id>:<id_part>`.
    ///
    /// This is the shape stored as an element of relation vectors.
    #[must_use]
    pub fn compose_prefix(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.op.prefix(),
            self.dom,
            self.ns.prefix(),
            self.ns_part,
            self.id,
            self.id_part
        )
    }

    /// Swap the roles of this spec and `other` in place.
    ///
    /// Used when propagating a relation update from the current key to the
    /// related key.
    pub fn swap_with(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }
}

/// Return the `part`-th component of `key`, or `None` if the key has fewer
/// delimiters.
///
/// The final part ([`KeyPart::Core`]) extends to the end of the key and may
/// itself contain delimiter characters.
#[must_use]
pub fn key_part(key: &str, part: KeyPart) -> Option<&str> {
    let mut rest = key;
    let idx = part as usize;
    for _ in 0..idx {
        let pos = rest.find(KEY_JOIN)?;
        rest = &rest[pos + 1..];
    }
    if idx == KEY_PART_COUNT - 1 {
        Some(rest)
    } else {
        rest.find(KEY_JOIN).map(|pos| &rest[..pos])
    }
}

/// Extract the delta operator from a key's operator slot.
///
/// An empty slot means SET; anything longer than one byte or outside the
/// operator alphabet is [`KvOp::Illegal`].
#[must_use]
pub fn op_from_key(key: &str) -> KvOp {
    match key_part(key, KeyPart::Op) {
        Some("") => KvOp::Set,
        Some("+") => KvOp::Plus,
        Some("-") => KvOp::Minus,
        _ => KvOp::Illegal,
    }
}

/// Strip the operator prefix from a key, yielding the SET-form key.
#[must_use]
pub fn strip_op(key: &str) -> &str {
    match op_from_key(key) {
        KvOp::Plus | KvOp::Minus => &key[1..],
        _ => key,
    }
}

/// Extract the namespace from a key's namespace slot.
#[must_use]
pub fn ns_from_key(key: &str) -> KvNamespace {
    match key_part(key, KeyPart::Ns) {
        Some("U") => KvNamespace::Udev,
        Some("D") => KvNamespace::Device,
        Some("M") => KvNamespace::Module,
        Some("G") => KvNamespace::Global,
        _ => KvNamespace::Undefined,
    }
}

/// Extract the namespace scope part of a key.
#[must_use]
pub fn ns_part_from_key(key: &str) -> Option<&str> {
    key_part(key, KeyPart::NsPart)
}

/// The sync index alias key for a primary key.
#[must_use]
pub fn sync_alias_key(key: &str) -> String {
    format!("{SYNC_ALIAS_PREFIX}{key}")
}
