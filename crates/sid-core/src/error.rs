//! Error types for the KV store and value codecs.

use thiserror::Error;

/// Errors raised by KV store operations and update predicates.
///
/// The three flag-conflict variants are distinct on purpose: a caller (or a
/// module author reading logs) must be able to tell whether a write bounced
/// off a private, protected, or reserved record, since each implies a
/// different remedy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum KvError {
    /// The record is private to another module; reads and writes by anyone
    /// else are refused.
    #[error("key {key} is private and attached to module {owner}")]
    FlagConflictPrivate {
        /// Key of the refused write.
        key: String,
        /// Module that owns the record.
        owner: String,
    },

    /// The record is protected; only the owning module may overwrite it.
    #[error("key {key} is protected and attached to module {owner}")]
    FlagConflictProtected {
        /// Key of the refused write.
        key: String,
        /// Module that owns the record.
        owner: String,
    },

    /// The record (or key reservation) belongs to another module.
    #[error("key {key} is reserved and attached to module {owner}")]
    FlagConflictReserved {
        /// Key of the refused write.
        key: String,
        /// Module that owns the record.
        owner: String,
    },

    /// An incoming record lost the per-key sequence-number race: a newer
    /// write is already stored.
    #[error("stale update for key {key}: seqnum {new_seqnum} < {old_seqnum}")]
    StaleSeqnum {
        /// Key of the discarded update.
        key: String,
        /// Sequence number carried by the discarded update.
        new_seqnum: u64,
        /// Sequence number of the record that stays.
        old_seqnum: u64,
    },

    /// An update predicate rejected the write without a more specific
    /// reason.
    #[error("update rejected for key {key}")]
    Rejected {
        /// Key of the rejected update.
        key: String,
    },

    /// The key does not exist.
    #[error("key {key} not found")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// An alias with this name already points at a different record.
    #[error("alias {alias} already exists")]
    AliasExists {
        /// The conflicting alias key.
        alias: String,
    },

    /// A vector operation was applied to a record that holds a blob value.
    #[error("key {key} does not hold a vector value")]
    NotVector {
        /// Key of the mismatched record.
        key: String,
    },

    /// A vector record still has members and the operation was not forced.
    #[error("vector under key {key} is not empty")]
    NotEmpty {
        /// Key of the non-empty record.
        key: String,
    },

    /// The operator slot of a key holds a character outside the SET/PLUS/
    /// MINUS alphabet.
    #[error("illegal operator in key {key}")]
    IllegalOp {
        /// The offending key.
        key: String,
    },
}

/// Errors raised while decoding serialized records from an export stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The input ended before a complete field could be read.
    #[error("truncated record: needed {needed} more bytes")]
    Truncated {
        /// Additional bytes required to finish the current field.
        needed: usize,
    },

    /// A key or owner string was not NUL-terminated or not valid UTF-8.
    #[error("malformed string field in record")]
    BadString,

    /// A vector value arrived with fewer slices than the mandatory header.
    #[error("vector value with {got} slices, need at least {min}")]
    ShortVector {
        /// Number of slices received.
        got: usize,
        /// Minimum slice count (the header alone).
        min: usize,
    },

    /// A blob value was shorter than its fixed header.
    #[error("blob value of {got} bytes, need at least {min}")]
    ShortBlob {
        /// Number of bytes received.
        got: usize,
        /// Minimum byte count.
        min: usize,
    },
}
