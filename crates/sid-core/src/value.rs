//! KV record model and wire codec.
//!
//! Every stored value carries a fixed header (generation number, udev
//! sequence number, flag bitset, owner module name) followed by either a
//! single opaque blob or a vector of byte slices. On the wire — in the
//! export buffer shipped from a worker to the main process, and in
//! persistent snapshots — both shapes serialize to the record layout
//! described at [`encode_record`].
//!
//! # Invariants
//!
//! - Vector payload elements are strictly ascending under byte-wise
//!   comparison, with no duplicates. The delta engine depends on this.
//! - A record whose payload is empty and whose flags do not include
//!   `MOD_RESERVED` is an *unset marker*: importing it removes the record
//!   from the receiving store.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::error::DecodeError;

/// Number of header slices at the front of a serialized vector value.
pub const VECTOR_HEADER_SLICES: usize = 4;

/// Fixed byte length of a serialized blob header before the owner string.
const BLOB_FIXED_LEN: usize = 2 + 8 + 4;

/// Store-level wire flag marking a vector-shaped value.
pub const WIRE_FLAG_VECTOR: u32 = 0x1;

/// Per-record flag bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ValueFlags(u32);

impl ValueFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Record is synchronized from worker snapshots to the main store and
    /// indexed under a sync alias.
    pub const SYNC: Self = Self(1 << 0);
    /// Record survives into persistent snapshots.
    pub const PERSISTENT: Self = Self(1 << 1);
    /// Only the owner may overwrite; others fail with a protected-flag
    /// conflict.
    pub const MOD_PROTECTED: Self = Self(1 << 2);
    /// Only the owner may read or overwrite; others fail with a
    /// private-flag conflict.
    pub const MOD_PRIVATE: Self = Self(1 << 3);
    /// Key is reserved by the owner; others fail with a reserved-flag
    /// conflict.
    pub const MOD_RESERVED: Self = Self(1 << 4);

    /// Default flag set for core-owned records: synchronized, persistent,
    /// and locked against foreign writers.
    pub const CORE_DEFAULTS: Self = Self(
        Self::SYNC.0 | Self::PERSISTENT.0 | Self::MOD_RESERVED.0 | Self::MOD_PRIVATE.0,
    );

    /// Construct from the raw wire representation.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw wire representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any of the ownership flags (protected, private, reserved)
    /// is set.
    #[must_use]
    pub const fn is_mod_owned(self) -> bool {
        self.0 & (Self::MOD_PROTECTED.0 | Self::MOD_PRIVATE.0 | Self::MOD_RESERVED.0) != 0
    }

    /// Set the given flags.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the given flags.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// This flag set with the given flags cleared.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for ValueFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ValueFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ValueFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for ValueFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (Self::SYNC, "SYNC"),
            (Self::PERSISTENT, "PERSISTENT"),
            (Self::MOD_PROTECTED, "MOD_PROTECTED"),
            (Self::MOD_PRIVATE, "MOD_PRIVATE"),
            (Self::MOD_RESERVED, "MOD_RESERVED"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Fixed header carried by every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueHeader {
    /// Store generation number at the moment of insertion.
    pub gennum: u16,
    /// udev sequence number of the device whose processing wrote the
    /// record.
    pub seqnum: u64,
    /// Flag bitset.
    pub flags: ValueFlags,
    /// Name of the module that wrote the record.
    pub owner: String,
}

impl ValueHeader {
    /// New header with the given fields.
    #[must_use]
    pub fn new(gennum: u16, seqnum: u64, flags: ValueFlags, owner: impl Into<String>) -> Self {
        Self {
            gennum,
            seqnum,
            flags,
            owner: owner.into(),
        }
    }
}

/// Value payload: a single opaque blob or a vector of byte slices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValuePayload {
    /// Opaque bytes.
    Blob(Vec<u8>),
    /// Sorted vector of byte slices.
    Vector(Vec<Vec<u8>>),
}

impl ValuePayload {
    /// Whether this payload carries no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Blob(b) => b.is_empty(),
            Self::Vector(v) => v.is_empty(),
        }
    }

    /// Payload byte size (sum of element sizes for vectors).
    #[must_use]
    pub fn data_len(&self) -> usize {
        match self {
            Self::Blob(b) => b.len(),
            Self::Vector(v) => v.iter().map(Vec::len).sum(),
        }
    }
}

/// A complete record: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRecord {
    /// Fixed record header.
    pub header: ValueHeader,
    /// Blob or vector payload.
    pub payload: ValuePayload,
}

impl KvRecord {
    /// New blob record.
    #[must_use]
    pub fn blob(header: ValueHeader, data: Vec<u8>) -> Self {
        Self {
            header,
            payload: ValuePayload::Blob(data),
        }
    }

    /// New vector record. Elements are sorted and deduplicated to uphold
    /// the ordering invariant.
    #[must_use]
    pub fn vector(header: ValueHeader, mut items: Vec<Vec<u8>>) -> Self {
        sort_dedup(&mut items);
        Self {
            header,
            payload: ValuePayload::Vector(items),
        }
    }

    /// Whether this record is vector-shaped.
    #[must_use]
    pub fn is_vector(&self) -> bool {
        matches!(self.payload, ValuePayload::Vector(_))
    }

    /// The vector elements, or `None` for a blob record.
    #[must_use]
    pub fn items(&self) -> Option<&[Vec<u8>]> {
        match &self.payload {
            ValuePayload::Vector(v) => Some(v),
            ValuePayload::Blob(_) => None,
        }
    }

    /// The blob bytes, or `None` for a vector record.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match &self.payload {
            ValuePayload::Blob(b) => Some(b),
            ValuePayload::Vector(_) => None,
        }
    }

    /// Whether this record is an unset marker: an empty payload not held
    /// open by a reservation.
    #[must_use]
    pub fn is_unset_marker(&self) -> bool {
        self.payload.is_empty() && !self.header.flags.contains(ValueFlags::MOD_RESERVED)
    }
}

/// Sort `items` byte-wise ascending and drop duplicates.
pub fn sort_dedup(items: &mut Vec<Vec<u8>>) {
    items.sort_unstable_by(|a, b| cmp_bytes(a, b));
    items.dedup();
}

/// Byte-wise comparison used for the vector ordering invariant.
#[must_use]
pub fn cmp_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Check the strict-ascending invariant of a vector payload.
#[must_use]
pub fn is_strictly_sorted(items: &[Vec<u8>]) -> bool {
    items.windows(2).all(|w| cmp_bytes(&w[0], &w[1]) == Ordering::Less)
}

/// Serialize one record into `out`.
///
/// Layout (all integers little-endian):
///
/// ```text
/// store_flags   u32     bit 0 set for vector values
/// key_size      u64     key bytes including the NUL terminator
/// value_size    u64     blob: total value bytes; vector: slice count
/// key           key_size bytes
/// value         blob:   gennum u16, seqnum u64, flags u32,
///                       owner bytes + NUL, data bytes
///               vector: value_size x { slice_len u64, slice bytes },
///                       slices 0..4 being gennum, seqnum, flags and the
///                       NUL-terminated owner
/// ```
pub fn encode_record(key: &str, record: &KvRecord, out: &mut Vec<u8>) {
    let store_flags: u32 = if record.is_vector() { WIRE_FLAG_VECTOR } else { 0 };
    out.extend_from_slice(&store_flags.to_le_bytes());
    out.extend_from_slice(&(key.len() as u64 + 1).to_le_bytes());

    let hdr = &record.header;
    match &record.payload {
        ValuePayload::Blob(data) => {
            let value_size = BLOB_FIXED_LEN + hdr.owner.len() + 1 + data.len();
            out.extend_from_slice(&(value_size as u64).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.push(0);
            out.extend_from_slice(&hdr.gennum.to_le_bytes());
            out.extend_from_slice(&hdr.seqnum.to_le_bytes());
            out.extend_from_slice(&hdr.flags.bits().to_le_bytes());
            out.extend_from_slice(hdr.owner.as_bytes());
            out.push(0);
            out.extend_from_slice(data);
        }
        ValuePayload::Vector(items) => {
            let slice_count = VECTOR_HEADER_SLICES + items.len();
            out.extend_from_slice(&(slice_count as u64).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.push(0);

            let mut put_slice = |bytes: &[u8]| {
                out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(bytes);
            };
            put_slice(&hdr.gennum.to_le_bytes());
            put_slice(&hdr.seqnum.to_le_bytes());
            put_slice(&hdr.flags.bits().to_le_bytes());
            let mut owner = hdr.owner.clone().into_bytes();
            owner.push(0);
            put_slice(&owner);
            for item in items {
                put_slice(item);
            }
        }
    }
}

/// Cursor over a serialized record stream.
#[derive(Debug)]
pub struct RecordCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    /// Cursor over `buf`, starting at its first record.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether all records have been consumed.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated { needed: n })?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                needed: end - self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_cstr(&mut self, n: usize) -> Result<String, DecodeError> {
        let bytes = self.take(n)?;
        let stripped = bytes.strip_suffix(&[0]).ok_or(DecodeError::BadString)?;
        String::from_utf8(stripped.to_vec()).map_err(|_| DecodeError::BadString)
    }

    /// Decode the next record, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] on a truncated or malformed record.
    pub fn next_record(&mut self) -> Result<Option<(String, KvRecord)>, DecodeError> {
        if self.is_at_end() {
            return Ok(None);
        }

        let store_flags = self.take_u32()?;
        let key_size = self.take_u64()? as usize;
        let value_size = self.take_u64()? as usize;
        let key = self.take_cstr(key_size)?;

        let record = if store_flags & WIRE_FLAG_VECTOR != 0 {
            if value_size < VECTOR_HEADER_SLICES {
                return Err(DecodeError::ShortVector {
                    got: value_size,
                    min: VECTOR_HEADER_SLICES,
                });
            }
            let mut take_slice = |cur: &mut Self| -> Result<Vec<u8>, DecodeError> {
                let len = cur.take_u64()? as usize;
                Ok(cur.take(len)?.to_vec())
            };
            let gennum_raw = take_slice(self)?;
            let seqnum_raw = take_slice(self)?;
            let flags_raw = take_slice(self)?;
            let owner_raw = take_slice(self)?;
            if gennum_raw.len() != 2 || seqnum_raw.len() != 8 || flags_raw.len() != 4 {
                return Err(DecodeError::BadString);
            }
            let owner = owner_raw
                .strip_suffix(&[0])
                .and_then(|b| std::str::from_utf8(b).ok())
                .ok_or(DecodeError::BadString)?
                .to_string();
            let header = ValueHeader {
                gennum: u16::from_le_bytes(gennum_raw.try_into().unwrap()),
                seqnum: u64::from_le_bytes(seqnum_raw.try_into().unwrap()),
                flags: ValueFlags::from_bits(u32::from_le_bytes(flags_raw.try_into().unwrap())),
                owner,
            };
            let mut items = Vec::with_capacity(value_size - VECTOR_HEADER_SLICES);
            for _ in VECTOR_HEADER_SLICES..value_size {
                items.push(take_slice(self)?);
            }
            KvRecord {
                header,
                payload: ValuePayload::Vector(items),
            }
        } else {
            let min = BLOB_FIXED_LEN + 1;
            if value_size < min {
                return Err(DecodeError::ShortBlob { got: value_size, min });
            }
            let gennum = self.take_u16()?;
            let seqnum = self.take_u64()?;
            let flags = ValueFlags::from_bits(self.take_u32()?);
            let rest = self.take(value_size - BLOB_FIXED_LEN)?;
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(DecodeError::BadString)?;
            let owner = std::str::from_utf8(&rest[..nul])
                .map_err(|_| DecodeError::BadString)?
                .to_string();
            let data = rest[nul + 1..].to_vec();
            KvRecord {
                header: ValueHeader {
                    gennum,
                    seqnum,
                    flags,
                    owner,
                },
                payload: ValuePayload::Blob(data),
            }
        };

        Ok(Some((key, record)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(flags: ValueFlags) -> ValueHeader {
        ValueHeader::new(3, 42, flags, "mod_a")
    }

    #[test]
    fn flags_display_and_ops() {
        let mut f = ValueFlags::SYNC | ValueFlags::PERSISTENT;
        assert!(f.contains(ValueFlags::SYNC));
        assert!(!f.is_mod_owned());
        f.insert(ValueFlags::MOD_RESERVED);
        assert!(f.is_mod_owned());
        f.remove(ValueFlags::SYNC);
        assert!(!f.contains(ValueFlags::SYNC));
        assert_eq!(format!("{}", ValueFlags::NONE), "-");
        assert_eq!(
            format!("{}", ValueFlags::SYNC | ValueFlags::MOD_PRIVATE),
            "SYNC|MOD_PRIVATE"
        );
    }

    #[test]
    fn vector_constructor_sorts_and_dedups() {
        let rec = KvRecord::vector(
            header(ValueFlags::NONE),
            vec![b"b".to_vec(), b"a".to_vec(), b"b".to_vec()],
        );
        assert_eq!(rec.items().unwrap(), &[b"a".to_vec(), b"b".to_vec()]);
        assert!(is_strictly_sorted(rec.items().unwrap()));
    }

    #[test]
    fn unset_marker_detection() {
        let empty = KvRecord::blob(header(ValueFlags::SYNC), Vec::new());
        assert!(empty.is_unset_marker());

        let reserved = KvRecord::vector(header(ValueFlags::MOD_RESERVED), Vec::new());
        assert!(!reserved.is_unset_marker());

        let full = KvRecord::blob(header(ValueFlags::NONE), b"x".to_vec());
        assert!(!full.is_unset_marker());
    }

    #[test]
    fn blob_roundtrip() {
        let rec = KvRecord::blob(header(ValueFlags::SYNC | ValueFlags::PERSISTENT), b"add".to_vec());
        let mut buf = Vec::new();
        encode_record("::U:8_0:::ACTION", &rec, &mut buf);

        let mut cur = RecordCursor::new(&buf);
        let (key, decoded) = cur.next_record().unwrap().unwrap();
        assert_eq!(key, "::U:8_0:::ACTION");
        assert_eq!(decoded, rec);
        assert!(cur.next_record().unwrap().is_none());
    }

    #[test]
    fn vector_roundtrip() {
        let rec = KvRecord::vector(
            header(ValueFlags::SYNC),
            vec![b":LYR:D:8_1::\0".to_vec(), b":LYR:D:8_2::\0".to_vec()],
        );
        let mut buf = Vec::new();
        encode_record(":LYR:D:8_0:::#GMB", &rec, &mut buf);

        let mut cur = RecordCursor::new(&buf);
        let (key, decoded) = cur.next_record().unwrap().unwrap();
        assert_eq!(key, ":LYR:D:8_0:::#GMB");
        assert_eq!(decoded, rec);
    }

    #[test]
    fn multiple_records_in_stream() {
        let a = KvRecord::blob(header(ValueFlags::NONE), b"1".to_vec());
        let b = KvRecord::vector(header(ValueFlags::NONE), vec![b"x".to_vec()]);
        let mut buf = Vec::new();
        encode_record("k1", &a, &mut buf);
        encode_record("k2", &b, &mut buf);

        let mut cur = RecordCursor::new(&buf);
        assert_eq!(cur.next_record().unwrap().unwrap().0, "k1");
        assert_eq!(cur.next_record().unwrap().unwrap().0, "k2");
        assert!(cur.next_record().unwrap().is_none());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let rec = KvRecord::blob(header(ValueFlags::NONE), b"data".to_vec());
        let mut buf = Vec::new();
        encode_record("k", &rec, &mut buf);
        buf.truncate(buf.len() - 2);

        let mut cur = RecordCursor::new(&buf);
        assert!(cur.next_record().is_err());
    }

    #[test]
    fn short_vector_is_an_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&WIRE_FLAG_VECTOR.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes()); // key size
        buf.extend_from_slice(&2u64.to_le_bytes()); // only 2 slices
        buf.extend_from_slice(b"k\0");

        let mut cur = RecordCursor::new(&buf);
        assert!(matches!(
            cur.next_record(),
            Err(DecodeError::ShortVector { got: 2, min: 4 })
        ));
    }
}
