//! Ordered key-value store with predicate-gated updates and index aliases.
//!
//! The store maps composite string keys to [`KvRecord`] values. Updates go
//! through caller-supplied predicates so that ownership and ordering rules
//! are decided by the caller while the store enforces them atomically per
//! key. The B+-tree backing of the original is out of scope; an ordered map
//! provides the same value-level contract (point lookup, stable
//! prefix-range iteration, ordered keys).
//!
//! # Index aliases
//!
//! An alias is a redirect entry: looking up the alias resolves one hop to
//! the primary record. Aliases are the mechanism behind the sync index —
//! for every SYNC-flagged record a `>`-prefixed alias exists, so iterating
//! `[">", "?")` yields exactly the SYNC-flagged records. Unsetting a
//! primary leaves a dangling alias unreachable, which callers clean up via
//! [`KvStore::apply_index`].

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::error::KvError;
use crate::key::sync_alias_key;
use crate::value::{KvRecord, ValueFlags};

/// What to do with a record's sync index alias after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexAction {
    /// Leave the index untouched.
    #[default]
    Noop,
    /// Create the alias.
    Add,
    /// Remove the alias.
    Remove,
}

/// Decide the index action from the SYNC flag of the old and new record.
#[must_use]
pub fn index_action(old: Option<&KvRecord>, new: Option<&KvRecord>) -> IndexAction {
    let old_indexed = old.is_some_and(|r| r.header.flags.contains(ValueFlags::SYNC));
    let new_indexed = new.is_some_and(|r| r.header.flags.contains(ValueFlags::SYNC));
    match (old_indexed, new_indexed) {
        (true, false) => IndexAction::Remove,
        (false, true) => IndexAction::Add,
        _ => IndexAction::Noop,
    }
}

/// Standard overwrite predicate: refuse replacing a record whose ownership
/// flag forbids the new writer.
///
/// # Errors
///
/// [`KvError::FlagConflictPrivate`], [`KvError::FlagConflictProtected`] or
/// [`KvError::FlagConflictReserved`] when the old record carries the
/// respective flag and the owners differ.
pub fn overwrite_guard(
    key: &str,
    old: Option<&KvRecord>,
    new: &KvRecord,
) -> Result<IndexAction, KvError> {
    if let Some(old) = old {
        let old_flags = old.header.flags;
        let owners_differ = old.header.owner != new.header.owner;
        if owners_differ {
            if old_flags.contains(ValueFlags::MOD_PRIVATE) {
                return Err(KvError::FlagConflictPrivate {
                    key: key.to_string(),
                    owner: old.header.owner.clone(),
                });
            }
            if old_flags.contains(ValueFlags::MOD_PROTECTED) {
                return Err(KvError::FlagConflictProtected {
                    key: key.to_string(),
                    owner: old.header.owner.clone(),
                });
            }
            if old_flags.contains(ValueFlags::MOD_RESERVED) {
                return Err(KvError::FlagConflictReserved {
                    key: key.to_string(),
                    owner: old.header.owner.clone(),
                });
            }
        }
    }
    Ok(index_action(old, Some(new)))
}

/// Store size statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Total key bytes, including NUL terminators.
    pub key_size: u64,
    /// Total value bytes (headers plus payload).
    pub value_size: u64,
    /// Total payload bytes only.
    pub value_data_size: u64,
    /// Approximate bookkeeping overhead of the backing map.
    pub meta_size: u64,
    /// Number of records (aliases not counted).
    pub nr_kv_pairs: u32,
}

#[derive(Debug, Clone)]
enum Slot {
    Record(KvRecord),
    Alias(String),
}

/// The ordered KV store.
#[derive(Debug, Default)]
pub struct KvStore {
    map: BTreeMap<String, Slot>,
}

impl KvStore {
    /// New empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, aliases included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up a record, following an alias one hop.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&KvRecord> {
        match self.map.get(key)? {
            Slot::Record(r) => Some(r),
            Slot::Alias(target) => match self.map.get(target.as_str())? {
                Slot::Record(r) => Some(r),
                Slot::Alias(_) => None,
            },
        }
    }

    /// Insert or replace a record through an update function.
    ///
    /// `update` receives the old record (if any) and the proposed new
    /// record; it returns the record to actually store plus the index
    /// action, or an error to reject the write and keep the old value.
    /// Writing through an alias key updates the aliased primary.
    ///
    /// # Errors
    ///
    /// Whatever `update` returns.
    pub fn set_with<F>(&mut self, key: &str, new: KvRecord, update: F) -> Result<IndexAction, KvError>
    where
        F: FnOnce(Option<&KvRecord>, KvRecord) -> Result<(KvRecord, IndexAction), KvError>,
    {
        if let Some(Slot::Alias(target)) = self.map.get(key) {
            let target = target.clone();
            return self.set_with(&target, new, update);
        }
        let old = match self.map.get(key) {
            Some(Slot::Record(r)) => Some(r),
            _ => None,
        };
        let (stored, action) = update(old, new)?;
        self.map.insert(key.to_string(), Slot::Record(stored));
        Ok(action)
    }

    /// Insert or replace a record unconditionally.
    pub fn set(&mut self, key: &str, new: KvRecord) -> IndexAction {
        self.set_with(key, new, |old, new| {
            let action = index_action(old, Some(&new));
            Ok((new, action))
        })
        .expect("unconditional update cannot fail")
    }

    /// Remove a record if the predicate admits it.
    ///
    /// # Errors
    ///
    /// [`KvError::NotFound`] if the key is absent; otherwise whatever the
    /// predicate returns.
    pub fn unset_with<F>(&mut self, key: &str, predicate: F) -> Result<(), KvError>
    where
        F: FnOnce(&KvRecord) -> Result<(), KvError>,
    {
        match self.map.get(key) {
            Some(Slot::Record(r)) => {
                predicate(r)?;
                self.map.remove(key);
                Ok(())
            }
            Some(Slot::Alias(_)) => {
                self.map.remove(key);
                Ok(())
            }
            None => Err(KvError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    /// Remove a record unconditionally, ignoring a missing key.
    pub fn unset(&mut self, key: &str) {
        self.map.remove(key);
    }

    /// Register `alias` as a redirect to `key`.
    ///
    /// # Errors
    ///
    /// [`KvError::AliasExists`] if the alias name is already taken by a
    /// record and `force` is not set.
    pub fn add_alias(&mut self, key: &str, alias: &str, force: bool) -> Result<(), KvError> {
        if !force {
            if let Some(Slot::Record(_)) = self.map.get(alias) {
                return Err(KvError::AliasExists {
                    alias: alias.to_string(),
                });
            }
        }
        self.map.insert(alias.to_string(), Slot::Alias(key.to_string()));
        Ok(())
    }

    /// Apply a sync index action for `key`.
    pub fn apply_index(&mut self, key: &str, action: IndexAction) {
        match action {
            IndexAction::Noop => {}
            IndexAction::Add => {
                let alias = sync_alias_key(key);
                // A force add: the alias namespace is owned by the index.
                let _ = self.add_alias(key, &alias, true);
            }
            IndexAction::Remove => {
                self.map.remove(&sync_alias_key(key));
            }
        }
    }

    /// Iterate entries whose key lies in `[lo, hi)`, resolving aliases.
    ///
    /// Dangling aliases (primary already unset) are skipped. The yielded
    /// key is the key as stored in the range, which for the sync index is
    /// the alias key.
    pub fn iter_range<'a>(
        &'a self,
        lo: &str,
        hi: &str,
    ) -> impl Iterator<Item = (&'a str, &'a KvRecord)> {
        self.map
            .range::<str, _>((Bound::Included(lo), Bound::Excluded(hi)))
            .filter_map(|(k, slot)| {
                let record = match slot {
                    Slot::Record(r) => Some(r),
                    Slot::Alias(target) => match self.map.get(target.as_str()) {
                        Some(Slot::Record(r)) => Some(r),
                        _ => None,
                    },
                }?;
                Some((k.as_str(), record))
            })
    }

    /// Iterate all primary records in key order, skipping aliases.
    pub fn iter_records(&self) -> impl Iterator<Item = (&str, &KvRecord)> {
        self.map.iter().filter_map(|(k, slot)| match slot {
            Slot::Record(r) => Some((k.as_str(), r)),
            Slot::Alias(_) => None,
        })
    }

    /// Compute store size statistics.
    #[must_use]
    pub fn stats(&self) -> DbStats {
        let mut stats = DbStats::default();
        for (key, slot) in &self.map {
            stats.meta_size +=
                (std::mem::size_of::<String>() + std::mem::size_of::<Slot>()) as u64;
            let Slot::Record(r) = slot else { continue };
            stats.nr_kv_pairs += 1;
            stats.key_size += key.len() as u64 + 1;
            let data = r.payload.data_len() as u64;
            stats.value_data_size += data;
            // 14 fixed header bytes: gennum + seqnum + flags.
            stats.value_size += data + 14 + r.header.owner.len() as u64 + 1;
        }
        stats
    }
}
