//! Main-store synchronization.
//!
//! Worker side: once a command finishes executing, every record flagged
//! SYNC is serialized into a memfd-backed export buffer (the `>` alias
//! range makes that a single ordered scan) and the buffer's FD is handed
//! to the worker proxy.
//!
//! Main side: the proxy replays the stream record by record. The
//! operator character in each key decides the merge: plain SET goes
//! through a predicate enforcing per-key sequence-number ordering and
//! ownership, `+`/`-` keys are folded through the delta engine (without
//! relation propagation — the worker already propagated), and unset
//! markers remove the record unless it belongs to another module.
//! A record the predicate rejects is logged and skipped; the rest of the
//! stream still merges.

use std::path::Path;

use sid_core::buffer::{read_size_prefixed, ExportBuffer};
use sid_core::delta::{delta_set, DeltaFlags};
use sid_core::error::KvError;
use sid_core::key::{key_part, ns_from_key, op_from_key, strip_op, KeyPart, KvNamespace, KvOp};
use sid_core::store::{overwrite_guard, KvStore};
use sid_core::value::{encode_record, KvRecord, RecordCursor, ValueFlags};
use tracing::{debug, warn};

use crate::cmd::{CmdFlags, UcmdCtx, UcmdError};
use crate::config::DEFAULT_DB_PATH;

/// Outcome counters of one import pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Records merged into the store.
    pub merged: u32,
    /// Records rejected by a predicate and skipped.
    pub skipped: u32,
}

/// Build the command's export buffer (and udev response lines) according
/// to its capability flags.
///
/// # Errors
///
/// Buffer I/O failures, or a vector value found in the UDEV namespace.
pub fn build_cmd_kv_buffers(ctx: &mut UcmdCtx) -> Result<(), UcmdError> {
    let flags = ctx.flags;
    let any_export = CmdFlags::EXPORT_UDEV_TO_RESBUF
        .union_with(CmdFlags::EXPORT_UDEV_TO_EXPBUF)
        .union_with(CmdFlags::EXPORT_SID_TO_RESBUF)
        .union_with(CmdFlags::EXPORT_SID_TO_EXPBUF);
    if !flags.intersects(any_export) {
        // Nothing to export for this command.
        return Ok(());
    }

    let mut exp_buf = if flags.contains(CmdFlags::EXPBUF_TO_FILE) {
        let path = ctx
            .exp_path
            .clone()
            .unwrap_or_else(|| Path::new(DEFAULT_DB_PATH).to_path_buf());
        ExportBuffer::file(&path)?
    } else {
        ExportBuffer::memfd("sid-cmd-export")?
    };

    let mut stream = Vec::new();
    let mut records = 0u32;
    {
        let kv = ctx
            .common
            .kv
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let entries: Vec<(&str, &KvRecord)> = if flags.contains(CmdFlags::EXPORT_SYNC) {
            kv.iter_range(">", "?").collect()
        } else {
            kv.iter_records().collect()
        };

        for (stored_key, record) in entries {
            // The sync index yields alias keys; exported keys are the
            // primaries.
            let key = stored_key.strip_prefix('>').unwrap_or(stored_key);

            if flags.contains(CmdFlags::EXPORT_PERSISTENT)
                && !record.header.flags.contains(ValueFlags::PERSISTENT)
            {
                continue;
            }

            if ns_from_key(key) == KvNamespace::Udev {
                if !flags.intersects(
                    CmdFlags::EXPORT_UDEV_TO_RESBUF.union_with(CmdFlags::EXPORT_UDEV_TO_EXPBUF),
                ) {
                    debug!(key, "not exporting record to udev");
                    continue;
                }
                let Some(data) = record.data() else {
                    return Err(UcmdError::InvalidInput(format!(
                        "vector value for key {key} in udev namespace"
                    )));
                };
                if flags.contains(CmdFlags::EXPORT_UDEV_TO_RESBUF) {
                    let core = key_part(key, KeyPart::Core).unwrap_or(key);
                    let value = data.strip_suffix(&[0]).unwrap_or(data);
                    ctx.res_buf.extend_from_slice(core.as_bytes());
                    ctx.res_buf.push(b'=');
                    ctx.res_buf.extend_from_slice(value);
                    ctx.res_buf.push(0);
                    debug!(key = core, "exported udev property");
                }
                if !flags.contains(CmdFlags::EXPORT_UDEV_TO_EXPBUF) {
                    continue;
                }
            } else if !flags.intersects(
                CmdFlags::EXPORT_SID_TO_RESBUF.union_with(CmdFlags::EXPORT_SID_TO_EXPBUF),
            ) {
                debug!(key, "not exporting record to main store");
                continue;
            }

            // The receiving store decides indexing for itself.
            let mut copy = record.clone();
            copy.header.flags.remove(ValueFlags::SYNC);
            encode_record(key, &copy, &mut stream);
            records += 1;
        }
    }

    exp_buf.write_all(&stream)?;
    exp_buf.finish()?;
    debug!(cmd = %ctx.id, records, bytes = exp_buf.payload_len(), "built export buffer");
    ctx.exp_buf = Some(exp_buf);
    Ok(())
}

/// Merge one serialized export stream into `kv`.
///
/// # Errors
///
/// A malformed stream or an illegal operator aborts the import; a
/// rejected record only skips that record.
pub fn import_export_stream(kv: &mut KvStore, payload: &[u8]) -> Result<ImportStats, UcmdError> {
    let mut stats = ImportStats::default();
    let mut cursor = RecordCursor::new(payload);

    while let Some((key, record)) = cursor.next_record()? {
        let op = op_from_key(&key);
        if op == KvOp::Illegal {
            return Err(KvError::IllegalOp { key }.into());
        }
        let target = strip_op(&key).to_string();

        debug!(
            key = %target,
            seqnum = record.header.seqnum,
            owner = %record.header.owner,
            unset = record.is_unset_marker(),
            "syncing main key-value store"
        );

        if record.is_unset_marker() {
            let incoming_owner = record.header.owner.clone();
            let result = kv.unset_with(&target, |old| {
                if old.header.flags.is_mod_owned() && old.header.owner != incoming_owner {
                    return Err(KvError::FlagConflictReserved {
                        key: target.clone(),
                        owner: old.header.owner.clone(),
                    });
                }
                Ok(())
            });
            match result {
                Ok(()) => stats.merged += 1,
                Err(KvError::NotFound { .. }) => {}
                Err(err) => {
                    warn!(key = %target, %err, "refusing unset of foreign record");
                    stats.skipped += 1;
                }
            }
            continue;
        }

        if op == KvOp::Set {
            let result = kv.set_with(&target, record, |old, new| match old {
                None => {
                    let action = sid_core::store::index_action(old, Some(&new));
                    Ok((new, action))
                }
                Some(old_rec) => {
                    if new.header.seqnum < old_rec.header.seqnum {
                        return Err(KvError::StaleSeqnum {
                            key: target.clone(),
                            new_seqnum: new.header.seqnum,
                            old_seqnum: old_rec.header.seqnum,
                        });
                    }
                    let action = overwrite_guard(&target, old, &new)?;
                    Ok((new, action))
                }
            });
            match result {
                Ok(_) => stats.merged += 1,
                Err(err) => {
                    debug!(key = %target, %err, "keeping stored value");
                    stats.skipped += 1;
                }
            }
            continue;
        }

        // PLUS/MINUS: fold into the stored vector. The worker already
        // propagated relation updates, so the replay is diff-free.
        let Some(items) = record.items().map(<[_]>::to_vec) else {
            warn!(key = %target, "delta operator on a blob record, skipping");
            stats.skipped += 1;
            continue;
        };
        match delta_set(
            kv,
            &target,
            &record.header,
            items,
            op,
            DeltaFlags::NONE,
            None,
            false,
        ) {
            Ok(_) => stats.merged += 1,
            Err(err) => {
                warn!(key = %target, %err, "delta merge failed, skipping record");
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

/// Reload a persistent snapshot file into the store, reusing the sync
/// merge path.
///
/// # Errors
///
/// File I/O or stream decoding failures.
pub fn load_snapshot(kv: &mut KvStore, path: &Path) -> Result<ImportStats, UcmdError> {
    let mut file = std::fs::File::open(path)?;
    let payload = read_size_prefixed(&mut file)?;
    import_export_stream(kv, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sid_core::value::{ValueHeader, ValuePayload};

    fn rec(owner: &str, seqnum: u64, flags: ValueFlags, data: &[u8]) -> KvRecord {
        KvRecord::blob(ValueHeader::new(1, seqnum, flags, owner), data.to_vec())
    }

    fn stream_of(records: &[(&str, &KvRecord)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, record) in records {
            encode_record(key, record, &mut out);
        }
        out
    }

    #[test]
    fn fresh_record_is_merged() {
        let mut kv = KvStore::new();
        let record = rec("mod_a", 42, ValueFlags::NONE, b"v");
        let stats =
            import_export_stream(&mut kv, &stream_of(&[("::D:8_0:::k", &record)])).unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(kv.get("::D:8_0:::k").unwrap().data().unwrap(), b"v");
    }

    #[test]
    fn stale_seqnum_is_discarded() {
        let mut kv = KvStore::new();
        kv.set("::D:8_0:::k", rec("mod_x", 100, ValueFlags::NONE, b"new"));

        let stale = rec("mod_x", 99, ValueFlags::NONE, b"old");
        let stats =
            import_export_stream(&mut kv, &stream_of(&[("::D:8_0:::k", &stale)])).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(kv.get("::D:8_0:::k").unwrap().data().unwrap(), b"new");
        assert_eq!(kv.get("::D:8_0:::k").unwrap().header.seqnum, 100);
    }

    #[test]
    fn equal_seqnum_overwrites() {
        let mut kv = KvStore::new();
        kv.set("k", rec("mod_x", 100, ValueFlags::NONE, b"old"));
        let update = rec("mod_x", 100, ValueFlags::NONE, b"new");
        let stats = import_export_stream(&mut kv, &stream_of(&[("k", &update)])).unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(kv.get("k").unwrap().data().unwrap(), b"new");
    }

    #[test]
    fn foreign_owner_unset_is_refused() {
        let mut kv = KvStore::new();
        kv.set("k", rec("mod_a", 10, ValueFlags::MOD_PRIVATE, b"kept"));

        let marker = rec("mod_b", 20, ValueFlags::NONE, b"");
        assert!(marker.is_unset_marker());
        let stats = import_export_stream(&mut kv, &stream_of(&[("k", &marker)])).unwrap();
        assert_eq!(stats.skipped, 1);
        assert!(kv.get("k").is_some());
    }

    #[test]
    fn own_unset_removes_record() {
        let mut kv = KvStore::new();
        kv.set("k", rec("mod_a", 10, ValueFlags::MOD_PRIVATE, b"gone"));

        let marker = rec("mod_a", 20, ValueFlags::NONE, b"");
        let stats = import_export_stream(&mut kv, &stream_of(&[("k", &marker)])).unwrap();
        assert_eq!(stats.merged, 1);
        assert!(kv.get("k").is_none());
    }

    #[test]
    fn delta_records_fold_into_stored_vector() {
        let mut kv = KvStore::new();
        let base = KvRecord::vector(
            ValueHeader::new(1, 10, ValueFlags::NONE, "#core"),
            vec![b"a".to_vec(), b"b".to_vec()],
        );
        kv.set(":LYR:D:8_0:::#GMB", base);

        let plus = KvRecord::vector(
            ValueHeader::new(1, 11, ValueFlags::NONE, "#core"),
            vec![b"c".to_vec()],
        );
        let minus = KvRecord::vector(
            ValueHeader::new(1, 11, ValueFlags::NONE, "#core"),
            vec![b"a".to_vec()],
        );
        let stream = stream_of(&[
            ("+:LYR:D:8_0:::#GMB", &plus),
            ("-:LYR:D:8_0:::#GMB", &minus),
        ]);

        let stats = import_export_stream(&mut kv, &stream).unwrap();
        assert_eq!(stats.merged, 2);
        let stored = kv.get(":LYR:D:8_0:::#GMB").unwrap();
        assert_eq!(stored.items().unwrap(), &[b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn empty_plus_record_is_not_an_unset() {
        // A header-only vector under a '+' key would read as an unset
        // marker; reserved flagging keeps it alive, matching the flags
        // absolute-delta records carry.
        let marker = KvRecord {
            header: ValueHeader::new(1, 5, ValueFlags::CORE_DEFAULTS, "#core"),
            payload: ValuePayload::Vector(Vec::new()),
        };
        assert!(!marker.is_unset_marker());
    }

    #[test]
    fn roundtrip_between_stores() {
        // Source store with SYNC-indexed records.
        let mut src = KvStore::new();
        for (key, record) in [
            ("::D:8_0:::#RDY", rec("#core", 42, ValueFlags::SYNC, b"\x01")),
            ("::U:8_0:::ACTION", rec("#core", 42, ValueFlags::SYNC, b"add\0")),
        ] {
            src.set(key, record);
            src.apply_index(key, sid_core::store::IndexAction::Add);
        }

        let mut stream = Vec::new();
        for (alias_key, record) in src.iter_range(">", "?") {
            let key = alias_key.strip_prefix('>').unwrap();
            let mut copy = record.clone();
            copy.header.flags.remove(ValueFlags::SYNC);
            encode_record(key, &copy, &mut stream);
        }

        let mut dst = KvStore::new();
        let stats = import_export_stream(&mut dst, &stream).unwrap();
        assert_eq!(stats.merged, 2);
        assert_eq!(dst.get("::D:8_0:::#RDY").unwrap().data().unwrap(), b"\x01");
        assert_eq!(dst.get("::U:8_0:::ACTION").unwrap().data().unwrap(), b"add\0");
    }
}
