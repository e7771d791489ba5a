//! Per-process common context.
//!
//! Created once per process: at daemon startup in the main process, and
//! once in every worker when it opens its snapshot of the store. Holds
//! the KV store handle, the generation number stamped onto every record
//! this process writes, the system boot ID, and the module registries.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sid_core::key::{KeySpec, KvNamespace, KvOp, ID_NULL};
use sid_core::store::KvStore;
use sid_core::value::{KvRecord, ValueFlags, ValueHeader};
use tracing::debug;

use crate::module::{ModuleRegistry, OWNER_CORE};

/// Global key suffix of the DB generation record.
pub const KEY_DB_GENERATION: &str = "#DBGEN";

/// Global key suffix of the boot ID record.
pub const KEY_BOOT_ID: &str = "#BOOTID";

/// Device key suffix of the ready-state record.
pub const KEY_DEV_READY: &str = "#RDY";

/// Device key suffix of the reserved-state record.
pub const KEY_DEV_RESERVED: &str = "#RES";

/// Device key suffix of the resolved type module name.
pub const KEY_DEV_MOD: &str = "#MOD";

/// Key suffix of a group-members vector.
pub const KEY_GROUP_MEMBERS: &str = "#GMB";

/// Key suffix of a groups-containing-this-device vector.
pub const KEY_GROUP_IN: &str = "#GIN";

/// udev property naming the worker session that processed the device.
pub const UDEV_KEY_SESSION_ID: &str = "SID_SESSION_ID";

/// Device record nominating the next-layer type module.
pub const KEY_DEVICE_NEXT_MOD: &str = "SID_NEXT_MOD";

/// Compose a GLOBAL-namespace key with the given core suffix.
#[must_use]
pub fn global_key(core: &str) -> String {
    KeySpec {
        op: KvOp::Set,
        dom: ID_NULL.into(),
        ns: KvNamespace::Global,
        ns_part: ID_NULL.into(),
        id: ID_NULL.into(),
        id_part: ID_NULL.into(),
        core: core.into(),
    }
    .compose()
}

/// Per-process singleton shared by every command context.
#[derive(Debug, Clone)]
pub struct CommonCtx {
    /// The KV store: the main store in the daemon, a private snapshot in
    /// a worker.
    pub kv: Arc<Mutex<KvStore>>,
    /// Generation number stamped onto records written by this process.
    pub gennum: u16,
    /// Current system boot ID.
    pub boot_id: String,
    /// Module registries.
    pub modules: Arc<ModuleRegistry>,
    /// Root of the sysfs mount.
    pub sysfs_root: PathBuf,
    /// Root of the procfs mount.
    pub proc_root: PathBuf,
}

impl CommonCtx {
    /// Open a context over a fresh store, reading the boot ID from
    /// procfs.
    ///
    /// # Errors
    ///
    /// Returns the boot ID read failure.
    pub fn open(
        modules: ModuleRegistry,
        sysfs_root: PathBuf,
        proc_root: PathBuf,
    ) -> std::io::Result<Self> {
        let boot_id = read_boot_id(&proc_root)?;
        Ok(Self::with_boot_id(modules, sysfs_root, proc_root, boot_id))
    }

    /// Open a context with an explicit boot ID over a fresh store.
    #[must_use]
    pub fn with_boot_id(
        modules: ModuleRegistry,
        sysfs_root: PathBuf,
        proc_root: PathBuf,
        boot_id: String,
    ) -> Self {
        Self::with_store(modules, sysfs_root, proc_root, boot_id, KvStore::new())
    }

    /// Open a context over an existing store, bumping its generation
    /// counter. Workers use this with their seeded snapshot of the main
    /// store.
    #[must_use]
    pub fn with_store(
        modules: ModuleRegistry,
        sysfs_root: PathBuf,
        proc_root: PathBuf,
        boot_id: String,
        mut kv: KvStore,
    ) -> Self {
        let gennum = bump_generation(&mut kv);
        set_boot_id_record(&mut kv, gennum, &boot_id);
        Self {
            kv: Arc::new(Mutex::new(kv)),
            gennum,
            boot_id,
            modules: Arc::new(modules),
            sysfs_root,
            proc_root,
        }
    }

    /// Flags the core uses for records that must not be synchronized.
    #[must_use]
    pub fn core_flags_no_sync() -> ValueFlags {
        ValueFlags::CORE_DEFAULTS.without(ValueFlags::SYNC)
    }

    /// A record header stamped with this process's generation number.
    #[must_use]
    pub fn core_header(&self, seqnum: u64, flags: ValueFlags) -> ValueHeader {
        ValueHeader::new(self.gennum, seqnum, flags, OWNER_CORE)
    }
}

/// Read the kernel boot ID.
fn read_boot_id(proc_root: &Path) -> std::io::Result<String> {
    let path = proc_root.join("sys/kernel/random/boot_id");
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// Increment and persist the store generation counter.
///
/// The counter ages records across restarts: every record carries the
/// generation it was written under.
fn bump_generation(kv: &mut KvStore) -> u16 {
    let key = global_key(KEY_DB_GENERATION);
    let gennum = match kv.get(&key).and_then(KvRecord::data) {
        Some(data) if data.len() >= 2 => {
            u16::from_le_bytes([data[0], data[1]]).wrapping_add(1)
        }
        _ => 1,
    };
    debug!(gennum, "current KV store generation number");

    let header = ValueHeader::new(
        gennum,
        0,
        ValueFlags::CORE_DEFAULTS.without(ValueFlags::SYNC),
        OWNER_CORE,
    );
    kv.set(&key, KvRecord::blob(header, gennum.to_le_bytes().to_vec()));
    gennum
}

/// Persist the current boot ID, logging a change against the previous
/// one.
fn set_boot_id_record(kv: &mut KvStore, gennum: u16, boot_id: &str) {
    let key = global_key(KEY_BOOT_ID);
    if let Some(old) = kv.get(&key).and_then(KvRecord::data) {
        debug!(previous = %String::from_utf8_lossy(old), "previous system boot id");
    }
    debug!(current = boot_id, "current system boot id");

    let header = ValueHeader::new(
        gennum,
        0,
        ValueFlags::CORE_DEFAULTS.without(ValueFlags::SYNC),
        OWNER_CORE,
    );
    kv.set(&key, KvRecord::blob(header, boot_id.as_bytes().to_vec()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CommonCtx {
        CommonCtx::with_boot_id(
            ModuleRegistry::new(),
            "/sys".into(),
            "/proc".into(),
            "abcd-1234".into(),
        )
    }

    #[test]
    fn generation_starts_at_one() {
        let ctx = ctx();
        assert_eq!(ctx.gennum, 1);
        let kv = ctx.kv.lock().unwrap();
        let rec = kv.get(&global_key(KEY_DB_GENERATION)).unwrap();
        assert_eq!(rec.data().unwrap(), &1u16.to_le_bytes());
        assert_eq!(rec.header.owner, OWNER_CORE);
    }

    #[test]
    fn boot_id_record_exists_once() {
        let ctx = ctx();
        let kv = ctx.kv.lock().unwrap();
        let rec = kv.get(&global_key(KEY_BOOT_ID)).unwrap();
        assert_eq!(rec.data().unwrap(), b"abcd-1234");
    }

    #[test]
    fn generation_increments_on_reopen() {
        let mut kv = KvStore::new();
        assert_eq!(bump_generation(&mut kv), 1);
        assert_eq!(bump_generation(&mut kv), 2);
        assert_eq!(bump_generation(&mut kv), 3);
    }
}
