//! Module-facing KV API.
//!
//! Everything a module may do to the store during a scan goes through
//! these methods: namespaced get/set, key reservation, device ready and
//! reserved state, group membership, and the partition-to-disk lookup.
//! The phase capability mask is enforced here, so a module cannot set
//! ready state outside `SCAN_PRE`/`SCAN_CURRENT` or reserved state
//! outside `SCAN_NEXT` no matter what it tries.

use std::sync::{MutexGuard, PoisonError};

use sid_core::delta::{delta_set, DeltaFlags, RelKeys};
use sid_core::error::KvError;
use sid_core::key::{KeySpec, KvNamespace, KvOp, DOM_USER, ID_NULL, SYS_KEY_PREFIX};
use sid_core::store::{overwrite_guard, IndexAction, KvStore};
use sid_core::value::{KvRecord, ValueFlags, ValueHeader};
use tracing::debug;

use super::{UcmdCtx, UcmdError};
use crate::context::{CommonCtx, KEY_DEV_READY, KEY_DEV_RESERVED, KEY_GROUP_IN, KEY_GROUP_MEMBERS};
use crate::module::OWNER_CORE;

/// Device readiness, as negotiated by modules during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DevReady {
    /// Not a valid stored state.
    Undefined = 0,
    /// Not yet processed.
    #[default]
    Unprocessed = 1,
    /// Not ready and unable to perform I/O.
    Inaccessible = 2,
    /// Not ready but able to perform I/O.
    Accessible = 3,
    /// Ready, for private use of the owning subsystem.
    Private = 4,
    /// Ready and publicly usable.
    Public = 5,
    /// Ready but temporarily unavailable.
    Unavailable = 6,
}

impl DevReady {
    /// Decode a stored byte.
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Unprocessed,
            2 => Self::Inaccessible,
            3 => Self::Accessible,
            4 => Self::Private,
            5 => Self::Public,
            6 => Self::Unavailable,
            _ => Self::Undefined,
        }
    }
}

/// Device reservation, as negotiated by the layer above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DevReserved {
    /// Not a valid stored state.
    Undefined = 0,
    /// Not yet processed.
    #[default]
    Unprocessed = 1,
    /// Free for a layer above to claim.
    Free = 2,
    /// Reserved by a layer above.
    Reserved = 3,
}

impl DevReserved {
    /// Decode a stored byte.
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Unprocessed,
            2 => Self::Free,
            3 => Self::Reserved,
            _ => Self::Undefined,
        }
    }
}

fn lock(kv: &std::sync::Mutex<KvStore>) -> MutexGuard<'_, KvStore> {
    kv.lock().unwrap_or_else(PoisonError::into_inner)
}

fn validate_user_key(key: &str) -> Result<(), UcmdError> {
    if key.is_empty() || key.starts_with(SYS_KEY_PREFIX) {
        return Err(UcmdError::InvalidInput(format!(
            "invalid user key {key:?}"
        )));
    }
    Ok(())
}

impl UcmdCtx {
    /// The namespace scope part for an owner writing into `ns`.
    #[must_use]
    pub fn ns_part_for(&self, owner: &str, ns: KvNamespace) -> String {
        match ns {
            KvNamespace::Udev | KvNamespace::Device => self.dev.id.clone(),
            KvNamespace::Module => owner.to_string(),
            KvNamespace::Global | KvNamespace::Undefined => ID_NULL.to_string(),
        }
    }

    fn key_spec(&self, owner: &str, dom: Option<&str>, ns: KvNamespace, core: &str) -> KeySpec {
        KeySpec {
            op: KvOp::Set,
            dom: dom.unwrap_or(ID_NULL).to_string(),
            ns,
            ns_part: self.ns_part_for(owner, ns),
            id: ID_NULL.into(),
            id_part: ID_NULL.into(),
            core: core.into(),
        }
    }

    /// A key reserved across all devices must not be taken over by a
    /// different owner through a device-scoped write. The reservation
    /// record lives under the namespace with an empty scope part.
    fn passes_global_reservation_check(
        &self,
        owner: &str,
        ns: KvNamespace,
        key_core: &str,
    ) -> Result<(), UcmdError> {
        if !matches!(ns, KvNamespace::Udev | KvNamespace::Device) {
            return Ok(());
        }
        let key = KeySpec {
            op: KvOp::Set,
            dom: ID_NULL.into(),
            ns,
            ns_part: ID_NULL.into(),
            id: ID_NULL.into(),
            id_part: ID_NULL.into(),
            core: key_core.into(),
        }
        .compose();

        let kv = lock(&self.common.kv);
        if let Some(found) = kv.get(&key) {
            let reserved = found.header.flags.contains(ValueFlags::MOD_RESERVED);
            if reserved && found.header.owner != owner {
                debug!(
                    owner,
                    key = %key,
                    reserved_by = %found.header.owner,
                    "write refused by global reservation"
                );
                return Err(KvError::FlagConflictReserved {
                    key,
                    owner: found.header.owner.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Internal set: compose the key, run the reservation and overwrite
    /// checks, store, and maintain the sync index.
    ///
    /// Passing `None` as `value` stores an unset marker, which removes
    /// the record at the receiving store on synchronization.
    pub(crate) fn do_set_kv(
        &mut self,
        owner: &str,
        dom: Option<&str>,
        ns: KvNamespace,
        key_core: &str,
        mut flags: ValueFlags,
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, UcmdError> {
        // Imports from the udev environment are core writes into the UDEV
        // namespace and cannot collide with a module reservation.
        if !(ns == KvNamespace::Udev && owner == OWNER_CORE) {
            self.passes_global_reservation_check(owner, ns, key_core)?;
        }
        if ns == KvNamespace::Udev {
            flags |= ValueFlags::SYNC | ValueFlags::PERSISTENT;
        }

        let key = self.key_spec(owner, dom, ns, key_core).compose();
        let header = ValueHeader::new(self.common.gennum, self.dev.udev.seqnum, flags, owner);
        let record = KvRecord::blob(header, value.unwrap_or(&[]).to_vec());

        let mut kv = lock(&self.common.kv);
        let action = kv.set_with(&key, record, |old, new| {
            overwrite_guard(&key, old, &new).map(|a| (new, a))
        })?;
        kv.apply_index(&key, action);
        Ok(kv.get(&key).and_then(|r| r.data().map(<[u8]>::to_vec)))
    }

    /// Internal get, honoring record privacy.
    pub(crate) fn do_get_kv(
        &self,
        owner: &str,
        dom: Option<&str>,
        ns: KvNamespace,
        key_core: &str,
    ) -> Option<(Vec<u8>, ValueFlags)> {
        let key = self.key_spec(owner, dom, ns, key_core).compose();
        let kv = lock(&self.common.kv);
        let record = kv.get(&key)?;
        if record.header.flags.contains(ValueFlags::MOD_PRIVATE) && record.header.owner != owner {
            return None;
        }
        let data = record.data()?.to_vec();
        Some((data, record.header.flags))
    }

    /// Store a module record under the user domain.
    ///
    /// UDEV-namespace writes are forced SYNC and PERSISTENT so they reach
    /// udev again. System keys (leading `#`) are refused.
    ///
    /// # Errors
    ///
    /// Invalid key or namespace, reservation conflict, or overwrite veto.
    pub fn set_kv(
        &mut self,
        owner: &str,
        ns: KvNamespace,
        key: &str,
        flags: ValueFlags,
        value: &[u8],
    ) -> Result<Option<Vec<u8>>, UcmdError> {
        validate_user_key(key)?;
        if ns == KvNamespace::Undefined {
            return Err(UcmdError::InvalidInput("undefined namespace".into()));
        }
        self.do_set_kv(owner, Some(DOM_USER), ns, key, flags, Some(value))
    }

    /// Read a module record from the user domain.
    #[must_use]
    pub fn get_kv(&self, owner: &str, ns: KvNamespace, key: &str) -> Option<(Vec<u8>, ValueFlags)> {
        if key.is_empty() || key.starts_with(SYS_KEY_PREFIX) || ns == KvNamespace::Undefined {
            return None;
        }
        self.do_get_kv(owner, Some(DOM_USER), ns, key)
    }

    /// Read a record of the whole disk this partition sits on.
    ///
    /// # Errors
    ///
    /// Invalid key, or the sysfs lookup of the parent disk failed.
    pub fn part_get_disk_kv(
        &self,
        owner: &str,
        key: &str,
    ) -> Result<Option<(Vec<u8>, ValueFlags)>, UcmdError> {
        validate_user_key(key)?;
        let devno = crate::sysfs::partition_parent_devno(&self.common.sysfs_root, &self.dev.udev.path)?;
        let disk_id = crate::device::canonicalize_kv_key(&devno);

        let spec = KeySpec {
            op: KvOp::Set,
            dom: DOM_USER.into(),
            ns: KvNamespace::Device,
            ns_part: disk_id,
            id: ID_NULL.into(),
            id_part: ID_NULL.into(),
            core: key.into(),
        };
        let composed = spec.compose();
        let kv = lock(&self.common.kv);
        let Some(record) = kv.get(&composed) else {
            return Ok(None);
        };
        if record.header.flags.contains(ValueFlags::MOD_PRIVATE) && record.header.owner != owner {
            return Ok(None);
        }
        Ok(record.data().map(|d| (d.to_vec(), record.header.flags)))
    }

    /// Set the device ready state. Permitted only in phases carrying the
    /// ready capability.
    ///
    /// # Errors
    ///
    /// [`UcmdError::PhaseForbidden`] outside `SCAN_PRE`/`SCAN_CURRENT`,
    /// or invalid target states.
    pub fn dev_set_ready(&mut self, _owner: &str, ready: DevReady) -> Result<(), UcmdError> {
        if !self.phase.caps().ready {
            return Err(UcmdError::PhaseForbidden { phase: self.phase });
        }
        if matches!(ready, DevReady::Undefined | DevReady::Unprocessed) {
            return Err(UcmdError::InvalidInput(format!(
                "cannot set ready state to {ready:?}"
            )));
        }
        self.do_set_kv(
            OWNER_CORE,
            None,
            KvNamespace::Device,
            KEY_DEV_READY,
            ValueFlags::CORE_DEFAULTS,
            Some(&[ready as u8]),
        )?;
        Ok(())
    }

    /// Read the device ready state.
    #[must_use]
    pub fn dev_get_ready(&self) -> DevReady {
        self.do_get_kv(OWNER_CORE, None, KvNamespace::Device, KEY_DEV_READY)
            .and_then(|(data, _)| data.first().copied())
            .map_or(DevReady::Unprocessed, DevReady::from_u8)
    }

    /// Set the device reserved state. Permitted only in `SCAN_NEXT`.
    ///
    /// # Errors
    ///
    /// [`UcmdError::PhaseForbidden`] outside `SCAN_NEXT`, or an invalid
    /// target state.
    pub fn dev_set_reserved(&mut self, _owner: &str, reserved: DevReserved) -> Result<(), UcmdError> {
        if !self.phase.caps().reserved {
            return Err(UcmdError::PhaseForbidden { phase: self.phase });
        }
        if reserved == DevReserved::Undefined {
            return Err(UcmdError::InvalidInput(
                "cannot set reserved state to undefined".into(),
            ));
        }
        self.do_set_kv(
            OWNER_CORE,
            None,
            KvNamespace::Device,
            KEY_DEV_RESERVED,
            ValueFlags::CORE_DEFAULTS,
            Some(&[reserved as u8]),
        )?;
        Ok(())
    }

    /// Read the device reserved state.
    #[must_use]
    pub fn dev_get_reserved(&self) -> DevReserved {
        self.do_get_kv(OWNER_CORE, None, KvNamespace::Device, KEY_DEV_RESERVED)
            .and_then(|(data, _)| data.first().copied())
            .map_or(DevReserved::Unprocessed, DevReserved::from_u8)
    }

    /// Create an (empty) device group.
    ///
    /// # Errors
    ///
    /// Invalid input, or the group key already belongs to someone.
    pub fn group_create(
        &mut self,
        _owner: &str,
        group_ns: KvNamespace,
        group_id: &str,
        _group_flags: ValueFlags,
    ) -> Result<(), UcmdError> {
        if group_ns == KvNamespace::Undefined || group_id.is_empty() {
            return Err(UcmdError::InvalidInput("invalid group namespace or id".into()));
        }
        let key = KeySpec {
            op: KvOp::Set,
            dom: ID_NULL.into(),
            ns: group_ns,
            ns_part: self.ns_part_for(_owner, group_ns),
            id: group_id.into(),
            id_part: ID_NULL.into(),
            core: KEY_GROUP_MEMBERS.into(),
        }
        .compose();

        let header = ValueHeader::new(
            self.common.gennum,
            self.dev.udev.seqnum,
            ValueFlags::CORE_DEFAULTS,
            OWNER_CORE,
        );
        let record = KvRecord::vector(header, Vec::new());

        let mut kv = lock(&self.common.kv);
        let action = kv.set_with(&key, record, |old, new| {
            // Create only; an existing group stays untouched.
            if old.is_some() {
                return Err(KvError::Rejected { key: key.clone() });
            }
            let action = sid_core::store::index_action(old, Some(&new));
            Ok((new, action))
        })?;
        kv.apply_index(&key, action);
        Ok(())
    }

    fn group_rel_keys(&self, owner: &str, group_ns: KvNamespace, group_id: &str) -> RelKeys {
        RelKeys {
            cur: KeySpec {
                op: KvOp::Set,
                dom: DOM_USER.into(),
                ns: group_ns,
                ns_part: self.ns_part_for(owner, group_ns),
                id: group_id.into(),
                id_part: ID_NULL.into(),
                core: KEY_GROUP_MEMBERS.into(),
            },
            rel: KeySpec {
                op: KvOp::Set,
                dom: ID_NULL.into(),
                ns: KvNamespace::Device,
                ns_part: self.dev.id.clone(),
                id: ID_NULL.into(),
                id_part: ID_NULL.into(),
                core: KEY_GROUP_IN.into(),
            },
        }
    }

    fn handle_current_dev_for_group(
        &mut self,
        owner: &str,
        group_ns: KvNamespace,
        group_id: &str,
        op: KvOp,
    ) -> Result<(), UcmdError> {
        if group_ns == KvNamespace::Undefined || group_id.is_empty() {
            return Err(UcmdError::InvalidInput("invalid group namespace or id".into()));
        }
        let keys = self.group_rel_keys(owner, group_ns, group_id);
        let key = keys.cur.compose();
        let member = keys.rel.compose_prefix().into_bytes();
        let header = self
            .common
            .core_header(self.dev.udev.seqnum, CommonCtx::core_flags_no_sync());

        let mut kv = lock(&self.common.kv);
        delta_set(
            &mut kv,
            &key,
            &header,
            vec![member],
            op,
            DeltaFlags::DIFF_AND_REL,
            Some(&keys),
            true,
        )?;
        Ok(())
    }

    /// Add the device being processed to a group, updating the inverse
    /// membership record as well.
    ///
    /// # Errors
    ///
    /// Invalid input or a store failure.
    pub fn group_add_current_dev(
        &mut self,
        owner: &str,
        group_ns: KvNamespace,
        group_id: &str,
    ) -> Result<(), UcmdError> {
        self.handle_current_dev_for_group(owner, group_ns, group_id, KvOp::Plus)
    }

    /// Remove the device being processed from a group.
    ///
    /// # Errors
    ///
    /// Invalid input or a store failure.
    pub fn group_remove_current_dev(
        &mut self,
        owner: &str,
        group_ns: KvNamespace,
        group_id: &str,
    ) -> Result<(), UcmdError> {
        self.handle_current_dev_for_group(owner, group_ns, group_id, KvOp::Minus)
    }

    /// Destroy a group. A non-empty group is refused unless `force` is
    /// set; forcing also removes the group from every member's inverse
    /// record.
    ///
    /// # Errors
    ///
    /// [`KvError::NotEmpty`] (wrapped) without `force`, invalid input, or
    /// a store failure.
    pub fn group_destroy(
        &mut self,
        owner: &str,
        group_ns: KvNamespace,
        group_id: &str,
        force: bool,
    ) -> Result<(), UcmdError> {
        if group_ns == KvNamespace::Undefined || group_id.is_empty() {
            return Err(UcmdError::InvalidInput("invalid group namespace or id".into()));
        }
        let keys = self.group_rel_keys(owner, group_ns, group_id);
        let key = keys.cur.compose();

        {
            let kv = lock(&self.common.kv);
            let record = kv.get(&key).ok_or_else(|| KvError::NotFound { key: key.clone() })?;
            let members = record.items().map(<[_]>::len).unwrap_or(0);
            if members > 0 && !force {
                return Err(KvError::NotEmpty { key: key.clone() }.into());
            }
        }

        let header = ValueHeader::new(
            self.common.gennum,
            self.dev.udev.seqnum,
            ValueFlags::CORE_DEFAULTS.without(ValueFlags::MOD_RESERVED),
            OWNER_CORE,
        );
        let mut kv = lock(&self.common.kv);
        delta_set(
            &mut kv,
            &key,
            &header,
            Vec::new(),
            KvOp::Set,
            DeltaFlags::DIFF_AND_REL,
            Some(&keys),
            true,
        )?;
        Ok(())
    }
}

/// Reserve a key in `ns` across all devices for `owner`.
///
/// In a worker the reservation is flagged SYNC so it propagates to the
/// main store; in the main process it takes effect directly.
///
/// # Errors
///
/// Invalid key, or the key is already reserved by another module.
pub fn mod_reserve_kv(
    common: &CommonCtx,
    owner: &str,
    ns: KvNamespace,
    key_core: &str,
    in_worker: bool,
) -> Result<(), UcmdError> {
    validate_user_key(key_core)?;
    let key = reservation_key(ns, key_core);

    let mut flags = ValueFlags::MOD_RESERVED;
    if in_worker {
        flags |= ValueFlags::SYNC | ValueFlags::PERSISTENT;
    }
    let header = ValueHeader::new(common.gennum, 0, flags, owner);
    let record = KvRecord::vector(header, Vec::new());

    let mut kv = lock(&common.kv);
    let action = kv.set_with(&key, record, |old, new| {
        if let Some(old) = old {
            if old.header.owner != new.header.owner {
                return Err(KvError::FlagConflictReserved {
                    key: key.clone(),
                    owner: old.header.owner.clone(),
                });
            }
        }
        let action = sid_core::store::index_action(old, Some(&new));
        Ok((new, action))
    })?;
    kv.apply_index(&key, action);
    Ok(())
}

/// Drop a key reservation held by `owner`.
///
/// In a worker this stores an unset marker that removes the reservation
/// at the main store on synchronization.
///
/// # Errors
///
/// Invalid key, or the reservation belongs to another module.
pub fn mod_unreserve_kv(
    common: &CommonCtx,
    owner: &str,
    ns: KvNamespace,
    key_core: &str,
    in_worker: bool,
) -> Result<(), UcmdError> {
    validate_user_key(key_core)?;
    let key = reservation_key(ns, key_core);
    let mut kv = lock(&common.kv);

    if in_worker {
        // Header-only, non-reserved record: an unset marker for the sync
        // import on the main side.
        let header = ValueHeader::new(
            common.gennum,
            0,
            ValueFlags::SYNC | ValueFlags::PERSISTENT,
            owner,
        );
        let owner_owned = owner.to_string();
        let action = kv.set_with(&key, KvRecord::vector(header, Vec::new()), |old, new| {
            if let Some(old) = old {
                if old.header.owner != owner_owned {
                    return Err(KvError::FlagConflictReserved {
                        key: key.clone(),
                        owner: old.header.owner.clone(),
                    });
                }
            }
            let action = sid_core::store::index_action(old, Some(&new));
            Ok((new, action))
        })?;
        kv.apply_index(&key, action);
    } else {
        kv.unset_with(&key, |old| {
            if old.header.owner != owner {
                return Err(KvError::FlagConflictReserved {
                    key: key.clone(),
                    owner: old.header.owner.clone(),
                });
            }
            Ok(())
        })?;
        kv.apply_index(&key, IndexAction::Remove);
    }
    Ok(())
}

fn reservation_key(ns: KvNamespace, key_core: &str) -> String {
    KeySpec {
        op: KvOp::Set,
        dom: ID_NULL.into(),
        ns,
        ns_part: ID_NULL.into(),
        id: ID_NULL.into(),
        id_part: ID_NULL.into(),
        core: key_core.into(),
    }
    .compose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CommonCtx;
    use crate::device::build_udev_env;
    use crate::module::ModuleRegistry;
    use crate::protocol::{MsgCategory, MsgHeader, SidCmd};
    use crate::scan::ScanPhase;

    fn ctx() -> UcmdCtx {
        let common = CommonCtx::with_boot_id(
            ModuleRegistry::new(),
            "/sys".into(),
            "/proc".into(),
            "boot".into(),
        );
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
            common,
            "w1",
        )
        .unwrap()
    }

    #[test]
    fn private_record_invisible_to_other_modules() {
        let mut ctx = ctx();
        ctx.set_kv(
            "mod_a",
            KvNamespace::Device,
            "usr_key",
            ValueFlags::MOD_PRIVATE,
            b"secret",
        )
        .unwrap();

        assert!(ctx.get_kv("mod_a", KvNamespace::Device, "usr_key").is_some());
        assert!(ctx.get_kv("mod_b", KvNamespace::Device, "usr_key").is_none());
    }

    #[test]
    fn private_record_write_vetoed_for_other_modules() {
        let mut ctx = ctx();
        ctx.set_kv(
            "mod_a",
            KvNamespace::Device,
            "usr_key",
            ValueFlags::MOD_PRIVATE,
            b"v1",
        )
        .unwrap();

        let err = ctx
            .set_kv("mod_b", KvNamespace::Device, "usr_key", ValueFlags::NONE, b"v2")
            .unwrap_err();
        assert!(matches!(
            err,
            UcmdError::Kv(KvError::FlagConflictPrivate { .. })
        ));
        // Value is unchanged.
        let (data, _) = ctx.get_kv("mod_a", KvNamespace::Device, "usr_key").unwrap();
        assert_eq!(data, b"v1");
    }

    #[test]
    fn system_keys_are_refused() {
        let mut ctx = ctx();
        assert!(ctx
            .set_kv("mod_a", KvNamespace::Device, "#RDY", ValueFlags::NONE, b"x")
            .is_err());
        assert!(ctx.get_kv("mod_a", KvNamespace::Device, "#RDY").is_none());
    }

    #[test]
    fn ready_state_respects_phase_capability() {
        let mut ctx = ctx();

        ctx.phase = ScanPhase::ScanPostCurrent;
        let err = ctx.dev_set_ready("mod_a", DevReady::Public).unwrap_err();
        assert!(matches!(err, UcmdError::PhaseForbidden { .. }));
        assert_eq!(ctx.dev_get_ready(), DevReady::Unprocessed);

        ctx.phase = ScanPhase::ScanCurrent;
        ctx.dev_set_ready("mod_a", DevReady::Public).unwrap();
        assert_eq!(ctx.dev_get_ready(), DevReady::Public);
    }

    #[test]
    fn reserved_state_only_in_scan_next() {
        let mut ctx = ctx();

        ctx.phase = ScanPhase::ScanCurrent;
        assert!(ctx.dev_set_reserved("mod_a", DevReserved::Reserved).is_err());

        ctx.phase = ScanPhase::ScanNext;
        ctx.dev_set_reserved("mod_a", DevReserved::Reserved).unwrap();
        assert_eq!(ctx.dev_get_reserved(), DevReserved::Reserved);
    }

    #[test]
    fn global_reservation_blocks_device_scoped_write() {
        let mut ctx = ctx();
        mod_reserve_kv(&ctx.common, "mod_a", KvNamespace::Device, "claimed", false).unwrap();

        let err = ctx
            .set_kv("mod_b", KvNamespace::Device, "claimed", ValueFlags::NONE, b"x")
            .unwrap_err();
        assert!(matches!(
            err,
            UcmdError::Kv(KvError::FlagConflictReserved { .. })
        ));

        // The reserving module itself may write.
        ctx.set_kv("mod_a", KvNamespace::Device, "claimed", ValueFlags::NONE, b"x")
            .unwrap();
    }

    #[test]
    fn reservation_conflict_between_modules() {
        let common = ctx().common;
        mod_reserve_kv(&common, "mod_a", KvNamespace::Udev, "k", false).unwrap();
        let err = mod_reserve_kv(&common, "mod_b", KvNamespace::Udev, "k", false).unwrap_err();
        assert!(matches!(
            err,
            UcmdError::Kv(KvError::FlagConflictReserved { .. })
        ));

        // Unreserve by the wrong module fails, by the owner succeeds.
        assert!(mod_unreserve_kv(&common, "mod_b", KvNamespace::Udev, "k", false).is_err());
        mod_unreserve_kv(&common, "mod_a", KvNamespace::Udev, "k", false).unwrap();
        mod_reserve_kv(&common, "mod_b", KvNamespace::Udev, "k", false).unwrap();
    }

    #[test]
    fn group_membership_is_bidirectional() {
        let mut ctx = ctx();
        ctx.group_add_current_dev("mod_a", KvNamespace::Module, "raid1").unwrap();

        let kv = ctx.common.kv.lock().unwrap();
        let members = kv.get(":USR:M:mod_a:raid1::#GMB").unwrap();
        assert_eq!(
            members.items().unwrap(),
            &[b"::D:8_0::".to_vec()]
        );
        let gin = kv.get("::D:8_0:::#GIN").unwrap();
        assert_eq!(gin.items().unwrap(), &[b":USR:M:mod_a:raid1:".to_vec()]);
    }

    #[test]
    fn group_destroy_refuses_non_empty_without_force() {
        let mut ctx = ctx();
        ctx.group_add_current_dev("mod_a", KvNamespace::Module, "grp").unwrap();

        let err = ctx
            .group_destroy("mod_a", KvNamespace::Module, "grp", false)
            .unwrap_err();
        assert!(matches!(err, UcmdError::Kv(KvError::NotEmpty { .. })));

        ctx.group_destroy("mod_a", KvNamespace::Module, "grp", true).unwrap();
        let kv = ctx.common.kv.lock().unwrap();
        assert!(kv
            .get(":USR:M:mod_a:grp::#GMB")
            .unwrap()
            .items()
            .unwrap()
            .is_empty());
        // Inverse record no longer references the group.
        assert!(kv.get("::D:8_0:::#GIN").unwrap().items().unwrap().is_empty());
    }
}
