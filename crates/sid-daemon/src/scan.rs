//! Scan pipeline: the ordered phase sequence a device runs through.
//!
//! Phases execute strictly in declared order. Each phase fans out over
//! all block modules in registration order, then invokes the matched
//! type module for the current layer and, from `SCAN_NEXT` onward, the
//! optional next-layer module nominated under the `SID_NEXT_MOD` device
//! record. A failing phase (outside `INIT`/`EXIT`, which are fatal)
//! routes the command through the error phase once and then straight to
//! `EXIT`.
//!
//! Phase capability masks decide what modules may mutate: only
//! `SCAN_PRE` and `SCAN_CURRENT` may set device ready state, only
//! `SCAN_NEXT` may set reserved state.

use sid_core::delta::{delta_set, DeltaFlags, RelKeys};
use sid_core::key::{KeySpec, KvNamespace, KvOp, DOM_LAYER, ID_NULL};
use sid_core::value::ValueFlags;
use tracing::{debug, error};

use crate::cmd::{UcmdCtx, UcmdError};
use crate::context::{
    CommonCtx, KEY_DEVICE_NEXT_MOD, KEY_DEV_MOD, KEY_DEV_READY, KEY_DEV_RESERVED, KEY_GROUP_IN,
    KEY_GROUP_MEMBERS,
};
use crate::cmd::api::{DevReady, DevReserved};
use crate::device::{canonicalize_kv_key, canonicalize_module_name, UdevAction, UdevDevType};
use crate::module::{ModuleRef, OWNER_CORE};
use crate::sysfs;

/// What a phase permits modules to mutate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCaps {
    /// Device ready state may be set.
    pub ready: bool,
    /// Device reserved state may be set.
    pub reserved: bool,
}

/// Scan phases, in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanPhase {
    /// Core-only initialization: device records and hierarchy refresh.
    #[default]
    Init,
    /// Type module resolution.
    Ident,
    /// Pre-scan.
    ScanPre,
    /// Current-layer scan.
    ScanCurrent,
    /// Next-layer scan.
    ScanNext,
    /// Post-scan, current layer.
    ScanPostCurrent,
    /// Post-scan, next layer.
    ScanPostNext,
    /// Core waits for confirmation.
    Waiting,
    /// Core-only teardown.
    Exit,
    /// Deferred trigger action, current layer.
    TriggerActionCurrent,
    /// Deferred trigger action, next layer.
    TriggerActionNext,
    /// Error recovery, entered at most once per command.
    Error,
}

impl ScanPhase {
    /// The main phase sequence of a scan command.
    pub const SEQUENCE: [Self; 9] = [
        Self::Init,
        Self::Ident,
        Self::ScanPre,
        Self::ScanCurrent,
        Self::ScanNext,
        Self::ScanPostCurrent,
        Self::ScanPostNext,
        Self::Waiting,
        Self::Exit,
    ];

    /// Capability mask of this phase.
    #[must_use]
    pub const fn caps(self) -> PhaseCaps {
        match self {
            // Core-only phases carry every capability.
            Self::Init | Self::Exit => PhaseCaps {
                ready: true,
                reserved: true,
            },
            Self::ScanPre | Self::ScanCurrent => PhaseCaps {
                ready: true,
                reserved: false,
            },
            Self::ScanNext => PhaseCaps {
                ready: false,
                reserved: true,
            },
            _ => PhaseCaps {
                ready: false,
                reserved: false,
            },
        }
    }

    /// Short phase name, as logged.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ident => "ident",
            Self::ScanPre => "scan-pre",
            Self::ScanCurrent => "scan-current",
            Self::ScanNext => "scan-next",
            Self::ScanPostCurrent => "scan-post-current",
            Self::ScanPostNext => "scan-post-next",
            Self::Waiting => "waiting",
            Self::Exit => "exit",
            Self::TriggerActionCurrent => "trigger-action-current",
            Self::TriggerActionNext => "trigger-action-next",
            Self::Error => "error",
        }
    }
}

/// Module selections carried across the phases of one scan.
#[derive(Default)]
struct ScanExec {
    type_mod_current: Option<ModuleRef>,
    type_mod_next: Option<ModuleRef>,
}

/// Run the scan phase sequence for the command.
///
/// # Errors
///
/// [`UcmdError::ScanFailed`] when `INIT` or `EXIT` fails; module
/// failures in other phases are recovered through the error phase and do
/// not fail the command.
pub fn run_scan(ctx: &mut UcmdCtx) -> Result<(), UcmdError> {
    let mut exec = ScanExec::default();

    for phase in ScanPhase::SEQUENCE {
        ctx.phase = phase;
        debug!(cmd = %ctx.id, phase = phase.name(), "executing scan phase");

        let result = exec_phase(ctx, &mut exec, phase);
        let Err(err) = result else { continue };
        error!(cmd = %ctx.id, phase = phase.name(), %err, "scan phase failed");

        if matches!(phase, ScanPhase::Init | ScanPhase::Exit) {
            return Err(UcmdError::ScanFailed { phase });
        }

        // Give modules one shot at recovery, then finish through exit.
        ctx.phase = ScanPhase::Error;
        if let Err(err) = exec_error_phase(ctx, &exec) {
            error!(cmd = %ctx.id, %err, "error phase failed");
        }
        ctx.phase = ScanPhase::Exit;
        exec_phase(ctx, &mut exec, ScanPhase::Exit)
            .map_err(|_| UcmdError::ScanFailed { phase: ScanPhase::Exit })?;
        return Ok(());
    }

    Ok(())
}

/// Run the deferred trigger-action phases.
///
/// # Errors
///
/// Propagates the failing phase.
pub fn run_trigger_actions(ctx: &mut UcmdCtx) -> Result<(), UcmdError> {
    let mut exec = ScanExec::default();
    for phase in [ScanPhase::TriggerActionCurrent, ScanPhase::TriggerActionNext] {
        ctx.phase = phase;
        exec_phase(ctx, &mut exec, phase)?;
    }
    Ok(())
}

fn module_failure(name: &str, err: &crate::module::ModuleError) -> UcmdError {
    UcmdError::InvalidInput(format!("module {name} failed: {err}"))
}

/// Fan out over all block modules for `phase`, in registration order.
fn exec_block_modules(ctx: &mut UcmdCtx, phase: ScanPhase) -> Result<(), UcmdError> {
    let modules = ctx.common.modules.clone();
    for module in modules.block_modules() {
        let result = match phase {
            ScanPhase::Ident => module.ident(ctx),
            ScanPhase::ScanPre => module.scan_pre(ctx),
            ScanPhase::ScanCurrent => module.scan_current(ctx),
            ScanPhase::ScanNext => module.scan_next(ctx),
            ScanPhase::ScanPostCurrent => module.scan_post_current(ctx),
            ScanPhase::ScanPostNext => module.scan_post_next(ctx),
            ScanPhase::TriggerActionCurrent => module.trigger_action_current(ctx),
            ScanPhase::TriggerActionNext => module.trigger_action_next(ctx),
            ScanPhase::Error => module.error(ctx),
            ScanPhase::Init | ScanPhase::Exit | ScanPhase::Waiting => Ok(()),
        };
        if let Err(err) = result {
            return Err(module_failure(module.name(), &err));
        }
    }
    Ok(())
}

fn exec_phase(ctx: &mut UcmdCtx, exec: &mut ScanExec, phase: ScanPhase) -> Result<(), UcmdError> {
    match phase {
        ScanPhase::Init => exec_init(ctx),
        ScanPhase::Ident => exec_ident(ctx, exec),
        ScanPhase::ScanNext => exec_scan_next(ctx, exec),
        ScanPhase::Waiting | ScanPhase::Exit => Ok(()),
        ScanPhase::Error => exec_error_phase(ctx, exec),
        _ => {
            exec_block_modules(ctx, phase)?;
            let (current, next) = (exec.type_mod_current.clone(), exec.type_mod_next.clone());
            let module = match phase {
                ScanPhase::ScanPostNext | ScanPhase::TriggerActionNext => next,
                _ => current,
            };
            let Some(module) = module else { return Ok(()) };
            let result = match phase {
                ScanPhase::ScanPre => module.scan_pre(ctx),
                ScanPhase::ScanCurrent => module.scan_current(ctx),
                ScanPhase::ScanPostCurrent => module.scan_post_current(ctx),
                ScanPhase::ScanPostNext => module.scan_post_next(ctx),
                ScanPhase::TriggerActionCurrent => module.trigger_action_current(ctx),
                ScanPhase::TriggerActionNext => module.trigger_action_next(ctx),
                _ => Ok(()),
            };
            result.map_err(|e| module_failure(module.name(), &e))
        }
    }
}

/// `INIT`: seed the device state records and refresh the hierarchy.
fn exec_init(ctx: &mut UcmdCtx) -> Result<(), UcmdError> {
    set_device_kv_records(ctx)?;
    refresh_device_hierarchy(ctx)
}

fn set_device_kv_records(ctx: &mut UcmdCtx) -> Result<(), UcmdError> {
    if ctx
        .do_get_kv(OWNER_CORE, None, KvNamespace::Device, KEY_DEV_READY)
        .is_none()
    {
        ctx.do_set_kv(
            OWNER_CORE,
            None,
            KvNamespace::Device,
            KEY_DEV_READY,
            ValueFlags::CORE_DEFAULTS,
            Some(&[DevReady::Unprocessed as u8]),
        )?;
        ctx.do_set_kv(
            OWNER_CORE,
            None,
            KvNamespace::Device,
            KEY_DEV_RESERVED,
            ValueFlags::CORE_DEFAULTS,
            Some(&[DevReserved::Unprocessed as u8]),
        )?;
    }
    Ok(())
}

fn hierarchy_rel_keys(ctx: &UcmdCtx) -> RelKeys {
    RelKeys {
        cur: KeySpec {
            op: KvOp::Set,
            dom: DOM_LAYER.into(),
            ns: KvNamespace::Device,
            ns_part: ctx.dev.id.clone(),
            id: ID_NULL.into(),
            id_part: ID_NULL.into(),
            core: KEY_GROUP_MEMBERS.into(),
        },
        rel: KeySpec {
            op: KvOp::Set,
            dom: DOM_LAYER.into(),
            ns: KvNamespace::Device,
            ns_part: ID_NULL.into(),
            id: ID_NULL.into(),
            id_part: ID_NULL.into(),
            core: KEY_GROUP_IN.into(),
        },
    }
}

/// Refresh the device-hierarchy records from sysfs: a whole disk lists
/// its slaves, a partition points at its whole disk. The delta SET keeps
/// the inverse membership records in step.
fn refresh_device_hierarchy(ctx: &mut UcmdCtx) -> Result<(), UcmdError> {
    let mut members: Vec<Vec<u8>> = Vec::new();

    match ctx.dev.udev.devtype {
        UdevDevType::Disk => {
            if ctx.dev.udev.action != UdevAction::Remove {
                let devnos = sysfs::disk_slave_devnos(&ctx.common.sysfs_root, &ctx.dev.udev.path)?;
                let keys = hierarchy_rel_keys(ctx);
                for devno in devnos {
                    let mut spec = keys.rel.clone();
                    spec.ns_part = canonicalize_kv_key(&devno);
                    members.push(spec.compose_prefix().into_bytes());
                }
            }
        }
        UdevDevType::Partition => {
            let devno = sysfs::partition_parent_devno(&ctx.common.sysfs_root, &ctx.dev.udev.path)?;
            let keys = hierarchy_rel_keys(ctx);
            let mut spec = keys.rel.clone();
            spec.ns_part = canonicalize_kv_key(&devno);
            members.push(spec.compose_prefix().into_bytes());
        }
        UdevDevType::Unknown => return Ok(()),
    }

    let keys = hierarchy_rel_keys(ctx);
    let key = keys.cur.compose();
    let header = ctx
        .common
        .core_header(ctx.dev.udev.seqnum, CommonCtx::core_flags_no_sync());

    let mut kv = ctx.common.kv.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    delta_set(
        &mut kv,
        &key,
        &header,
        members,
        KvOp::Set,
        DeltaFlags::DIFF_AND_REL,
        Some(&keys),
        true,
    )?;
    Ok(())
}

/// `IDENT`: resolve the type module for the device's driver.
fn exec_ident(ctx: &mut UcmdCtx, exec: &mut ScanExec) -> Result<(), UcmdError> {
    if let Some(name) = lookup_module_name(ctx) {
        exec.type_mod_current = ctx.common.modules.type_module(&name);
        if exec.type_mod_current.is_none() {
            debug!(cmd = %ctx.id, module = %name, "type module not loaded");
        }
    }

    exec_block_modules(ctx, ScanPhase::Ident)?;

    let Some(module) = exec.type_mod_current.clone() else {
        return Ok(());
    };
    module
        .ident(ctx)
        .map_err(|e| module_failure(module.name(), &e))
}

/// `SCAN_NEXT`: fan out, then pick up the next-layer module nominated by
/// a previous phase and run it.
fn exec_scan_next(ctx: &mut UcmdCtx, exec: &mut ScanExec) -> Result<(), UcmdError> {
    exec_block_modules(ctx, ScanPhase::ScanNext)?;

    exec.type_mod_next = ctx
        .do_get_kv(
            OWNER_CORE,
            Some(sid_core::key::DOM_USER),
            KvNamespace::Device,
            KEY_DEVICE_NEXT_MOD,
        )
        .and_then(|(data, _)| {
            let name = String::from_utf8_lossy(&data);
            let name = name.trim_end_matches('\0');
            let module = ctx.common.modules.type_module(name);
            if module.is_none() {
                debug!(cmd = %ctx.id, module = %name, "next-layer module not loaded");
            }
            module
        });

    let Some(module) = exec.type_mod_next.clone() else {
        return Ok(());
    };
    module
        .scan_next(ctx)
        .map_err(|e| module_failure(module.name(), &e))
}

/// The error phase runs every module's error handler and reports failure
/// if any handler failed.
fn exec_error_phase(ctx: &mut UcmdCtx, exec: &ScanExec) -> Result<(), UcmdError> {
    let mut failed = false;

    if exec_block_modules(ctx, ScanPhase::Error).is_err() {
        failed = true;
    }
    for module in [exec.type_mod_current.clone(), exec.type_mod_next.clone()]
        .into_iter()
        .flatten()
    {
        if let Err(err) = module.error(ctx) {
            error!(cmd = %ctx.id, module = module.name(), %err, "module error handler failed");
            failed = true;
        }
    }

    if failed {
        return Err(UcmdError::ScanFailed {
            phase: ScanPhase::Error,
        });
    }
    Ok(())
}

/// Resolve the device's type module name: a previously stored `#MOD`
/// record wins, otherwise the block-major table in procfs decides and
/// the answer is cached back into the store.
fn lookup_module_name(ctx: &mut UcmdCtx) -> Option<String> {
    if let Some((data, _)) = ctx.do_get_kv(OWNER_CORE, None, KvNamespace::Device, KEY_DEV_MOD) {
        let name = String::from_utf8_lossy(&data);
        return Some(name.trim_end_matches('\0').to_string());
    }

    let name = match sysfs::block_module_for_major(&ctx.common.proc_root, ctx.dev.udev.major) {
        Ok(Some(name)) => canonicalize_module_name(&name),
        Ok(None) => {
            debug!(cmd = %ctx.id, major = ctx.dev.udev.major, "no block driver for major");
            return None;
        }
        Err(err) => {
            debug!(cmd = %ctx.id, %err, "failed to read block device table");
            return None;
        }
    };

    let mut bytes = name.clone().into_bytes();
    bytes.push(0);
    if let Err(err) = ctx.do_set_kv(
        OWNER_CORE,
        None,
        KvNamespace::Device,
        KEY_DEV_MOD,
        ValueFlags::CORE_DEFAULTS,
        Some(&bytes),
    ) {
        debug!(cmd = %ctx.id, %err, "failed to cache module name");
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_capability_masks() {
        assert!(ScanPhase::ScanPre.caps().ready);
        assert!(ScanPhase::ScanCurrent.caps().ready);
        assert!(!ScanPhase::ScanCurrent.caps().reserved);
        assert!(ScanPhase::ScanNext.caps().reserved);
        assert!(!ScanPhase::ScanNext.caps().ready);
        assert!(!ScanPhase::ScanPostCurrent.caps().ready);
        assert!(!ScanPhase::Ident.caps().reserved);
        assert!(ScanPhase::Init.caps().ready && ScanPhase::Init.caps().reserved);
    }

    #[test]
    fn sequence_is_declared_order() {
        let names: Vec<_> = ScanPhase::SEQUENCE.iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec![
                "init",
                "ident",
                "scan-pre",
                "scan-current",
                "scan-next",
                "scan-post-current",
                "scan-post-next",
                "waiting",
                "exit"
            ]
        );
    }
}
