//! End-to-end scan pipeline tests over a fabricated sysfs/procfs tree.

use std::fs::{create_dir_all, write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sid_core::key::KvNamespace;
use sid_core::value::ValueFlags;
use sid_daemon::cmd::api::DevReady;
use sid_daemon::cmd::{CmdState, UcmdCtx};
use sid_daemon::context::CommonCtx;
use sid_daemon::device::build_udev_env;
use sid_daemon::module::{ModuleRegistry, ModuleResult, ScanModule};
use sid_daemon::protocol::{MsgCategory, MsgHeader, SidCmd};
use sid_daemon::scan;
use tempfile::TempDir;

/// A module that records every phase callback it receives.
struct Recorder {
    name: &'static str,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn log(&self, phase: &str) {
        self.calls.lock().unwrap().push(format!("{}:{phase}", self.name));
    }
}

impl ScanModule for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn ident(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        self.log("ident");
        Ok(())
    }

    fn scan_pre(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        self.log("scan-pre");
        Ok(())
    }

    fn scan_current(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        self.log("scan-current");
        Ok(())
    }

    fn scan_next(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        self.log("scan-next");
        Ok(())
    }

    fn scan_post_current(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        self.log("scan-post-current");
        Ok(())
    }

    fn scan_post_next(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        self.log("scan-post-next");
        Ok(())
    }

    fn error(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        self.log("error");
        Ok(())
    }
}

/// A type module that marks the device public and nominates a next-layer
/// module.
struct SdModule {
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScanModule for SdModule {
    fn name(&self) -> &str {
        "sd"
    }

    fn scan_current(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        self.calls.lock().unwrap().push("sd:scan-current".into());
        ctx.dev_set_ready("sd", DevReady::Public)?;
        ctx.set_kv(
            "sd",
            KvNamespace::Device,
            "SID_NEXT_MOD",
            ValueFlags::NONE,
            b"dm\0",
        )?;
        Ok(())
    }
}

/// The nominated next-layer module.
struct DmModule {
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScanModule for DmModule {
    fn name(&self) -> &str {
        "dm"
    }

    fn scan_next(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        self.calls.lock().unwrap().push("dm:scan-next".into());
        Ok(())
    }
}

/// A module whose scan-current fails, to drive the error phase.
struct Exploding {
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScanModule for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    fn scan_current(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        Err(sid_daemon::module::ModuleError::Failed("boom".into()))
    }

    fn error(&self, _ctx: &mut UcmdCtx) -> ModuleResult {
        self.calls.lock().unwrap().push("exploding:error".into());
        Ok(())
    }
}

struct Fixture {
    _dirs: (TempDir, TempDir),
    sysfs: PathBuf,
    proc: PathBuf,
}

/// A whole disk sda (8:0) with two slaves, plus the procfs block table.
fn fixture() -> Fixture {
    let sysfs_dir = TempDir::new().unwrap();
    let proc_dir = TempDir::new().unwrap();

    let slaves = sysfs_dir.path().join("block/sda/slaves");
    for (slave, devno) in [("dm-1", "253:1\n"), ("dm-2", "253:2\n")] {
        create_dir_all(slaves.join(slave)).unwrap();
        write(slaves.join(slave).join("dev"), devno).unwrap();
    }
    write(
        proc_dir.path().join("devices"),
        "Character devices:\n  1 mem\n\nBlock devices:\n  8 sd\n253 device-mapper\n",
    )
    .unwrap();
    create_dir_all(proc_dir.path().join("sys/kernel/random")).unwrap();
    write(
        proc_dir.path().join("sys/kernel/random/boot_id"),
        "11111111-2222-3333-4444-555555555555\n",
    )
    .unwrap();

    Fixture {
        sysfs: sysfs_dir.path().to_path_buf(),
        proc: proc_dir.path().to_path_buf(),
        _dirs: (sysfs_dir, proc_dir),
    }
}

fn scan_ctx(fixture: &Fixture, modules: ModuleRegistry) -> UcmdCtx {
    let common = CommonCtx::with_boot_id(
        modules,
        fixture.sysfs.clone(),
        fixture.proc.clone(),
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
            ("SYNTH_UUID", "abc"),
        ],
    );
    UcmdCtx::new(
        MsgCategory::Client,
        MsgHeader::request(SidCmd::Scan, 0),
        &payload,
        common,
        "worker-test",
    )
    .unwrap()
}

#[test]
fn fresh_disk_scan_seeds_state_and_hierarchy() {
    let fixture = fixture();
    let mut ctx = scan_ctx(&fixture, ModuleRegistry::new());
    scan::run_scan(&mut ctx).unwrap();

    let kv = ctx.common.kv.lock().unwrap();

    // Device state records initialized to unprocessed.
    let rdy = kv.get("::D:8_0:::#RDY").unwrap();
    assert_eq!(rdy.data().unwrap(), &[DevReady::Unprocessed as u8]);
    assert_eq!(rdy.header.owner, "#core");
    assert!(kv.get("::D:8_0:::#RES").is_some());

    // udev environment imported.
    assert_eq!(kv.get("::U:8_0:::ACTION").unwrap().data().unwrap(), b"add\0");
    assert_eq!(
        kv.get("::U:8_0:::SID_SESSION_ID").unwrap().data().unwrap(),
        b"worker-test\0"
    );

    // Hierarchy from sysfs slaves, with inverse records.
    let gmb = kv.get(":LYR:D:8_0:::#GMB").unwrap();
    assert_eq!(
        gmb.items().unwrap(),
        &[b":LYR:D:253_1::".to_vec(), b":LYR:D:253_2::".to_vec()]
    );
    for devno in ["253_1", "253_2"] {
        let gin = kv.get(&format!(":LYR:D:{devno}:::#GIN")).unwrap();
        assert_eq!(gin.items().unwrap(), &[b":LYR:D:8_0::".to_vec()]);
    }

    // The resolved driver name is cached.
    let module = kv.get("::D:8_0:::#MOD").unwrap();
    assert_eq!(module.data().unwrap(), b"sd\0");
}

#[test]
fn block_modules_fan_out_in_order_and_type_module_matches() {
    let fixture = fixture();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut modules = ModuleRegistry::new();
    modules.register_block(Arc::new(Recorder {
        name: "blk_a",
        calls: calls.clone(),
    }));
    modules.register_block(Arc::new(Recorder {
        name: "blk_b",
        calls: calls.clone(),
    }));
    modules.register_type(Arc::new(SdModule { calls: calls.clone() }));
    modules.register_type(Arc::new(DmModule { calls: calls.clone() }));

    let mut ctx = scan_ctx(&fixture, modules);
    scan::run_scan(&mut ctx).unwrap();

    let calls = calls.lock().unwrap();

    // Registration order within each phase.
    let ident_calls: Vec<_> = calls.iter().filter(|c| c.ends_with(":ident")).collect();
    assert_eq!(ident_calls, ["blk_a:ident", "blk_b:ident"]);

    // The matched type module ran, set ready state, and nominated the
    // next-layer module which then ran in scan-next.
    assert!(calls.contains(&"sd:scan-current".to_string()));
    assert!(calls.contains(&"dm:scan-next".to_string()));

    drop(calls);
    assert_eq!(ctx.dev_get_ready(), DevReady::Public);
}

#[test]
fn module_failure_routes_through_error_phase() {
    let fixture = fixture();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut modules = ModuleRegistry::new();
    modules.register_block(Arc::new(Exploding { calls: calls.clone() }));
    modules.register_block(Arc::new(Recorder {
        name: "observer",
        calls: calls.clone(),
    }));

    let mut ctx = scan_ctx(&fixture, modules);
    // Module failure is recovered through the error phase.
    scan::run_scan(&mut ctx).unwrap();

    let calls = calls.lock().unwrap();
    assert!(calls.contains(&"exploding:error".to_string()));
    assert!(calls.contains(&"observer:error".to_string()));
    // Phases after the failing one never ran.
    assert!(!calls.iter().any(|c| c.ends_with(":scan-post-current")));
}

#[test]
fn init_failure_is_fatal() {
    let fixture = fixture();
    let common = CommonCtx::with_boot_id(
        ModuleRegistry::new(),
        fixture.sysfs.clone(),
        fixture.proc.clone(),
        "boot".into(),
    );
    // A disk whose sysfs entry is missing: the hierarchy refresh in INIT
    // cannot run.
    let payload = build_udev_env(
        8,
        16,
        &[
            ("ACTION", "add"),
            ("DEVPATH", "/block/sdb"),
            ("DEVTYPE", "disk"),
            ("SEQNUM", "43"),
        ],
    );
    let mut ctx = UcmdCtx::new(
        MsgCategory::Client,
        MsgHeader::request(SidCmd::Scan, 0),
        &payload,
        common,
        "worker-test",
    )
    .unwrap();

    let err = scan::run_scan(&mut ctx).unwrap_err();
    assert!(matches!(
        err,
        sid_daemon::cmd::UcmdError::ScanFailed {
            phase: scan::ScanPhase::Init
        }
    ));
}

#[test]
fn command_state_machine_reaches_terminal_states() {
    let fixture = fixture();
    let mut ctx = scan_ctx(&fixture, ModuleRegistry::new());
    assert_eq!(ctx.state, CmdState::ExecScheduled);

    ctx.advance(CmdState::Executing);
    scan::run_scan(&mut ctx).unwrap();
    ctx.advance(CmdState::ExecFinished);
    ctx.advance(CmdState::ExpectingExpbufAck);
    ctx.advance(CmdState::ExpbufAcked);
    ctx.advance(CmdState::Ok);
    assert!(ctx.state.is_terminal());
}
