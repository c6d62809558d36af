// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end lifecycle scenarios against the simulated host.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use domctl::config::DaemonConfig;
use domctl::devices::vbd::{VbdBackendKind, VbdMode, VbdSpec};
use domctl::hypervisor::{HypervisorControl, ShutdownReason};
use domctl::lifecycle::{Engine, PowerState, VmSpec};
use domctl::memory_broker::{CachedBroker, CODE_CANNOT_FREE_THIS_MUCH};
use domctl::persist::{BuildPlan, CreateInfo, DirectPvParams, HvmParams};
use domctl::rpc_interface::{Dispatcher, Request, Response};
use domctl::storage::DiskSource;
use domctl::store::{MemStore, Store};
use domctl::task::TaskHandle;
use domctl::updates::{Update, UpdateBus};
use domctl::utilities::{
    SimBackendAgent, SimBroker, SimBuilder, SimDm, SimDmState, SimGuestAgent, SimHypervisor,
    SimStorage, SIM_DM_STATE,
};
use domctl::{DomId, Error, VmId};
use vmm_sys_util::tempdir::TempDir;

const MIB_256: u64 = 268_435_456;

struct World {
    // Keeps the state root alive for the engine's lifetime.
    _dir: TempDir,
    store: Arc<MemStore>,
    hv: Arc<SimHypervisor>,
    broker: Arc<SimBroker>,
    storage: Arc<SimStorage>,
    builder: Arc<SimBuilder>,
    dm: Arc<SimDm>,
    engine: Arc<Engine>,
}

fn world() -> World {
    let dir = TempDir::new().unwrap();
    let cfg: DaemonConfig = serde_json::from_value(serde_json::json!({
        "state_root": dir.as_path(),
        "dying_poll_period_ms": 10,
        "dying_budget_ms": 150,
        "shutdown_ack_delay_ms": 500,
        "suspend_budget_ms": 2_000,
        "device_shutdown_timeout_ms": 1_000,
        "dm_ack_timeout_ms": 200,
    }))
    .unwrap();

    let store = Arc::new(MemStore::new());
    let hv = Arc::new(SimHypervisor::new());
    hv.attach_store(store.clone());
    let broker = Arc::new(SimBroker::new(4 << 20)); // 4 GiB in KiB
    let storage = Arc::new(SimStorage::new());
    let builder = Arc::new(SimBuilder::new(hv.clone()));
    let dm = Arc::new(SimDm::new());
    let engine = Arc::new(
        Engine::new(
            cfg,
            store.clone(),
            hv.clone(),
            Arc::new(CachedBroker::with_timing(
                broker.clone(),
                Duration::from_millis(5),
                Duration::from_millis(50),
            )),
            storage.clone(),
            builder.clone(),
            dm.clone(),
            Arc::new(UpdateBus::new()),
        )
        .unwrap(),
    );
    World {
        _dir: dir,
        store,
        hv,
        broker,
        storage,
        builder,
        dm,
        engine,
    }
}

fn pv_spec(name: &str) -> VmSpec {
    VmSpec {
        create_info: CreateInfo {
            hvm: false,
            hap: false,
            ssidref: 0,
            name: name.to_string(),
            xsdata: BTreeMap::new(),
            platformdata: BTreeMap::new(),
        },
        vcpus: 1,
        shadow_multiplier: 1.0,
        memory_static_max: MIB_256,
        memory_dynamic_min: MIB_256,
        memory_dynamic_max: MIB_256,
        build_plan: BuildPlan::DirectPv(DirectPvParams {
            kernel: "/tmp/k".into(),
            cmdline: "root=/dev/xvda1".into(),
            ramdisk: None,
        }),
        cpuid: Vec::new(),
    }
}

fn hvm_spec(name: &str, shadow_multiplier: f64) -> VmSpec {
    let mut spec = pv_spec(name);
    spec.create_info.hvm = true;
    spec.shadow_multiplier = shadow_multiplier;
    spec.build_plan = BuildPlan::Hvm(HvmParams {
        pae: true,
        apic: true,
        acpi: true,
        nx: false,
        viridian: false,
        timeoffset: "0".into(),
        shadow_multiplier,
        video_mib: 4,
    });
    spec
}

fn vbd(id: &str, number: u32, disk: Option<DiskSource>) -> VbdSpec {
    VbdSpec {
        id: id.to_string(),
        mode: VbdMode::ReadWrite,
        backend_kind: VbdBackendKind::Vbd,
        device_number: Some(number),
        disk,
        cdrom: false,
        extra_backend_keys: BTreeMap::new(),
    }
}

#[test]
fn test_create_pv_direct() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("11111111-1111-1111-1111-111111111111".into());

    let domid = w.engine.create(&task, &vm, &pv_spec("pv-guest")).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();

    let dom = format!("/local/domain/{}", domid);
    assert_eq!(
        w.store.read(&format!("{}/memory/static-max", dom)).unwrap(),
        "262144"
    );
    assert_eq!(
        w.store.read(&format!("{}/memory/target", dom)).unwrap(),
        "262144"
    );
    let store_port: u32 = w
        .store
        .read(&format!("{}/store/port", dom))
        .unwrap()
        .parse()
        .unwrap();
    let console_port: u32 = w
        .store
        .read(&format!("{}/console/port", dom))
        .unwrap()
        .parse()
        .unwrap();
    assert_ne!(store_port, console_port);
    let protocol = w.store.read(&format!("/private/{}/protocol", domid)).unwrap();
    assert!(protocol == "x86_32-abi" || protocol == "x86_64-abi");
    assert!(w
        .store
        .read(&format!("{}/store/ring-ref", dom))
        .unwrap()
        .parse::<u64>()
        .is_ok());
}

#[test]
fn test_hvm_build_shadow_reverted() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("aaaaaaaa-0000-0000-0000-000000000001".into());

    w.builder.steal_shadow();
    let domid = w.engine.create(&task, &vm, &hvm_spec("hvm-guest", 4.0)).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();

    // shadow(256 MiB, 1 vcpu, x4) = ceil(4 * (0.25 + 1)) = 5 MiB; the
    // builder halved it behind our back and the engine put it back.
    assert_eq!(w.hv.shadow_allocation_get(domid).unwrap(), 5);
}

#[test]
fn test_suspend_resume_idempotent() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("bbbbbbbb-0000-0000-0000-000000000002".into());

    let domid = w.engine.create(&task, &vm, &pv_spec("guest")).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();
    let _guest = SimGuestAgent::spawn(w.store.clone(), w.hv.clone(), domid);

    w.engine.suspend(&task, &vm).unwrap();
    let state = w.engine.get_state(&vm).unwrap();
    let n = state.suspend_memory_bytes;
    assert!(n > 0);
    assert_eq!(n % 4096, 0);
    let expected_pages = n / 4096;

    // Tear the old domain down; the record must survive a suspend.
    w.engine.destroy(&task, &vm, false).unwrap();
    assert_eq!(
        w.engine.get_state(&vm).unwrap().power_state,
        PowerState::Suspended
    );

    let domid2 = w.engine.create(&task, &vm, &pv_spec("guest")).unwrap();
    // Resume pins the reservation to exactly the suspended size.
    assert_eq!(
        w.broker.last_reserve(),
        Some((n / 1024, n / 1024))
    );
    w.engine.restore(&task, &vm).unwrap();

    let pages = w.hv.domain_getinfo(domid2).unwrap().total_memory_pages;
    assert!(pages.abs_diff(expected_pages) <= 1);
    // The image was consumed.
    assert_eq!(w.engine.get_state(&vm).unwrap().suspend_memory_bytes, 0);
}

#[test]
fn test_hvm_suspend_restore_carries_dm_state() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("99999999-0000-0000-0000-00000000000f".into());

    let domid = w.engine.create(&task, &vm, &hvm_spec("hvm-guest", 1.0)).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();
    w.engine.start_device_model(&task, &vm).unwrap();
    assert_eq!(w.dm.state_of(domid), Some(SimDmState::Started));

    // An HVM guest without PV drivers is shut down by the hypervisor, so
    // no guest agent is needed for the rendezvous.
    w.engine.suspend(&task, &vm).unwrap();
    assert_eq!(w.dm.state_of(domid), Some(SimDmState::Suspended));

    w.engine.destroy(&task, &vm, false).unwrap();
    let domid2 = w.engine.create(&task, &vm, &hvm_spec("hvm-guest", 1.0)).unwrap();
    w.engine.restore(&task, &vm).unwrap();

    // The framed device-model record round-tripped through the image.
    assert_eq!(w.dm.restored_blob(domid2), Some(SIM_DM_STATE.to_vec()));
    assert_eq!(w.dm.state_of(domid2), Some(SimDmState::Restored));
}

#[test]
fn test_destroy_stuck_in_dying() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("cccccccc-0000-0000-0000-000000000003".into());

    let domid = w.engine.create(&task, &vm, &pv_spec("guest")).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();
    w.hv.set_stuck(domid);

    assert_eq!(
        w.engine.destroy(&task, &vm, false),
        Err(Error::StuckInDyingState(domid))
    );
    assert!(w
        .hv
        .uuid_of(domid)
        .unwrap()
        .starts_with("deadbeef-dead-beef-dead-beef0000"));
}

#[test]
fn test_reservation_leak_free_on_create_failure() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("dddddddd-0000-0000-0000-000000000004".into());

    // Failure after the reservation was granted: the domain refuses to be
    // created, so the reservation must be released on the way out.
    w.hv.fail_next_create("no memory for a new domain");
    assert!(w.engine.create(&task, &vm, &pv_spec("guest")).is_err());
    assert_eq!(w.broker.outstanding(), 0);
    assert!(!w
        .hv
        .domain_getinfolist(DomId(0))
        .unwrap()
        .iter()
        .any(|info| info.uuid == vm.0));

    // Failure at reserve time surfaces the broker's code and leaks
    // nothing either.
    w.broker.refuse_next(u32::MAX, CODE_CANNOT_FREE_THIS_MUCH);
    match w.engine.create(&task, &vm, &pv_spec("guest")) {
        Err(Error::BallooningError(code, _)) => assert_eq!(code, CODE_CANNOT_FREE_THIS_MUCH),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(w.broker.outstanding(), 0);
}

#[test]
fn test_update_ordering_across_vms() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm_x = VmId("eeeeeeee-0000-0000-0000-000000000005".into());
    let vm_y = VmId("ffffffff-0000-0000-0000-000000000006".into());

    w.engine.create(&task, &vm_x, &pv_spec("x")).unwrap();
    w.engine.create(&task, &vm_y, &pv_spec("y")).unwrap();

    let (updates, next) = w.engine.updates().get(0, Duration::from_secs(1));
    let position = |vm: &VmId| {
        updates
            .iter()
            .position(|u| u == &Update::Vm(vm.clone()))
            .expect("update present")
    };
    assert!(position(&vm_x) < position(&vm_y));

    let (empty, same_next) = w.engine.updates().get(next - 1, Duration::from_millis(50));
    assert!(empty.is_empty());
    assert_eq!(same_next, next);
}

#[test]
fn test_cooperative_shutdown_clears_node() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("11111111-aaaa-0000-0000-000000000007".into());

    let domid = w.engine.create(&task, &vm, &pv_spec("guest")).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();
    let _guest = SimGuestAgent::spawn(w.store.clone(), w.hv.clone(), domid);

    let acked = w
        .engine
        .request_shutdown(&task, &vm, ShutdownReason::Poweroff, Duration::from_secs(1))
        .unwrap();
    assert!(acked);
    assert_eq!(
        w.store
            .read(&format!("/local/domain/{}/control/shutdown", domid))
            .unwrap(),
        ""
    );
    // The guest went down with the matching code.
    assert_eq!(
        w.hv.domain_getinfo(domid).unwrap().shutdown_reason(),
        Some(ShutdownReason::Poweroff)
    );
}

#[test]
fn test_vbd_plug_tags_and_looks_up() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("22222222-aaaa-0000-0000-000000000008".into());

    w.storage.add_vdi("root-disk", "/dev/sm/backend/7");
    let domid = w.engine.create(&task, &vm, &pv_spec("guest")).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();

    let device = w
        .engine
        .vbd_plug(
            &task,
            &vm,
            &vbd("disk-0", 0, Some(DiskSource::Vdi("root-disk".into()))),
        )
        .unwrap();
    assert_eq!(device, "xvda");
    assert_eq!(w.storage.active_count(), 1);

    // The frontend's private path carries the logical id.
    let devid = 202 << 8;
    assert_eq!(
        w.store
            .read(&format!("/private/{}/vbd/{}/vbd-id", domid, devid))
            .unwrap(),
        "disk-0"
    );
    let state = w
        .engine
        .device_state(&vm, domctl::devices::DeviceKind::Vbd, "disk-0")
        .unwrap();
    assert!(state.plugged);
    assert_eq!(state.device.as_deref(), Some("xvda"));

    // A second plug under the same id is refused.
    assert_eq!(
        w.engine
            .vbd_plug(
                &task,
                &vm,
                &vbd("disk-0", 1, Some(DiskSource::Vdi("root-disk".into())))
            )
            .unwrap_err(),
        Error::AlreadyExists
    );
}

#[test]
fn test_destroy_reclaims_devices_and_record() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("33333333-aaaa-0000-0000-000000000009".into());

    w.storage.add_vdi("root-disk", "/dev/sm/backend/7");
    let domid = w.engine.create(&task, &vm, &pv_spec("guest")).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();
    w.engine
        .vbd_plug(
            &task,
            &vm,
            &vbd("disk-0", 0, Some(DiskSource::Vdi("root-disk".into()))),
        )
        .unwrap();

    let _backend = SimBackendAgent::spawn(w.store.clone());
    w.engine.destroy(&task, &vm, false).unwrap();

    assert!(!w.hv.exists(domid));
    assert_eq!(w.storage.active_count(), 0);
    assert_eq!(w.storage.attached_count(), 0);
    assert!(w.store.read(&format!("/local/domain/{}", domid)).is_err());
    assert_eq!(
        w.engine.get_state(&vm).unwrap().power_state,
        PowerState::Absent
    );
    assert_eq!(w.dm.state_of(domid), Some(SimDmState::Stopped));
}

#[test]
fn test_reboot_reenters_create_and_build() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("44444444-aaaa-0000-0000-00000000000a".into());

    let domid = w.engine.create(&task, &vm, &pv_spec("guest")).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();
    w.hv.mark_shutdown(domid, ShutdownReason::Reboot);
    assert_eq!(
        w.engine.get_domain_action_request(&vm).unwrap(),
        Some(domctl::lifecycle::ActionRequest::Reboot)
    );

    w.engine.destroy(&task, &vm, true).unwrap();
    // The record went with the non-suspend shutdown; reboot is driven from
    // the exported state the orchestrator holds.
    assert_eq!(
        w.engine.get_state(&vm).unwrap().power_state,
        PowerState::Absent
    );
}

#[test]
fn test_on_reboot_rebuilds_domain() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("88888888-aaaa-0000-0000-00000000000e".into());

    let domid = w.engine.create(&task, &vm, &pv_spec("guest")).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();
    // The guest rebooted and the domain went away on its own.
    w.hv.mark_shutdown(domid, ShutdownReason::Reboot);
    w.hv.domain_destroy(domid).unwrap();

    let domid2 = w.engine.on_reboot(&task, &vm).unwrap();
    assert_ne!(domid, domid2);
    assert_eq!(
        w.engine.get_state(&vm).unwrap().power_state,
        PowerState::Running
    );
}

#[test]
fn test_bad_cpuid_template_fails_before_hypervisor_calls() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("55555555-aaaa-0000-0000-00000000000b".into());

    let mut spec = pv_spec("guest");
    spec.cpuid = vec![domctl::cpuid::LeafPolicy {
        leaf: 1,
        subleaf: None,
        eax: Some("not a template".into()),
        ..Default::default()
    }];
    let domid = w.engine.create(&task, &vm, &spec).unwrap();
    assert_eq!(
        w.engine.build(&task, &vm, &[], &[]),
        Err(Error::BadCpuidTemplate)
    );
    assert!(!w.hv.cpuid_applied(domid));
    // The domain was created but never built.
    assert!(w
        .store
        .read(&format!("/local/domain/{}/store/ring-ref", domid))
        .is_err());
}

#[test]
fn test_suspend_keeps_record_and_flushes_devices() {
    let w = world();
    let task = TaskHandle::new("t");
    let vm = VmId("66666666-aaaa-0000-0000-00000000000c".into());

    w.storage.add_vdi("root-disk", "/dev/sm/backend/7");
    let domid = w.engine.create(&task, &vm, &pv_spec("guest")).unwrap();
    w.engine.build(&task, &vm, &[], &[]).unwrap();
    w.engine
        .vbd_plug(
            &task,
            &vm,
            &vbd("disk-0", 0, Some(DiskSource::Vdi("root-disk".into()))),
        )
        .unwrap();

    let _guest = SimGuestAgent::spawn(w.store.clone(), w.hv.clone(), domid);
    let _backend = SimBackendAgent::spawn(w.store.clone());
    w.engine.suspend(&task, &vm).unwrap();

    // Devices flushed: every disk deactivated, backends acknowledged.
    assert_eq!(w.storage.active_count(), 0);
    assert!(w.engine.get_state(&vm).unwrap().suspend_memory_bytes > 0);
}

#[test]
fn test_rpc_dispatch_round_trip() {
    let w = world();
    let dispatcher = Dispatcher::new(w.engine.clone(), 16);
    let vm = "77777777-aaaa-0000-0000-00000000000d";

    let create = Request {
        method: "VM.create".into(),
        params: serde_json::json!({ "vm": vm, "spec": pv_spec("guest") }),
    };
    let domid = match dispatcher.handle(create) {
        Response::Success(domid) => domid,
        Response::Failure(e) => panic!("create failed: {}", e),
    };
    assert!(domid.is_number());

    let build = Request {
        method: "VM.build".into(),
        params: serde_json::json!({ "vm": vm }),
    };
    assert!(matches!(dispatcher.handle(build), Response::Success(_)));

    let state = Request {
        method: "VM.get_state".into(),
        params: serde_json::json!({ "vm": vm }),
    };
    let state = match dispatcher.handle(state) {
        Response::Success(state) => state,
        Response::Failure(e) => panic!("get_state failed: {}", e),
    };
    assert_eq!(state.get("power_state").and_then(|p| p.as_str()), Some("Running"));

    let missing = Request {
        method: "VM.get_internal_state".into(),
        params: serde_json::json!({ "vm": "00000000-0000-0000-0000-00000000dead" }),
    };
    assert_eq!(
        dispatcher.handle(missing),
        Response::Failure(Error::DoesNotExist)
    );

    let unknown = Request {
        method: "VM.frobnicate".into(),
        params: serde_json::Value::Null,
    };
    assert!(matches!(dispatcher.handle(unknown), Response::Failure(_)));
}
