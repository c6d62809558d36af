// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-VM lifecycle engine.
//!
//! Drives a guest through create, build, device plug, run,
//! shutdown/suspend/resume/reboot and destroy, keeping the hypervisor, the
//! control tree, the memory broker, the storage daemon and the device
//! model consistent with the persistent record across partial failures.
//! Every path that acquires a host resource either hands it over or gives
//! it back before returning an error.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::builder_helper::{
    check_save_magic, read_dm_record, write_dm_record, write_save_magic, BuildSpec, DomainBuilder,
    HelperError,
};
use crate::config::DaemonConfig;
use crate::cpuid;
use crate::devices::dm::{DmConfig, DmDisk, DmDisplay, DmNic, DmSupervisor};
use crate::devices::vif::NetworkKind;
use crate::devices::{self, pci, vbd, vif, DeviceKind};
use crate::hypervisor::{CreateFlags, DomInfo, HypervisorControl, ShutdownReason};
use crate::iface::Interface;
use crate::memory_broker::CachedBroker;
use crate::persist::{
    BuildInfo, BuildPlan, ExtraStore, VmExtra,
};
use crate::storage::{DiskSource, StorageService};
use crate::store::{paths, read_opt, Perm, Perms, Store, StoreError};
use crate::task::TaskHandle;
use crate::units::{bytes_to_kib, bytes_to_mib, kib_to_bytes, mib_to_kib, pages_to_bytes};
use crate::updates::{Update, UpdateBus};
use crate::{DomId, Error, Result, VmId};

const SHUTDOWN_ACK_POLL: Duration = Duration::from_millis(20);
const GUEST_GONE_POLL: Duration = Duration::from_millis(50);

/// Everything the caller supplies to bring a VM into existence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Creation parameters.
    pub create_info: crate::persist::CreateInfo,
    /// VCPU count.
    pub vcpus: u32,
    /// Shadow page-table multiplier.
    pub shadow_multiplier: f64,
    /// Static maximum memory in bytes.
    pub memory_static_max: u64,
    /// Dynamic memory floor in bytes.
    pub memory_dynamic_min: u64,
    /// Dynamic memory ceiling in bytes.
    pub memory_dynamic_max: u64,
    /// How to build the guest.
    pub build_plan: BuildPlan,
    /// CPUID masking policy.
    pub cpuid: Vec<cpuid::LeafPolicy>,
}

/// Coarse power state reported to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    /// No record and no domain.
    Absent,
    /// A record exists but no domain is resident.
    Halted,
    /// A resumable suspend image exists and no domain is resident.
    Suspended,
    /// A domain is resident.
    Running,
    /// The domain has shut down but is still resident.
    Shutdown(Option<ShutdownReason>),
}

/// Snapshot of a VM's state for `VM.get_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStateInfo {
    /// Power state.
    pub power_state: PowerState,
    /// Resident domain id, when one exists.
    pub domid: Option<DomId>,
    /// Bytes of the resumable suspend image, 0 when none.
    pub suspend_memory_bytes: u64,
    /// VCPU count from the record.
    pub vcpus: u32,
    /// Seconds since the epoch of the last domain creation.
    pub last_create_time: u64,
}

/// Plug state of one device, for the `*.get_state` RPCs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateInfo {
    /// The device has live tree records.
    pub plugged: bool,
    /// Guest-facing name, when plugged.
    pub device: Option<String>,
    /// For removable devices, whether the medium is out.
    pub media_ejected: Option<bool>,
}

/// What the guest asked for by shutting down; the orchestrator reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionRequest {
    /// Recreate and boot the guest again.
    Reboot,
    /// Tear the guest down.
    Poweroff,
    /// The guest rendezvoused with a suspend.
    Suspend,
    /// The guest crashed.
    Crash,
}

/// Shadow page-table allocation for an HVM guest, in MiB.
pub fn shadow_mib(static_max_mib: u64, vcpus: u32, multiplier: f64) -> u64 {
    let pages = multiplier * (f64::from(vcpus) * 0.25 + static_max_mib as f64 / 256.0);
    (pages.ceil() as u64).max(1)
}

/// Ballooning overhead in bytes for the guest flavor.
pub fn overhead_bytes(hvm: bool, static_max_bytes: u64, vcpus: u32, multiplier: f64) -> u64 {
    let mib = if hvm {
        shadow_mib(bytes_to_mib(static_max_bytes), vcpus, multiplier) + 2
    } else {
        1
    };
    kib_to_bytes(mib_to_kib(mib))
}

/// Sentinel handle stamped on a domain that would not die.
pub fn dying_sentinel(domid: DomId) -> String {
    format!("deadbeef-dead-beef-dead-beef0000{:04x}", domid.0)
}

/// The engine. One instance per host; per-VM serialization is provided by
/// the work queues in front of it.
pub struct Engine {
    cfg: DaemonConfig,
    store: Arc<dyn Store>,
    hv: Arc<dyn HypervisorControl>,
    broker: Arc<CachedBroker>,
    storage: Arc<dyn StorageService>,
    builder: Arc<dyn DomainBuilder>,
    dm: Arc<dyn DmSupervisor>,
    extras: ExtraStore,
    updates: Arc<UpdateBus>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state_root", &self.cfg.state_root)
            .finish()
    }
}

impl Engine {
    /// Wires an engine against its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: DaemonConfig,
        store: Arc<dyn Store>,
        hv: Arc<dyn HypervisorControl>,
        broker: Arc<CachedBroker>,
        storage: Arc<dyn StorageService>,
        builder: Arc<dyn DomainBuilder>,
        dm: Arc<dyn DmSupervisor>,
        updates: Arc<UpdateBus>,
    ) -> Result<Self> {
        let extras = ExtraStore::new(&cfg.state_root)?;
        Ok(Engine {
            cfg,
            store,
            hv,
            broker,
            storage,
            builder,
            dm,
            extras,
            updates,
        })
    }

    /// The update bus fed by this engine.
    pub fn updates(&self) -> &Arc<UpdateBus> {
        &self.updates
    }

    /// The persistent record store.
    pub fn extras(&self) -> &ExtraStore {
        &self.extras
    }

    fn load_extra(&self, vm: &VmId) -> Result<VmExtra> {
        self.extras.read(vm)?.ok_or(Error::DoesNotExist)
    }

    fn live_domain(&self, vm: &VmId, extra: &VmExtra) -> Option<DomInfo> {
        self.hv
            .domain_getinfo(extra.domid)
            .ok()
            .filter(|info| info.uuid == vm.0)
    }

    // ---- create -----------------------------------------------------------

    /// Creates the domain shell: reserves memory, creates the hypervisor
    /// domain, transfers the reservation, and lays out the control tree.
    pub fn create(&self, task: &TaskHandle, vm: &VmId, spec: &VmSpec) -> Result<DomId> {
        task.check_cancel()?;
        self.cfg.validate_keys(
            "platformdata",
            crate::config::RECOGNIZED_PLATFORM_KEYS,
            spec.create_info.platformdata.keys().map(String::as_str),
        )?;

        let mut extra = match self.extras.read(vm)? {
            Some(existing) => {
                if self.live_domain(vm, &existing).is_some() {
                    return Err(Error::AlreadyExists);
                }
                let mut extra = existing;
                // Refresh the caller-controlled parts of the record.
                extra.create_info = spec.create_info.clone();
                extra.plan = spec.build_plan.clone();
                extra.vcpus = spec.vcpus;
                extra.shadow_multiplier = spec.shadow_multiplier;
                extra.memory_static_max = spec.memory_static_max;
                extra.memory_dynamic_min = spec.memory_dynamic_min;
                extra.memory_dynamic_max = spec.memory_dynamic_max;
                extra.cpuid = spec.cpuid.clone();
                extra
            }
            None => VmExtra {
                domid: DomId(0),
                create_info: spec.create_info.clone(),
                plan: spec.build_plan.clone(),
                build_info: None,
                vcpus: spec.vcpus,
                shadow_multiplier: spec.shadow_multiplier,
                memory_static_max: spec.memory_static_max,
                memory_dynamic_min: spec.memory_dynamic_min,
                memory_dynamic_max: spec.memory_dynamic_max,
                suspend_memory_bytes: 0,
                ty: None,
                vbds: Vec::new(),
                vifs: Vec::new(),
                pcis: Vec::new(),
                cpuid: spec.cpuid.clone(),
                last_create_time: 0,
            },
        };

        let overhead = overhead_bytes(
            spec.create_info.hvm,
            spec.memory_static_max,
            spec.vcpus,
            spec.shadow_multiplier,
        );
        // A resumable image pins the target range to exactly its size.
        let (min_bytes, max_bytes) = if extra.suspend_memory_bytes != 0 {
            (extra.suspend_memory_bytes, extra.suspend_memory_bytes)
        } else {
            (
                spec.memory_dynamic_min + overhead,
                spec.memory_dynamic_max + overhead,
            )
        };

        let created = self.broker.with_reservation(
            task,
            bytes_to_kib(min_bytes),
            bytes_to_kib(max_bytes),
            |reservation| {
                let domid = self.hv.domain_create(
                    spec.create_info.ssidref,
                    CreateFlags {
                        hvm: spec.create_info.hvm,
                        hap: spec.create_info.hap,
                    },
                    vm.as_str(),
                )?;
                let granted_bytes = kib_to_bytes(reservation.amount_kib());
                let finish = (|| -> Result<DomId> {
                    extra.domid = domid;
                    extra.touch_create_time();
                    self.extras.write(vm, &extra)?;
                    reservation.transfer(domid)?;
                    let initial_target = spec
                        .memory_dynamic_max
                        .min(granted_bytes.saturating_sub(overhead));
                    self.make_domain_tree(vm, domid, spec, initial_target)?;
                    self.prepare_domain(domid, spec)?;
                    Ok(domid)
                })();
                if finish.is_err() {
                    // Anything transferred is reclaimed with the domain;
                    // an unconsumed reservation is released by the scope.
                    if let Err(e) = self.hv.domain_destroy(domid) {
                        warn!("cleanup destroy of half-created {} failed: {}", domid, e);
                    }
                }
                finish
            },
        )?;

        info!("created domain {} for {}", created, vm);
        self.updates.push(Update::Vm(vm.clone()));
        Ok(created)
    }

    fn make_domain_tree(
        &self,
        vm: &VmId,
        domid: DomId,
        spec: &VmSpec,
        initial_target_bytes: u64,
    ) -> Result<()> {
        let dom = paths::domain(domid);
        let vm_path = paths::vm(vm);
        let static_max_kib = bytes_to_kib(spec.memory_static_max).to_string();
        let dynamic_min_kib = bytes_to_kib(spec.memory_dynamic_min).to_string();
        let target_kib = bytes_to_kib(initial_target_bytes).to_string();
        self.store.transaction(&mut |tx| {
            tx.write(&format!("{}/vm", dom), &vm_path)?;
            tx.write(&format!("{}/vss", dom), "")?;
            tx.write(&format!("{}/name", dom), &spec.create_info.name)?;
            tx.write(&format!("{}/domid", dom), &domid.to_string())?;
            for dir in [
                "device", "error", "drivers", "control", "attr", "data", "messages", "cpu",
                "platform",
            ] {
                tx.mkdir(&format!("{}/{}", dom, dir))?;
            }
            tx.write(&format!("{}/memory/static-max", dom), &static_max_kib)?;
            tx.write(&format!("{}/memory/dynamic-min", dom), &dynamic_min_kib)?;
            tx.write(&format!("{}/memory/initial-target", dom), &target_kib)?;
            tx.write(&format!("{}/memory/target", dom), &target_kib)?;
            tx.write(&format!("{}/control/shutdown", dom), "")?;
            tx.write(&format!("{}/control/sysrq", dom), "")?;
            tx.write(
                &format!("{}/control/platform-feature-multiprocessor-suspend", dom),
                "1",
            )?;
            for (key, value) in &spec.create_info.xsdata {
                tx.write(&format!("{}/{}", dom, key), value)?;
            }
            for (key, value) in &spec.create_info.platformdata {
                tx.write(&format!("{}/platform/{}", dom, key), value)?;
            }
            tx.write(&format!("{}/uuid", vm_path), vm.as_str())?;
            tx.write(&format!("{}/name", vm_path), &spec.create_info.name)?;
            tx.write(&format!("{}/domains/{}", vm_path, domid), &dom)?;

            // Guest-readable then guest-writable subtrees.
            for dir in ["cpu", "memory", "platform", "vm", "vss"] {
                tx.setperms(
                    &format!("{}/{}", dom, dir),
                    &Perms {
                        owner: domid,
                        others: Perm::Read,
                    },
                )?;
            }
            for dir in [
                "device", "error", "drivers", "control", "attr", "data", "messages",
            ] {
                tx.setperms(
                    &format!("{}/{}", dom, dir),
                    &Perms {
                        owner: domid,
                        others: Perm::ReadWrite,
                    },
                )?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn prepare_domain(&self, domid: DomId, spec: &VmSpec) -> Result<()> {
        let platform = &spec.create_info.platformdata;
        if platform
            .get("suppress-spurious-page-faults")
            .is_some_and(|v| v == "1" || v == "true")
        {
            self.hv.domain_suppress_spurious_page_faults(domid)?;
        }
        if let Some(bits) = platform
            .get("machine-address-size")
            .and_then(|v| v.parse::<u32>().ok())
        {
            self.hv.domain_set_machine_address_size(domid, bits)?;
        }
        if let Some(mask) = platform
            .get("vcpu-mask")
            .and_then(|v| u64::from_str_radix(v.trim_start_matches("0x"), 16).ok())
        {
            for vcpu in 0..spec.vcpus {
                self.hv.vcpu_affinity_set(domid, vcpu, mask)?;
            }
        }
        self.hv
            .domain_setmaxmem(domid, bytes_to_kib(spec.memory_static_max))?;
        self.hv
            .domain_set_memmap_limit(domid, bytes_to_kib(spec.memory_static_max))?;
        self.hv.domain_max_vcpus(domid, spec.vcpus)?;
        devices::add_vcpus(&*self.store, domid, spec.vcpus)?;

        let dom = paths::domain(domid);
        let store_port = self.hv.evtchn_alloc_unbound(domid, DomId(0))?;
        let console_port = self.hv.evtchn_alloc_unbound(domid, DomId(0))?;
        self.store
            .write(&format!("{}/store/port", dom), &store_port.to_string())?;
        self.store
            .write(&format!("{}/console/port", dom), &console_port.to_string())?;
        Ok(())
    }

    // ---- build ------------------------------------------------------------

    /// Builds the created domain: runs the flavor-specific builder and
    /// publishes the ring references, then persists the build snapshot.
    pub fn build(
        &self,
        task: &TaskHandle,
        vm: &VmId,
        vbds: &[vbd::VbdSpec],
        vifs: &[vif::VifSpec],
    ) -> Result<()> {
        let mut extra = self.load_extra(vm)?;
        let domid = extra.domid;
        // Validate the whole CPUID policy before any hypervisor call.
        let parsed_policy = cpuid::parse_policy(&extra.cpuid)?;
        if self.live_domain(vm, &extra).is_none() {
            return Err(Error::DoesNotExist);
        }

        let dom = paths::domain(domid);
        let target_kib: u64 = self
            .store
            .read(&format!("{}/memory/initial-target", dom))?
            .parse()
            .map_err(|_| Error::InternalError("unparseable initial-target".into()))?;
        let static_max_kib = bytes_to_kib(extra.memory_static_max);

        let hvm = extra.create_info.hvm;
        let requested_shadow = shadow_mib(
            bytes_to_mib(extra.memory_static_max),
            extra.vcpus,
            extra.shadow_multiplier,
        );
        if hvm {
            self.hv.shadow_allocation_set(domid, requested_shadow)?;
        }

        let plan = extra.plan.clone();

        let (build_spec, _extracted) = self.assemble_build_spec(
            task,
            vm,
            &extra,
            &plan,
            vbds,
            static_max_kib,
            target_kib,
        )?;

        task.check_cancel()?;
        let outcome = self.builder.build(task, domid, &build_spec)?;
        debug!(
            "built {} as domain {}: store_mfn={} console_mfn={} protocol={}",
            vm, domid, outcome.store_mfn, outcome.console_mfn, outcome.protocol
        );

        let timeoffset = match &plan {
            BuildPlan::Hvm(params) => params.timeoffset.clone(),
            _ => String::new(),
        };
        let rtc_path = paths::rtc_timeoffset(vm);
        self.store.transaction(&mut |tx| {
            tx.write(
                &format!("{}/store/ring-ref", dom),
                &outcome.store_mfn.to_string(),
            )?;
            tx.write(
                &format!("{}/console/ring-ref", dom),
                &outcome.console_mfn.to_string(),
            )?;
            tx.write(
                &format!("{}/memory/static-max", dom),
                &static_max_kib.to_string(),
            )?;
            tx.write(&format!("{}/memory/target", dom), &target_kib.to_string())?;
            tx.write(&format!("/private/{}/protocol", domid), &outcome.protocol)?;
            if !timeoffset.is_empty() {
                tx.write(&rtc_path, &timeoffset)?;
            }
            Ok(())
        })?;

        if hvm {
            self.revert_shadow_reduction(domid, requested_shadow)?;
        }

        extra.build_info = Some(BuildInfo {
            memory_max_kib: static_max_kib,
            memory_target_kib: target_kib,
            vcpus: extra.vcpus,
            plan: plan.clone(),
        });
        extra.ty = Some(plan.flavor());
        extra.vbds = vbds.to_vec();
        extra.vifs = vifs.to_vec();
        self.extras.write(vm, &extra)?;

        for (leaf, subleaf, masks) in &parsed_policy {
            self.hv.domain_cpuid_set(domid, *leaf, *subleaf, masks)?;
        }
        if !parsed_policy.is_empty() {
            self.hv.domain_cpuid_apply(domid)?;
        }

        self.updates.push(Update::Vm(vm.clone()));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_build_spec(
        &self,
        task: &TaskHandle,
        vm: &VmId,
        extra: &VmExtra,
        plan: &BuildPlan,
        vbds: &[vbd::VbdSpec],
        static_max_kib: u64,
        target_kib: u64,
    ) -> Result<(BuildSpec, Option<ExtractedFiles>)> {
        let base = BuildSpec {
            hvm: extra.create_info.hvm,
            mem_max_kib: static_max_kib,
            mem_target_kib: target_kib,
            kernel: PathBuf::new(),
            ramdisk: None,
            cmdline: String::new(),
            vcpus: extra.vcpus,
            flags: Vec::new(),
        };
        match plan {
            BuildPlan::Hvm(params) => Ok((
                BuildSpec {
                    kernel: self.cfg.hvm_loader.clone(),
                    flags: vec![
                        ("pae".into(), u32::from(params.pae).to_string()),
                        ("apic".into(), u32::from(params.apic).to_string()),
                        ("acpi".into(), u32::from(params.acpi).to_string()),
                        ("nx".into(), u32::from(params.nx).to_string()),
                        ("viridian".into(), u32::from(params.viridian).to_string()),
                        ("timeoffset".into(), params.timeoffset.clone()),
                        (
                            "shadow-multiplier".into(),
                            format!("{}", params.shadow_multiplier),
                        ),
                    ],
                    ..base
                },
                None,
            )),
            BuildPlan::DirectPv(params) => Ok((
                BuildSpec {
                    kernel: params.kernel.clone(),
                    ramdisk: params.ramdisk.clone(),
                    cmdline: params.cmdline.clone(),
                    ..base
                },
                None,
            )),
            BuildPlan::IndirectPv(params) => {
                let boot_vbd = vbds
                    .iter()
                    .find(|v| v.id == params.boot_disk)
                    .or_else(|| vbds.first())
                    .ok_or(Error::NoBootableDevice)?;
                let disk = boot_vbd.disk.clone().ok_or(Error::NoBootableDevice)?;
                let dp_id = format!("bootloader/{}/{}", vm, boot_vbd.id);
                let (output, extracted) = crate::storage::with_disk(
                    &*self.storage,
                    task,
                    &dp_id,
                    &disk,
                    false,
                    |path| self.run_bootloader(params, path),
                )?;
                Ok((
                    BuildSpec {
                        kernel: output.kernel.clone(),
                        ramdisk: output.ramdisk.clone(),
                        cmdline: output.cmdline,
                        ..base
                    },
                    Some(extracted),
                ))
            }
        }
    }

    fn run_bootloader(
        &self,
        params: &crate::persist::IndirectPvParams,
        disk: &Path,
    ) -> Result<(BootloaderOutput, ExtractedFiles)> {
        let run = Command::new(&self.cfg.bootloader_binary)
            .arg(&params.bootloader)
            .args(params.extra_args.split_whitespace())
            .arg(disk)
            .output()
            .map_err(|e| Error::BootloaderError(params.bootloader.clone(), e.to_string()))?;
        if !run.status.success() {
            return Err(Error::BootloaderError(
                params.bootloader.clone(),
                String::from_utf8_lossy(&run.stderr).into_owned(),
            ));
        }
        let output = parse_bootloader_output(&String::from_utf8_lossy(&run.stdout))
            .ok_or_else(|| {
                Error::BootloaderError(params.bootloader.clone(), "unparseable output".into())
            })?;
        let mut extracted = ExtractedFiles(vec![output.kernel.clone()]);
        if let Some(ramdisk) = &output.ramdisk {
            extracted.0.push(ramdisk.clone());
        }
        Ok((output, extracted))
    }

    fn revert_shadow_reduction(&self, domid: DomId, requested_mib: u64) -> Result<()> {
        let actual = self.hv.shadow_allocation_get(domid)?;
        if actual < requested_mib {
            warn!(
                "shadow allocation for {} came back {} MiB instead of {} MiB, restoring",
                domid, actual, requested_mib
            );
            self.hv.shadow_allocation_set(domid, requested_mib)?;
            let after = self.hv.shadow_allocation_get(domid)?;
            if after < requested_mib {
                warn!(
                    "shadow allocation for {} still {} MiB after restore, continuing",
                    domid, after
                );
            }
        }
        Ok(())
    }

    // ---- pause / unpause ---------------------------------------------------

    /// Pauses the domain's VCPUs.
    pub fn pause(&self, task: &TaskHandle, vm: &VmId) -> Result<()> {
        task.check_cancel()?;
        let extra = self.load_extra(vm)?;
        self.hv.domain_pause(extra.domid)?;
        self.updates.push(Update::Vm(vm.clone()));
        Ok(())
    }

    /// Unpauses the domain's VCPUs; the guest starts executing.
    pub fn unpause(&self, task: &TaskHandle, vm: &VmId) -> Result<()> {
        task.check_cancel()?;
        let extra = self.load_extra(vm)?;
        if extra.build_info.is_none() {
            return Err(Error::DomainNotBuilt);
        }
        self.hv.domain_unpause(extra.domid)?;
        self.updates.push(Update::Vm(vm.clone()));
        Ok(())
    }

    // ---- shutdown ----------------------------------------------------------

    /// Writes the shutdown request and, for a cooperating guest, waits for
    /// the acknowledgement. Returns whether the guest acknowledged; it is
    /// never assumed to be gone.
    pub fn request_shutdown(
        &self,
        task: &TaskHandle,
        vm: &VmId,
        reason: ShutdownReason,
        ack_timeout: Duration,
    ) -> Result<bool> {
        let extra = self.load_extra(vm)?;
        let domid = extra.domid;
        let info = self
            .live_domain(vm, &extra)
            .ok_or(Error::DoesNotExist)?;
        let request = reason.as_request_str().ok_or(Error::NotSupported)?;

        let dom = paths::domain(domid);
        let cooperating = !info.hvm_guest
            || read_opt(&*self.store, &format!("{}/control/feature-shutdown", dom))?
                .is_some_and(|v| v == "1");
        if !cooperating {
            // No PV drivers to hear the request; have the hypervisor do it.
            self.hv.domain_shutdown(domid, reason)?;
            return Ok(true);
        }

        let shutdown_path = format!("{}/control/shutdown", dom);
        self.store.write(&shutdown_path, request)?;
        let deadline = Instant::now() + ack_timeout;
        loop {
            task.check_cancel()?;
            if ack_cleared(read_opt(&*self.store, &shutdown_path)?) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                debug!("{} did not acknowledge {} in time", vm, request);
                return Ok(false);
            }
            std::thread::sleep(SHUTDOWN_ACK_POLL);
        }
    }

    fn wait_domain_shutdown(&self, task: &TaskHandle, vm: &VmId, budget: Duration) -> Result<()> {
        let extra = self.load_extra(vm)?;
        let deadline = Instant::now() + budget;
        loop {
            task.check_cancel()?;
            match self.hv.domain_getinfo(extra.domid) {
                Ok(info) if info.uuid == vm.0 && !info.shutdown => (),
                // Shut down, or already gone.
                _ => return Ok(()),
            }
            if Instant::now() >= deadline {
                return Err(Error::InternalError(format!(
                    "{} did not shut down within {:?}",
                    vm, budget
                )));
            }
            std::thread::sleep(GUEST_GONE_POLL);
        }
    }

    // ---- suspend -----------------------------------------------------------

    /// Suspends the guest into its image file and flushes its devices.
    pub fn suspend(&self, task: &TaskHandle, vm: &VmId) -> Result<()> {
        let mut extra = self.load_extra(vm)?;
        if extra.build_info.is_none() {
            return Err(Error::DomainNotBuilt);
        }
        let domid = extra.domid;
        let hvm = extra.create_info.hvm;
        self.live_domain(vm, &extra).ok_or(Error::DoesNotExist)?;

        let image_path = self.extras.suspend_image_path(vm);
        let result = (|| -> Result<u64> {
            let mut image = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&image_path)?;
            write_save_magic(&mut image)?;

            let engine = self;
            let save_task = task.clone();
            self.builder.save(task, domid, hvm, &image, &mut || {
                // The helper is ready: ask the guest to suspend and wait
                // for it to rendezvous.
                let acked = engine
                    .request_shutdown(
                        &save_task,
                        vm,
                        ShutdownReason::Suspend,
                        engine.cfg.shutdown_ack_delay(),
                    )
                    .map_err(|e| HelperError::Protocol(e.to_string()))?;
                if !acked {
                    debug!("{} has not acknowledged suspend yet, waiting anyway", vm);
                }
                engine
                    .wait_domain_shutdown(&save_task, vm, engine.cfg.suspend_budget())
                    .map_err(|e| match e {
                        Error::Cancelled => HelperError::Cancelled,
                        other => HelperError::Protocol(other.to_string()),
                    })
            })?;

            if hvm {
                let blob = self.dm.suspend(task, domid)?;
                let mut image = OpenOptions::new().append(true).open(&image_path)?;
                write_dm_record(&mut image, &blob)?;
                image.sync_all()?;
            }

            let final_pages = self.hv.domain_getinfo(domid)?.total_memory_pages;
            Ok(pages_to_bytes(final_pages))
        })();

        let suspend_bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                // A half-written image is worse than none.
                let _ = std::fs::remove_file(&image_path);
                return Err(e);
            }
        };

        extra.suspend_memory_bytes = suspend_bytes;
        self.extras.write(vm, &extra)?;
        info!(
            "suspended {} with {} bytes of guest memory",
            vm, suspend_bytes
        );

        self.flush_vbds(task, vm, &extra)?;
        self.updates.push(Update::Vm(vm.clone()));
        Ok(())
    }

    // Hard-shutdown every plugged VBD in parallel, then deactivate each
    // attached disk.
    fn flush_vbds(&self, task: &TaskHandle, vm: &VmId, extra: &VmExtra) -> Result<()> {
        let domid = extra.domid;
        let mut devids = Vec::new();
        for spec in &extra.vbds {
            if let Some(devid) =
                devices::lookup_device(&*self.store, domid, DeviceKind::Vbd, &spec.id)?
            {
                devids.push(devid);
            }
        }
        vbd::hard_shutdown_all(
            &*self.store,
            task,
            domid,
            &devids,
            self.cfg.device_shutdown_timeout(),
        )?;
        for spec in &extra.vbds {
            if let Some(DiskSource::Vdi(name)) = &spec.disk {
                if let Err(e) = self.deactivate_vdi(vm, &spec.id, name) {
                    warn!("failed to deactivate {} for {}: {}", name, vm, e);
                }
            }
        }
        Ok(())
    }

    fn vbd_datapath(vm: &VmId, vbd_id: &str) -> String {
        format!("vbd/{}/{}", vm, vbd_id)
    }

    fn deactivate_vdi(&self, vm: &VmId, vbd_id: &str, name: &str) -> Result<()> {
        let (sr, vdi) = self.storage.get_by_name(name)?;
        let dp = self
            .storage
            .dp_create(&Self::vbd_datapath(vm, vbd_id), "lifecycle-engine")?;
        self.storage.vdi_deactivate(&dp, &sr, &vdi)?;
        Ok(())
    }

    // ---- restore -----------------------------------------------------------

    /// Restores a suspended guest into its freshly created domain.
    pub fn restore(&self, task: &TaskHandle, vm: &VmId) -> Result<()> {
        let image_path = self.extras.suspend_image_path(vm);
        self.restore_from(task, vm, &image_path, true)
    }

    /// Restores guest memory from an arbitrary image file (the incoming
    /// side of a migration-like transfer).
    pub fn receive_memory(&self, task: &TaskHandle, vm: &VmId, image: &Path) -> Result<()> {
        self.restore_from(task, vm, image, false)
    }

    fn restore_from(
        &self,
        task: &TaskHandle,
        vm: &VmId,
        image_path: &Path,
        consume: bool,
    ) -> Result<()> {
        let mut extra = self.load_extra(vm)?;
        let info = extra.build_info.clone().ok_or(Error::DomainNotBuilt)?;
        let domid = extra.domid;
        let hvm = extra.create_info.hvm;
        self.live_domain(vm, &extra).ok_or(Error::DoesNotExist)?;

        let mut image = File::open(image_path).map_err(|_| Error::DoesNotExist)?;
        check_save_magic(&mut image)?;

        let target_kib = if extra.suspend_memory_bytes != 0 {
            bytes_to_kib(extra.suspend_memory_bytes)
        } else {
            info.memory_target_kib
        };
        let spec = BuildSpec {
            hvm,
            mem_max_kib: info.memory_max_kib,
            mem_target_kib: target_kib,
            kernel: PathBuf::new(),
            ramdisk: None,
            cmdline: String::new(),
            vcpus: info.vcpus,
            flags: Vec::new(),
        };
        task.check_cancel()?;
        let outcome = self.builder.restore(task, domid, &spec, &image)?;

        if hvm {
            let blob = read_dm_record(&mut image)?;
            let cfg = self.dm_config(&extra)?;
            self.dm.restore(task, domid, &cfg, &blob)?;
        }

        let dom = paths::domain(domid);
        self.store.transaction(&mut |tx| {
            tx.write(
                &format!("{}/store/ring-ref", dom),
                &outcome.store_mfn.to_string(),
            )?;
            tx.write(
                &format!("{}/console/ring-ref", dom),
                &outcome.console_mfn.to_string(),
            )?;
            tx.write(&format!("{}/memory/target", dom), &target_kib.to_string())?;
            Ok(())
        })?;

        if consume {
            // The image is spent: a crash from here resumes from nothing.
            let _ = std::fs::remove_file(image_path);
            extra.suspend_memory_bytes = 0;
            self.extras.write(vm, &extra)?;
        }

        info!("restored {} into domain {}", vm, domid);
        self.updates.push(Update::Vm(vm.clone()));
        Ok(())
    }

    // ---- destroy -----------------------------------------------------------

    /// Destroys the domain and reclaims every host-side resource. The
    /// persistent record survives only a suspend-shutdown.
    pub fn destroy(&self, task: &TaskHandle, vm: &VmId, preserve_vm_path: bool) -> Result<()> {
        let extra = self.load_extra(vm)?;
        let domid = extra.domid;
        let info = self.live_domain(vm, &extra);
        let suspended = info
            .as_ref()
            .and_then(DomInfo::shutdown_reason)
            .map_or(extra.suspend_memory_bytes != 0, |r| {
                r == ShutdownReason::Suspend
            });

        if info.is_some() {
            if let Err(e) = self.hv.domain_destroy(domid) {
                warn!("destroy of {} failed: {}", domid, e);
            }
        }
        if let Err(e) = self.dm.stop(domid) {
            warn!("stopping device model for {} failed: {}", domid, e);
        }

        // Best-effort device teardown; one failure must not strand the
        // rest.
        let mut failures: Vec<String> = Vec::new();
        self.teardown_devices(task, vm, &extra, &mut failures);

        let dom = paths::domain(domid);
        let cleanup = self.store.transaction(&mut |tx| {
            for path in [dom.clone(), format!("/private/{}", domid)] {
                match tx.rm(&path) {
                    Ok(()) | Err(StoreError::NotFound(_)) => (),
                    Err(e) => return Err(e),
                }
            }
            if !preserve_vm_path {
                match tx.rm(&paths::vm(vm)) {
                    Ok(()) | Err(StoreError::NotFound(_)) => (),
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        });
        if let Err(e) = cleanup {
            failures.push(format!("tree cleanup: {}", e));
        }

        if info.is_some() {
            self.wait_domain_gone(task, vm, domid)?;
        }

        if !failures.is_empty() {
            warn!(
                "destroy of {} left {} cleanup failures: {}",
                vm,
                failures.len(),
                failures.join("; ")
            );
        }

        if !suspended {
            self.extras.delete(vm)?;
        }
        self.updates.push(Update::Vm(vm.clone()));
        Ok(())
    }

    fn teardown_devices(
        &self,
        task: &TaskHandle,
        vm: &VmId,
        extra: &VmExtra,
        failures: &mut Vec<String>,
    ) {
        let domid = extra.domid;
        if let Err(e) = self.flush_vbds(task, vm, extra) {
            failures.push(format!("vbd flush: {}", e));
        }
        for spec in &extra.vbds {
            match devices::lookup_device(&*self.store, domid, DeviceKind::Vbd, &spec.id) {
                Ok(Some(devid)) => {
                    if let Err(e) = vbd::release(&*self.store, domid, devid) {
                        failures.push(format!("vbd {}: {}", spec.id, e));
                    }
                    if let Some(DiskSource::Vdi(name)) = &spec.disk {
                        if let Err(e) = self.detach_vdi(vm, &spec.id, name) {
                            failures.push(format!("vdi {}: {}", name, e));
                        }
                    }
                }
                Ok(None) => (),
                Err(e) => failures.push(format!("vbd {}: {}", spec.id, e)),
            }
        }
        for spec in &extra.vifs {
            match devices::lookup_device(&*self.store, domid, DeviceKind::Vif, &spec.id) {
                Ok(Some(devid)) => {
                    if let Err(e) = vif::release(&*self.store, domid, devid) {
                        failures.push(format!("vif {}: {}", spec.id, e));
                    }
                }
                Ok(None) => (),
                Err(e) => failures.push(format!("vif {}: {}", spec.id, e)),
            }
        }
        for spec in &extra.pcis {
            if let Err(e) = pci::unplug_pv(&*self.hv, &*self.store, domid, spec) {
                failures.push(format!("pci {}: {}", spec.id, e));
            }
        }
    }

    fn detach_vdi(&self, vm: &VmId, vbd_id: &str, name: &str) -> Result<()> {
        let (sr, vdi) = self.storage.get_by_name(name)?;
        let dp = self
            .storage
            .dp_create(&Self::vbd_datapath(vm, vbd_id), "lifecycle-engine")?;
        let _ = self.storage.vdi_deactivate(&dp, &sr, &vdi);
        self.storage.vdi_detach(&dp, &sr, &vdi)?;
        self.storage.dp_destroy(&dp, false)?;
        Ok(())
    }

    fn wait_domain_gone(&self, task: &TaskHandle, vm: &VmId, domid: DomId) -> Result<()> {
        let deadline = Instant::now() + self.cfg.dying_budget();
        loop {
            task.check_cancel()?;
            let present = self
                .hv
                .domain_getinfolist(DomId(0))
                .map_err(Error::from)?
                .iter()
                .any(|info| info.domid == domid && info.uuid == vm.0);
            if !present {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let sentinel = dying_sentinel(domid);
                warn!(
                    "domain {} for {} is stuck dying, stamping {}",
                    domid, vm, sentinel
                );
                if let Err(e) = self.hv.domain_sethandle(domid, &sentinel) {
                    warn!("failed to stamp sentinel on {}: {}", domid, e);
                }
                return Err(Error::StuckInDyingState(domid));
            }
            std::thread::sleep(
                self.cfg
                    .dying_poll_period()
                    .min(deadline.saturating_duration_since(Instant::now())),
            );
        }
    }

    // ---- reboot ------------------------------------------------------------

    /// Re-enters the create/build path for a guest whose domain went away
    /// with the reboot code, reusing the preserved record.
    pub fn on_reboot(&self, task: &TaskHandle, vm: &VmId) -> Result<DomId> {
        let extra = self.load_extra(vm)?;
        if extra.build_info.is_none() {
            return Err(Error::DomainNotBuilt);
        }
        let spec = VmSpec {
            create_info: extra.create_info.clone(),
            vcpus: extra.vcpus,
            shadow_multiplier: extra.shadow_multiplier,
            memory_static_max: extra.memory_static_max,
            memory_dynamic_min: extra.memory_dynamic_min,
            memory_dynamic_max: extra.memory_dynamic_max,
            build_plan: extra.plan.clone(),
            cpuid: extra.cpuid.clone(),
        };
        let vbds = extra.vbds.clone();
        let vifs = extra.vifs.clone();
        let domid = self.create(task, vm, &spec)?;
        self.build(task, vm, &vbds, &vifs)?;
        Ok(domid)
    }

    // ---- device operations -------------------------------------------------

    /// Plugs a block device, resolving its backend through storage.
    pub fn vbd_plug(&self, task: &TaskHandle, vm: &VmId, spec: &vbd::VbdSpec) -> Result<String> {
        task.check_cancel()?;
        self.cfg.validate_keys(
            "vbd extra keys",
            crate::config::RECOGNIZED_BACKEND_KEYS,
            spec.extra_backend_keys.keys().map(String::as_str),
        )?;
        let mut extra = self.load_extra(vm)?;
        let domid = extra.domid;
        let hvm = extra.create_info.hvm;
        if devices::lookup_device(&*self.store, domid, DeviceKind::Vbd, &spec.id)?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let number = match spec.device_number {
            Some(number) => number,
            None => next_disk_number(&extra.vbds),
        };
        let iface = Interface::of_disk_number(hvm, number)?;

        let (params, backend_domid, attached) = match &spec.disk {
            None => (String::new(), DomId(0), false),
            Some(DiskSource::Local(path)) => (path.display().to_string(), DomId(0), false),
            Some(DiskSource::Vdi(name)) => {
                let (sr, vdi) = self.storage.get_by_name(name)?;
                let dp = self
                    .storage
                    .dp_create(&Self::vbd_datapath(vm, &spec.id), "lifecycle-engine")?;
                let attach = self.storage.vdi_attach(&dp, &sr, &vdi, matches!(spec.mode, vbd::VbdMode::ReadWrite))?;
                if let Err(e) = self.storage.vdi_activate(&dp, &sr, &vdi) {
                    let _ = self.storage.vdi_detach(&dp, &sr, &vdi);
                    return Err(e.into());
                }
                (attach.params.clone(), self.backend_domid_for(attach.backend_vm_uuid.as_deref()), true)
            }
        };

        task.check_cancel()?;
        let mut stored = spec.clone();
        stored.device_number = Some(number);
        let result = vbd::add(&*self.store, domid, backend_domid, &stored, iface, &params);
        let devid = match result {
            Ok(devid) => devid,
            Err(e) => {
                if attached {
                    if let Some(DiskSource::Vdi(name)) = &spec.disk {
                        let _ = self.detach_vdi(vm, &spec.id, name);
                    }
                }
                return Err(e);
            }
        };
        debug!("plugged vbd {} as {} for {}", spec.id, devid, vm);

        extra.vbds.retain(|v| v.id != spec.id);
        extra.vbds.push(stored);
        self.extras.write(vm, &extra)?;

        let device = iface.to_linux_device();
        self.updates.push(Update::Vbd(vm.clone(), device.clone()));
        Ok(device)
    }

    /// Unplugs a block device; `force` skips the guest's cooperation.
    pub fn vbd_unplug(&self, task: &TaskHandle, vm: &VmId, id: &str, force: bool) -> Result<()> {
        let mut extra = self.load_extra(vm)?;
        let domid = extra.domid;
        let devid = devices::lookup_device(&*self.store, domid, DeviceKind::Vbd, id)?
            .ok_or(Error::DeviceNotConnected)?;

        if force {
            vbd::hard_shutdown_all(
                &*self.store,
                task,
                domid,
                &[devid],
                self.cfg.device_shutdown_timeout(),
            )?;
        } else {
            vbd::clean_shutdown(
                &*self.store,
                task,
                domid,
                devid,
                self.cfg.device_shutdown_timeout(),
            )?;
        }
        vbd::release(&*self.store, domid, devid)?;

        if let Some(spec) = extra.vbds.iter().find(|v| v.id == id) {
            if let Some(DiskSource::Vdi(name)) = &spec.disk {
                if let Err(e) = self.detach_vdi(vm, id, name) {
                    warn!("failed to detach {} for {}: {}", name, vm, e);
                }
            }
        }
        let device = extra
            .vbds
            .iter()
            .find(|v| v.id == id)
            .and_then(|v| v.device_number)
            .and_then(|n| Interface::of_disk_number(extra.create_info.hvm, n).ok())
            .map(|iface| iface.to_linux_device())
            .unwrap_or_default();
        extra.vbds.retain(|v| v.id != id);
        self.extras.write(vm, &extra)?;
        self.updates.push(Update::Vbd(vm.clone(), device));
        Ok(())
    }

    /// Inserts a medium into a removable device.
    pub fn vbd_insert(
        &self,
        task: &TaskHandle,
        vm: &VmId,
        id: &str,
        disk: DiskSource,
    ) -> Result<()> {
        task.check_cancel()?;
        let mut extra = self.load_extra(vm)?;
        let domid = extra.domid;
        let devid = devices::lookup_device(&*self.store, domid, DeviceKind::Vbd, id)?
            .ok_or(Error::DeviceNotConnected)?;
        let params = match &disk {
            DiskSource::Local(path) => path.display().to_string(),
            DiskSource::Vdi(name) => {
                let (sr, vdi) = self.storage.get_by_name(name)?;
                let dp = self
                    .storage
                    .dp_create(&Self::vbd_datapath(vm, id), "lifecycle-engine")?;
                let attach = self.storage.vdi_attach(&dp, &sr, &vdi, false)?;
                self.storage.vdi_activate(&dp, &sr, &vdi)?;
                attach.params
            }
        };
        vbd::media_insert(&*self.store, domid, devid, &params)?;
        if let Some(spec) = extra.vbds.iter_mut().find(|v| v.id == id) {
            spec.disk = Some(disk);
        }
        self.extras.write(vm, &extra)?;
        Ok(())
    }

    /// Ejects the medium from a removable device.
    pub fn vbd_eject(&self, task: &TaskHandle, vm: &VmId, id: &str) -> Result<()> {
        task.check_cancel()?;
        let mut extra = self.load_extra(vm)?;
        let domid = extra.domid;
        let devid = devices::lookup_device(&*self.store, domid, DeviceKind::Vbd, id)?
            .ok_or(Error::DeviceNotConnected)?;
        vbd::media_eject(&*self.store, domid, devid)?;
        if let Some(spec) = extra.vbds.iter_mut().find(|v| v.id == id) {
            if let Some(DiskSource::Vdi(name)) = spec.disk.clone() {
                if let Err(e) = self.detach_vdi(vm, id, &name) {
                    warn!("failed to detach ejected {}: {}", name, e);
                }
            }
            spec.disk = None;
        }
        self.extras.write(vm, &extra)?;
        Ok(())
    }

    /// Whether the removable device currently has no medium.
    pub fn vbd_media_ejected(&self, vm: &VmId, id: &str) -> Result<bool> {
        let extra = self.load_extra(vm)?;
        let devid = devices::lookup_device(&*self.store, extra.domid, DeviceKind::Vbd, id)?
            .ok_or(Error::DeviceNotConnected)?;
        vbd::media_is_ejected(&*self.store, extra.domid, devid)
    }

    /// Plugs a network interface.
    pub fn vif_plug(&self, task: &TaskHandle, vm: &VmId, spec: &vif::VifSpec) -> Result<()> {
        task.check_cancel()?;
        let mut extra = self.load_extra(vm)?;
        let domid = extra.domid;
        if devices::lookup_device(&*self.store, domid, DeviceKind::Vif, &spec.id)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        vif::add(&*self.store, domid, DomId(0), spec)?;
        extra.vifs.retain(|v| v.id != spec.id);
        extra.vifs.push(spec.clone());
        self.extras.write(vm, &extra)?;
        self.updates.push(Update::Vif(vm.clone(), spec.position));
        Ok(())
    }

    /// Unplugs a network interface.
    pub fn vif_unplug(&self, task: &TaskHandle, vm: &VmId, id: &str) -> Result<()> {
        task.check_cancel()?;
        let mut extra = self.load_extra(vm)?;
        let domid = extra.domid;
        let devid = devices::lookup_device(&*self.store, domid, DeviceKind::Vif, id)?
            .ok_or(Error::DeviceNotConnected)?;
        vif::release(&*self.store, domid, devid)?;
        let position = extra
            .vifs
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.position)
            .unwrap_or(devid);
        extra.vifs.retain(|v| v.id != id);
        self.extras.write(vm, &extra)?;
        self.updates.push(Update::Vif(vm.clone(), position));
        Ok(())
    }

    /// Plugs a PCI device, via the device model for HVM guests.
    pub fn pci_plug(&self, task: &TaskHandle, vm: &VmId, spec: &pci::PciSpec) -> Result<()> {
        task.check_cancel()?;
        let mut extra = self.load_extra(vm)?;
        let domid = extra.domid;
        if extra.create_info.hvm {
            pci::plug_hvm(&*self.store, domid, DomId(0), spec, self.cfg.dm_ack_timeout())?;
        } else {
            pci::plug_pv(&*self.hv, &*self.store, domid, DomId(0), spec)?;
        }
        extra.pcis.retain(|p| p.id != spec.id);
        extra.pcis.push(spec.clone());
        self.extras.write(vm, &extra)?;
        self.updates
            .push(Update::Pci(vm.clone(), spec.address.to_string()));
        Ok(())
    }

    /// Unplugs a PCI device.
    pub fn pci_unplug(&self, task: &TaskHandle, vm: &VmId, id: &str) -> Result<()> {
        task.check_cancel()?;
        let mut extra = self.load_extra(vm)?;
        let domid = extra.domid;
        let spec = extra
            .pcis
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or(Error::DeviceNotConnected)?;
        if extra.create_info.hvm {
            pci::unplug_hvm(&*self.store, domid, &spec, self.cfg.dm_ack_timeout())?;
        } else {
            pci::unplug_pv(&*self.hv, &*self.store, domid, &spec)?;
        }
        extra.pcis.retain(|p| p.id != id);
        self.extras.write(vm, &extra)?;
        self.updates
            .push(Update::Pci(vm.clone(), spec.address.to_string()));
        Ok(())
    }

    // ---- device model ------------------------------------------------------

    fn dm_config(&self, extra: &VmExtra) -> Result<DmConfig> {
        let platform = &extra.create_info.platformdata;
        let get = |key: &str| platform.get(key).cloned();
        let info = extra.build_info.as_ref().ok_or(Error::DomainNotBuilt)?;

        let mut disks = Vec::new();
        for spec in &extra.vbds {
            let Some(number) = spec.device_number else {
                continue;
            };
            let path = match devices::lookup_device(
                &*self.store,
                extra.domid,
                DeviceKind::Vbd,
                &spec.id,
            )? {
                Some(devid) => {
                    let back =
                        devices::recorded_backend_path(&*self.store, extra.domid, DeviceKind::Vbd, devid)?;
                    read_opt(&*self.store, &format!("{}/params", back))?.unwrap_or_default()
                }
                None => String::new(),
            };
            disks.push(DmDisk {
                index: number,
                path,
                cdrom: spec.cdrom,
            });
        }

        let nics = extra
            .vifs
            .iter()
            .map(|spec| DmNic {
                mac: spec.mac.clone(),
                bridge: match &spec.network {
                    NetworkKind::Bridge(name) | NetworkKind::VSwitch(name) => name.clone(),
                    NetworkKind::Netback(_, _) => String::new(),
                },
                position: spec.position,
            })
            .collect();

        let display = match (get("vnc-ip"), get("vnc-port")) {
            (Some(ip), Some(port)) => DmDisplay::Vnc {
                video: get("stdvga").unwrap_or_else(|| "cirrus".into()),
                ip,
                port: port.parse().unwrap_or(5900),
                keymap: get("keymap").unwrap_or_else(|| "en-us".into()),
            },
            _ => DmDisplay::None,
        };

        Ok(DmConfig {
            memory_kib: info.memory_target_kib,
            boot_order: get("boot-order").unwrap_or_else(|| "cd".into()),
            serial: get("serial"),
            vcpus: extra.vcpus,
            nics,
            disks,
            pci_emulations: Vec::new(),
            usb: get("usb").map(|u| vec![u]).unwrap_or_default(),
            acpi: get("acpi").map_or(true, |v| v == "1" || v == "true"),
            display,
            pci_passthrough: !extra.pcis.is_empty(),
            hvm: extra.create_info.hvm,
            video_mib: get("video-mib").and_then(|v| v.parse().ok()).unwrap_or(4),
            extras: Vec::new(),
        })
    }

    /// Starts the device model: always for HVM, and for a PV guest that
    /// configured a framebuffer.
    pub fn start_device_model(&self, task: &TaskHandle, vm: &VmId) -> Result<()> {
        let extra = self.load_extra(vm)?;
        let cfg = self.dm_config(&extra)?;
        if !cfg.hvm && matches!(cfg.display, DmDisplay::None) {
            debug!("{} is PV without a framebuffer, no device model", vm);
            return Ok(());
        }
        self.dm.start(task, extra.domid, &cfg)
    }

    // ---- introspection -----------------------------------------------------

    /// Reports the VM's coarse state.
    pub fn get_state(&self, vm: &VmId) -> Result<VmStateInfo> {
        let Some(extra) = self.extras.read(vm)? else {
            return Ok(VmStateInfo {
                power_state: PowerState::Absent,
                domid: None,
                suspend_memory_bytes: 0,
                vcpus: 0,
                last_create_time: 0,
            });
        };
        let info = self.live_domain(vm, &extra);
        let power_state = match &info {
            Some(info) if info.shutdown => PowerState::Shutdown(info.shutdown_reason()),
            Some(_) => PowerState::Running,
            None if extra.suspend_memory_bytes != 0 => PowerState::Suspended,
            None => PowerState::Halted,
        };
        Ok(VmStateInfo {
            power_state,
            domid: info.map(|i| i.domid),
            suspend_memory_bytes: extra.suspend_memory_bytes,
            vcpus: extra.vcpus,
            last_create_time: extra.last_create_time,
        })
    }

    /// The pending action the guest's shutdown asks for, if any.
    pub fn get_domain_action_request(&self, vm: &VmId) -> Result<Option<ActionRequest>> {
        let extra = self.load_extra(vm)?;
        let Some(info) = self.live_domain(vm, &extra) else {
            return Ok(None);
        };
        Ok(info.shutdown_reason().map(|reason| match reason {
            ShutdownReason::Reboot => ActionRequest::Reboot,
            ShutdownReason::Suspend => ActionRequest::Suspend,
            ShutdownReason::Crash => ActionRequest::Crash,
            ShutdownReason::Poweroff | ShutdownReason::Halt => ActionRequest::Poweroff,
        }))
    }

    /// Exports the raw persistent record.
    pub fn get_internal_state(&self, vm: &VmId) -> Result<serde_json::Value> {
        let extra = self.load_extra(vm)?;
        serde_json::to_value(&extra)
            .map_err(|e| Error::InternalError(format!("encode record: {}", e)))
    }

    /// Imports a raw persistent record (orchestrator hand-off).
    pub fn set_internal_state(&self, vm: &VmId, state: serde_json::Value) -> Result<()> {
        let extra: VmExtra = serde_json::from_value(state)
            .map_err(|e| Error::InternalError(format!("decode record: {}", e)))?;
        self.extras.write(vm, &extra)
    }

    /// Best-effort rebalance hint to the broker.
    pub fn balance_memory(&self) {
        self.broker.balance();
    }

    /// Reports one device's plug state.
    pub fn device_state(&self, vm: &VmId, kind: DeviceKind, id: &str) -> Result<DeviceStateInfo> {
        let extra = self.load_extra(vm)?;
        let devid = devices::lookup_device(&*self.store, extra.domid, kind, id)?;
        let Some(devid) = devid else {
            return Ok(DeviceStateInfo {
                plugged: false,
                device: None,
                media_ejected: None,
            });
        };
        let device = match kind {
            DeviceKind::Vbd => Interface::of_key(devid).ok().map(|i| i.to_linux_device()),
            _ => Some(devid.to_string()),
        };
        let media_ejected = match kind {
            DeviceKind::Vbd => vbd::media_is_ejected(&*self.store, extra.domid, devid).ok(),
            _ => None,
        };
        Ok(DeviceStateInfo {
            plugged: true,
            device,
            media_ejected,
        })
    }

    /// What the guest asked of a device: currently only an unplug request,
    /// visible as the frontend moving to the closing state.
    pub fn device_action_request(
        &self,
        vm: &VmId,
        kind: DeviceKind,
        id: &str,
    ) -> Result<Option<String>> {
        let extra = self.load_extra(vm)?;
        let Some(devid) = devices::lookup_device(&*self.store, extra.domid, kind, id)? else {
            return Ok(None);
        };
        let front = devices::frontend_path(extra.domid, kind, devid);
        let state = read_opt(&*self.store, &format!("{}/state", front))?;
        Ok(match state.as_deref() {
            Some(devices::xenbus_state::CLOSING) | Some(devices::xenbus_state::CLOSED) => {
                Some("unplug".to_string())
            }
            _ => None,
        })
    }

    /// Debug back door: poke a watch, hint a rebalance.
    pub fn debug_trigger(&self, cmd: &str, args: &[String]) -> Result<String> {
        match cmd {
            "fire-watch" => {
                let path = args.first().ok_or(Error::NotSupported)?;
                self.store.write(path, "")?;
                Ok(format!("fired {}", path))
            }
            "re-balance" => {
                self.balance_memory();
                Ok("rebalance hinted".to_string())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn backend_domid_for(&self, backend_vm_uuid: Option<&str>) -> DomId {
        if let Some(uuid) = backend_vm_uuid {
            if let Ok(list) = self.hv.domain_getinfolist(DomId(0)) {
                if let Some(info) = list.iter().find(|info| info.uuid == uuid) {
                    return info.domid;
                }
            }
            warn!(
                "no resident domain for storage backend {}, using the control domain",
                uuid
            );
        }
        DomId(0)
    }
}

fn ack_cleared(value: Option<String>) -> bool {
    value.map_or(true, |v| v.is_empty())
}

fn next_disk_number(existing: &[vbd::VbdSpec]) -> u32 {
    let taken: Vec<u32> = existing.iter().filter_map(|v| v.device_number).collect();
    (0..).find(|n| !taken.contains(n)).unwrap_or(0)
}

/// Kernel and ramdisk a bootloader extracted; deleted on drop so no exit
/// path leaks them.
#[derive(Debug)]
pub struct ExtractedFiles(Vec<PathBuf>);

impl Drop for ExtractedFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to delete extracted {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// What a bootloader reports on stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderOutput {
    /// Extracted kernel path.
    pub kernel: PathBuf,
    /// Extracted ramdisk path, if any.
    pub ramdisk: Option<PathBuf>,
    /// Kernel command line.
    pub cmdline: String,
}

/// Parses the bootloader's `kernel`/`ramdisk`/`args` report.
pub fn parse_bootloader_output(stdout: &str) -> Option<BootloaderOutput> {
    let mut kernel = None;
    let mut ramdisk = None;
    let mut cmdline = String::new();
    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("kernel ") {
            kernel = Some(PathBuf::from(path.trim()));
        } else if let Some(path) = line.strip_prefix("ramdisk ") {
            ramdisk = Some(PathBuf::from(path.trim()));
        } else if let Some(args) = line.strip_prefix("args ") {
            cmdline = args.trim().to_string();
        }
    }
    Some(BootloaderOutput {
        kernel: kernel?,
        ramdisk,
        cmdline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_mib_formula() {
        // 256 MiB, 1 vcpu, multiplier 1: 1 + 0.25 rounds up to 2.
        assert_eq!(shadow_mib(256, 1, 1.0), 2);
        assert_eq!(shadow_mib(256, 1, 4.0), 5);
        assert_eq!(shadow_mib(0, 0, 0.0), 1);
        assert_eq!(shadow_mib(1024, 4, 1.0), 5);
    }

    #[test]
    fn test_overhead_bytes() {
        let pv = overhead_bytes(false, 268_435_456, 1, 1.0);
        assert_eq!(pv, 1 << 20);
        let hvm = overhead_bytes(true, 268_435_456, 1, 1.0);
        assert_eq!(hvm, 4 << 20);
    }

    #[test]
    fn test_dying_sentinel_format() {
        assert_eq!(
            dying_sentinel(DomId(0x12)),
            "deadbeef-dead-beef-dead-beef00000012"
        );
        assert!(dying_sentinel(DomId(7)).starts_with("deadbeef-dead-beef-dead-beef0000"));
    }

    #[test]
    fn test_parse_bootloader_output() {
        let out = parse_bootloader_output(
            "kernel /var/run/boot/kernel.1\nramdisk /var/run/boot/ramdisk.1\nargs root=/dev/xvda1 ro\n",
        )
        .unwrap();
        assert_eq!(out.kernel, PathBuf::from("/var/run/boot/kernel.1"));
        assert_eq!(out.ramdisk, Some(PathBuf::from("/var/run/boot/ramdisk.1")));
        assert_eq!(out.cmdline, "root=/dev/xvda1 ro");

        let minimal = parse_bootloader_output("kernel /k\n").unwrap();
        assert!(minimal.ramdisk.is_none());
        assert!(minimal.cmdline.is_empty());

        assert!(parse_bootloader_output("args only\n").is_none());
    }

    #[test]
    fn test_next_disk_number_skips_taken() {
        let mut specs = Vec::new();
        assert_eq!(next_disk_number(&specs), 0);
        for n in [0u32, 1, 3] {
            specs.push(vbd::VbdSpec {
                id: format!("d{}", n),
                mode: vbd::VbdMode::ReadWrite,
                backend_kind: vbd::VbdBackendKind::Vbd,
                device_number: Some(n),
                disk: None,
                cdrom: false,
                extra_backend_keys: Default::default(),
            });
        }
        assert_eq!(next_disk_number(&specs), 2);
    }

    #[test]
    fn test_extracted_files_removed_on_drop() {
        let dir = vmm_sys_util::tempdir::TempDir::new().unwrap();
        let kernel = dir.as_path().join("kernel");
        std::fs::write(&kernel, b"elf").unwrap();
        {
            let _extracted = ExtractedFiles(vec![kernel.clone()]);
        }
        assert!(!kernel.exists());
    }
}
