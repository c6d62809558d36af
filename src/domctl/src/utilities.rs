// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Simulated collaborators for the test suite.
//!
//! These model the external daemons faithfully enough to drive every
//! engine path: the hypervisor keeps a domain table with optional dying
//! latency and a stuck mode, the broker accounts for every reservation,
//! the builder honors the save-image framing byte for byte, and the guest
//! agent plays a cooperative guest against the control tree.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::builder_helper::{
    BuildOutcome, BuildSpec, DomainBuilder, HelperError, RestoreOutcome,
};
use crate::cpuid::LeafMasks;
use crate::devices::dm::{DmConfig, DmSupervisor};
use crate::hypervisor::{CreateFlags, DomInfo, HypervisorControl, HypervisorError, ShutdownReason};
use crate::memory_broker::{
    BrokerError, MemoryBroker, ReservationId, SessionId, CODE_UNKNOWN_SESSION,
};
use crate::storage::{AttachInfo, StorageError, StorageRepo, StorageService, VirtualDisk};
use crate::store::{MemStore, Store, RELEASE_DOMAIN};
use crate::task::TaskHandle;
use crate::units::kib_to_pages;
use crate::{DomId, Result};

/// Payload the simulated builder writes between the outer magic and the
/// device-model record.
pub const SIM_IMAGE_PAYLOAD: &[u8] = b"sim-domain-memory-v1\n";

#[derive(Debug, Default)]
struct SimDomain {
    uuid: String,
    hvm: bool,
    paused: bool,
    shutdown_code: Option<u32>,
    dying_deadline: Option<Instant>,
    stuck: bool,
    total_pages: u64,
    shadow_mib: u64,
    maxmem_kib: u64,
    memmap_limit_kib: u64,
    vcpus_max: u32,
    affinity: HashMap<u32, u64>,
    next_port: u32,
    irqs: HashSet<u32>,
    ioports: HashSet<(u32, u32)>,
    iomem: HashSet<(u64, u64)>,
    cpuid_leaves: Vec<(u32, Option<u32>)>,
    cpuid_applied: bool,
    spf_suppressed: bool,
    address_bits: u32,
}

#[derive(Debug, Default)]
struct SimHvInner {
    next_domid: u32,
    domains: HashMap<u32, SimDomain>,
    destroy_latency: Duration,
    fail_next_create: Option<String>,
}

/// In-memory hypervisor.
#[derive(Debug, Default)]
pub struct SimHypervisor {
    inner: Mutex<SimHvInner>,
    store: Mutex<Option<Arc<MemStore>>>,
}

impl SimHypervisor {
    /// Creates an empty hypervisor; domain ids start at 1.
    pub fn new() -> Self {
        let sim = SimHypervisor::default();
        sim.inner.lock().unwrap().next_domid = 1;
        sim
    }

    /// Attaches the tree so domain birth/death fires the special events.
    pub fn attach_store(&self, store: Arc<MemStore>) {
        *self.store.lock().unwrap() = Some(store);
    }

    fn fire(&self, name: &str) {
        if let Some(store) = self.store.lock().unwrap().as_ref() {
            store.fire_special(name);
        }
    }

    /// Domains pending destruction disappear only after this long.
    pub fn set_destroy_latency(&self, latency: Duration) {
        self.inner.lock().unwrap().destroy_latency = latency;
    }

    /// Makes the next domain creation fail with `message`.
    pub fn fail_next_create(&self, message: &str) {
        self.inner.lock().unwrap().fail_next_create = Some(message.to_string());
    }

    /// Makes a domain survive destruction forever (a wedged backend).
    pub fn set_stuck(&self, domid: DomId) {
        if let Some(dom) = self.inner.lock().unwrap().domains.get_mut(&domid.0) {
            dom.stuck = true;
        }
    }

    /// Marks a guest-initiated shutdown with the given reason.
    pub fn mark_shutdown(&self, domid: DomId, reason: ShutdownReason) {
        if let Some(dom) = self.inner.lock().unwrap().domains.get_mut(&domid.0) {
            dom.shutdown_code = Some(reason.to_code());
        }
        self.fire(RELEASE_DOMAIN);
    }

    /// Sets the domain's resident page count.
    pub fn set_total_pages(&self, domid: DomId, pages: u64) {
        if let Some(dom) = self.inner.lock().unwrap().domains.get_mut(&domid.0) {
            dom.total_pages = pages;
        }
    }

    /// Halves the domain's shadow allocation, as a misbehaving helper
    /// would.
    pub fn halve_shadow(&self, domid: DomId) {
        if let Some(dom) = self.inner.lock().unwrap().domains.get_mut(&domid.0) {
            dom.shadow_mib /= 2;
        }
    }

    /// The domain's current handle.
    pub fn uuid_of(&self, domid: DomId) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .domains
            .get(&domid.0)
            .map(|d| d.uuid.clone())
    }

    /// Whether the domain is still resident.
    pub fn exists(&self, domid: DomId) -> bool {
        self.prune();
        self.inner.lock().unwrap().domains.contains_key(&domid.0)
    }

    /// Whether an IRQ grant is in place.
    pub fn irq_granted(&self, domid: DomId, irq: u32) -> bool {
        self.inner
            .lock()
            .unwrap()
            .domains
            .get(&domid.0)
            .is_some_and(|d| d.irqs.contains(&irq))
    }

    /// Whether the CPUID policy was applied.
    pub fn cpuid_applied(&self, domid: DomId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .domains
            .get(&domid.0)
            .is_some_and(|d| d.cpuid_applied)
    }

    fn prune(&self) {
        let fired = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            let before = inner.domains.len();
            inner
                .domains
                .retain(|_, d| d.stuck || d.dying_deadline.map_or(true, |dl| dl > now));
            inner.domains.len() != before
        };
        if fired {
            self.fire(RELEASE_DOMAIN);
        }
    }

    fn with_domain<T>(
        &self,
        domid: DomId,
        f: impl FnOnce(&mut SimDomain) -> T,
    ) -> std::result::Result<T, HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .domains
            .get_mut(&domid.0)
            .map(f)
            .ok_or_else(|| HypervisorError(format!("no such domain {}", domid)))
    }

    fn info_of(domid: u32, dom: &SimDomain) -> DomInfo {
        DomInfo {
            domid: DomId(domid),
            uuid: dom.uuid.clone(),
            hvm_guest: dom.hvm,
            shutdown: dom.shutdown_code.is_some(),
            shutdown_code: dom.shutdown_code,
            total_memory_pages: dom.total_pages,
        }
    }
}

impl HypervisorControl for SimHypervisor {
    fn domain_create(
        &self,
        _ssidref: u32,
        flags: CreateFlags,
        uuid: &str,
    ) -> std::result::Result<DomId, HypervisorError> {
        let domid = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(message) = inner.fail_next_create.take() {
                return Err(HypervisorError(message));
            }
            let domid = inner.next_domid;
            inner.next_domid += 1;
            inner.domains.insert(
                domid,
                SimDomain {
                    uuid: uuid.to_string(),
                    hvm: flags.hvm,
                    paused: true,
                    shadow_mib: 0,
                    ..Default::default()
                },
            );
            domid
        };
        self.fire(crate::store::INTRODUCE_DOMAIN);
        Ok(DomId(domid))
    }

    fn domain_destroy(&self, domid: DomId) -> std::result::Result<(), HypervisorError> {
        let latency = self.inner.lock().unwrap().destroy_latency;
        self.with_domain(domid, |dom| {
            dom.dying_deadline = Some(Instant::now() + latency);
        })?;
        self.prune();
        self.fire(RELEASE_DOMAIN);
        Ok(())
    }

    fn domain_pause(&self, domid: DomId) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.paused = true)
    }

    fn domain_unpause(&self, domid: DomId) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.paused = false)
    }

    fn domain_shutdown(
        &self,
        domid: DomId,
        reason: ShutdownReason,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| {
            dom.shutdown_code = Some(reason.to_code());
        })?;
        self.fire(RELEASE_DOMAIN);
        Ok(())
    }

    fn domain_getinfo(&self, domid: DomId) -> std::result::Result<DomInfo, HypervisorError> {
        self.prune();
        self.with_domain(domid, |dom| Self::info_of(domid.0, dom))
    }

    fn domain_getinfolist(
        &self,
        start: DomId,
    ) -> std::result::Result<Vec<DomInfo>, HypervisorError> {
        self.prune();
        let inner = self.inner.lock().unwrap();
        let mut infos: Vec<DomInfo> = inner
            .domains
            .iter()
            .filter(|(domid, _)| **domid >= start.0)
            .map(|(domid, dom)| Self::info_of(*domid, dom))
            .collect();
        infos.sort_by_key(|info| info.domid);
        Ok(infos)
    }

    fn domain_sethandle(
        &self,
        domid: DomId,
        uuid: &str,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.uuid = uuid.to_string())
    }

    fn evtchn_alloc_unbound(
        &self,
        domid: DomId,
        _remote: DomId,
    ) -> std::result::Result<u32, HypervisorError> {
        self.with_domain(domid, |dom| {
            dom.next_port += 1;
            dom.next_port
        })
    }

    fn shadow_allocation_get(&self, domid: DomId) -> std::result::Result<u64, HypervisorError> {
        self.with_domain(domid, |dom| dom.shadow_mib)
    }

    fn shadow_allocation_set(
        &self,
        domid: DomId,
        mib: u64,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.shadow_mib = mib)
    }

    fn domain_setmaxmem(&self, domid: DomId, kib: u64) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.maxmem_kib = kib)
    }

    fn domain_set_memmap_limit(
        &self,
        domid: DomId,
        kib: u64,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.memmap_limit_kib = kib)
    }

    fn domain_max_vcpus(&self, domid: DomId, count: u32) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.vcpus_max = count)
    }

    fn vcpu_affinity_set(
        &self,
        domid: DomId,
        vcpu: u32,
        mask: u64,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| {
            dom.affinity.insert(vcpu, mask);
        })
    }

    fn vcpu_affinity_get(&self, domid: DomId, vcpu: u32) -> std::result::Result<u64, HypervisorError> {
        self.with_domain(domid, |dom| dom.affinity.get(&vcpu).copied().unwrap_or(u64::MAX))
    }

    fn domain_ioport_permission(
        &self,
        domid: DomId,
        first_port: u32,
        count: u32,
        allow: bool,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| {
            if allow {
                dom.ioports.insert((first_port, count));
            } else {
                dom.ioports.remove(&(first_port, count));
            }
        })
    }

    fn domain_iomem_permission(
        &self,
        domid: DomId,
        first_pfn: u64,
        count: u64,
        allow: bool,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| {
            if allow {
                dom.iomem.insert((first_pfn, count));
            } else {
                dom.iomem.remove(&(first_pfn, count));
            }
        })
    }

    fn domain_irq_permission(
        &self,
        domid: DomId,
        irq: u32,
        allow: bool,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| {
            if allow {
                dom.irqs.insert(irq);
            } else {
                dom.irqs.remove(&irq);
            }
        })
    }

    fn domain_cpuid_set(
        &self,
        domid: DomId,
        leaf: u32,
        subleaf: Option<u32>,
        _masks: &LeafMasks,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.cpuid_leaves.push((leaf, subleaf)))
    }

    fn domain_cpuid_apply(&self, domid: DomId) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.cpuid_applied = true)
    }

    fn cpuid_check(
        &self,
        _leaf: u32,
        _subleaf: Option<u32>,
        _masks: &LeafMasks,
    ) -> std::result::Result<bool, HypervisorError> {
        Ok(true)
    }

    fn domain_suppress_spurious_page_faults(
        &self,
        domid: DomId,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.spf_suppressed = true)
    }

    fn domain_set_machine_address_size(
        &self,
        domid: DomId,
        bits: u32,
    ) -> std::result::Result<(), HypervisorError> {
        self.with_domain(domid, |dom| dom.address_bits = bits)
    }
}

#[derive(Debug, Default)]
struct SimBrokerInner {
    capacity_kib: u64,
    sessions: HashSet<String>,
    reservations: HashMap<String, u64>,
    transferred: HashMap<u32, u64>,
    refuse_remaining: u32,
    refuse_code: i64,
    next_session: u32,
    next_reservation: u32,
    login_count: u32,
    last_reserve: Option<(u64, u64)>,
}

/// In-memory ballooning broker with reservation accounting.
#[derive(Debug, Default)]
pub struct SimBroker {
    inner: Mutex<SimBrokerInner>,
}

impl SimBroker {
    /// Creates a broker managing `capacity_kib` of host memory.
    pub fn new(capacity_kib: u64) -> Self {
        let sim = SimBroker::default();
        sim.inner.lock().unwrap().capacity_kib = capacity_kib;
        sim
    }

    /// Refuses the next `n` reserve calls with `code`.
    pub fn refuse_next(&self, n: u32, code: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.refuse_remaining = n;
        inner.refuse_code = code;
    }

    /// Forgets all sessions, as a broker restart would.
    pub fn invalidate_sessions(&self) {
        self.inner.lock().unwrap().sessions.clear();
    }

    /// Number of reservations currently held by any session.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().reservations.len()
    }

    /// KiB transferred to a domain so far.
    pub fn transferred_to(&self, domid: DomId) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .transferred
            .get(&domid.0)
            .copied()
            .unwrap_or(0)
    }

    /// How many logins have happened.
    pub fn login_count(&self) -> u32 {
        self.inner.lock().unwrap().login_count
    }

    /// The (min, max) KiB bounds of the most recent reserve call.
    pub fn last_reserve(&self) -> Option<(u64, u64)> {
        self.inner.lock().unwrap().last_reserve
    }

    fn check_session(
        inner: &SimBrokerInner,
        session: &SessionId,
    ) -> std::result::Result<(), BrokerError> {
        if !inner.sessions.contains(&session.0) {
            return Err(BrokerError::Failure(
                CODE_UNKNOWN_SESSION,
                "unknown session".into(),
            ));
        }
        Ok(())
    }
}

impl MemoryBroker for SimBroker {
    fn login(&self) -> std::result::Result<SessionId, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_session += 1;
        inner.login_count += 1;
        let session = format!("session-{}", inner.next_session);
        inner.sessions.insert(session.clone());
        Ok(SessionId(session))
    }

    fn reserve(
        &self,
        session: &SessionId,
        min_kib: u64,
        max_kib: u64,
    ) -> std::result::Result<(u64, ReservationId), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_session(&inner, session)?;
        inner.last_reserve = Some((min_kib, max_kib));
        if inner.refuse_remaining > 0 {
            inner.refuse_remaining -= 1;
            let code = inner.refuse_code;
            return Err(BrokerError::Failure(code, "host is squeezed".into()));
        }
        let outstanding: u64 = inner.reservations.values().sum();
        let free = inner.capacity_kib.saturating_sub(outstanding);
        if free < min_kib {
            return Err(BrokerError::Failure(
                crate::memory_broker::CODE_CANNOT_FREE_THIS_MUCH,
                format!("only {} KiB free", free),
            ));
        }
        let amount = free.min(max_kib);
        inner.next_reservation += 1;
        let id = format!("reservation-{}", inner.next_reservation);
        inner.reservations.insert(id.clone(), amount);
        Ok((amount, ReservationId(id)))
    }

    fn transfer_to_domain(
        &self,
        session: &SessionId,
        reservation: &ReservationId,
        domid: DomId,
    ) -> std::result::Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_session(&inner, session)?;
        let amount = inner.reservations.remove(&reservation.0).ok_or_else(|| {
            BrokerError::Failure(0, format!("no reservation {}", reservation.0))
        })?;
        *inner.transferred.entry(domid.0).or_insert(0) += amount;
        Ok(())
    }

    fn release(
        &self,
        session: &SessionId,
        reservation: &ReservationId,
    ) -> std::result::Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_session(&inner, session)?;
        inner
            .reservations
            .remove(&reservation.0)
            .map(|_| ())
            .ok_or_else(|| BrokerError::Failure(0, format!("no reservation {}", reservation.0)))
    }

    fn balance(&self) -> std::result::Result<(), BrokerError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SimStorageInner {
    vdis: BTreeMap<String, String>,
    attached: HashSet<String>,
    active: HashSet<String>,
    next_clone: u32,
}

/// In-memory storage daemon.
#[derive(Debug, Default)]
pub struct SimStorage {
    inner: Mutex<SimStorageInner>,
}

impl SimStorage {
    /// Creates an empty storage daemon.
    pub fn new() -> Self {
        SimStorage::default()
    }

    /// Registers a named disk backed by `params`.
    pub fn add_vdi(&self, name: &str, params: &str) {
        self.inner
            .lock()
            .unwrap()
            .vdis
            .insert(name.to_string(), params.to_string());
    }

    /// Currently attached disk count.
    pub fn attached_count(&self) -> usize {
        self.inner.lock().unwrap().attached.len()
    }

    /// Currently activated disk count.
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }
}

impl StorageService for SimStorage {
    fn get_by_name(
        &self,
        name: &str,
    ) -> std::result::Result<(StorageRepo, VirtualDisk), StorageError> {
        let inner = self.inner.lock().unwrap();
        if !inner.vdis.contains_key(name) {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok((StorageRepo("sr0".into()), VirtualDisk(name.to_string())))
    }

    fn dp_create(
        &self,
        id: &str,
        _caller: &str,
    ) -> std::result::Result<crate::storage::Datapath, StorageError> {
        Ok(crate::storage::Datapath(id.to_string()))
    }

    fn dp_destroy(
        &self,
        _dp: &crate::storage::Datapath,
        _allow_leak: bool,
    ) -> std::result::Result<(), StorageError> {
        Ok(())
    }

    fn vdi_attach(
        &self,
        _dp: &crate::storage::Datapath,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
        _read_write: bool,
    ) -> std::result::Result<AttachInfo, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let params = inner
            .vdis
            .get(&vdi.0)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(vdi.0.clone()))?;
        inner.attached.insert(vdi.0.clone());
        Ok(AttachInfo {
            params,
            backend_vm_uuid: None,
        })
    }

    fn vdi_activate(
        &self,
        _dp: &crate::storage::Datapath,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> std::result::Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.attached.contains(&vdi.0) {
            return Err(StorageError::Backend(format!("{} is not attached", vdi.0)));
        }
        inner.active.insert(vdi.0.clone());
        Ok(())
    }

    fn vdi_deactivate(
        &self,
        _dp: &crate::storage::Datapath,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> std::result::Result<(), StorageError> {
        self.inner.lock().unwrap().active.remove(&vdi.0);
        Ok(())
    }

    fn vdi_detach(
        &self,
        _dp: &crate::storage::Datapath,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> std::result::Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.contains(&vdi.0) {
            return Err(StorageError::Backend(format!("{} is still active", vdi.0)));
        }
        inner.attached.remove(&vdi.0);
        Ok(())
    }

    fn vdi_set_content_id(
        &self,
        _sr: &StorageRepo,
        _vdi: &VirtualDisk,
        _content_id: &str,
    ) -> std::result::Result<(), StorageError> {
        Ok(())
    }

    fn vdi_similar_content(
        &self,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> std::result::Result<Vec<VirtualDisk>, StorageError> {
        Ok(vec![vdi.clone()])
    }

    fn vdi_clone(
        &self,
        _sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> std::result::Result<VirtualDisk, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let params = inner
            .vdis
            .get(&vdi.0)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(vdi.0.clone()))?;
        inner.next_clone += 1;
        let name = format!("{}-clone-{}", vdi.0, inner.next_clone);
        inner.vdis.insert(name.clone(), params);
        Ok(VirtualDisk(name))
    }

    fn vdi_snapshot(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        _mirror_url: Option<&str>,
    ) -> std::result::Result<VirtualDisk, StorageError> {
        self.vdi_clone(sr, vdi)
    }

    fn vdi_compose(
        &self,
        _sr: &StorageRepo,
        _parent: &VirtualDisk,
        _child: &VirtualDisk,
    ) -> std::result::Result<(), StorageError> {
        Ok(())
    }
}

/// In-memory [`DomainBuilder`] that keeps the simulated hypervisor's
/// page accounting in step and writes the image payload byte for byte.
#[derive(Debug)]
pub struct SimBuilder {
    hv: Arc<SimHypervisor>,
    shadow_thief: AtomicBool,
}

impl SimBuilder {
    /// Creates a builder acting on the given hypervisor.
    pub fn new(hv: Arc<SimHypervisor>) -> Self {
        SimBuilder {
            hv,
            shadow_thief: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent HVM build silently halve the shadow
    /// allocation, as a buggy helper would.
    pub fn steal_shadow(&self) {
        self.shadow_thief.store(true, Ordering::SeqCst);
    }
}

impl DomainBuilder for SimBuilder {
    fn build(
        &self,
        task: &TaskHandle,
        domid: DomId,
        spec: &BuildSpec,
    ) -> std::result::Result<BuildOutcome, HelperError> {
        task.set_progress(100);
        self.hv
            .set_total_pages(domid, kib_to_pages(spec.mem_target_kib));
        if spec.hvm && self.shadow_thief.load(Ordering::SeqCst) {
            self.hv.halve_shadow(domid);
        }
        Ok(BuildOutcome {
            store_mfn: 0x1000 + u64::from(domid.0),
            console_mfn: 0x2000 + u64::from(domid.0),
            protocol: if spec.hvm { "native" } else { "x86_64-abi" }.to_string(),
        })
    }

    fn save(
        &self,
        task: &TaskHandle,
        _domid: DomId,
        _hvm: bool,
        image: &File,
        on_ready: &mut dyn FnMut() -> std::result::Result<(), HelperError>,
    ) -> std::result::Result<(), HelperError> {
        let mut image = image;
        task.set_progress(10);
        on_ready()?;
        image.write_all(SIM_IMAGE_PAYLOAD)?;
        task.set_progress(100);
        Ok(())
    }

    fn restore(
        &self,
        task: &TaskHandle,
        domid: DomId,
        spec: &BuildSpec,
        image: &File,
    ) -> std::result::Result<RestoreOutcome, HelperError> {
        let mut image = image;
        let mut payload = vec![0u8; SIM_IMAGE_PAYLOAD.len()];
        image.read_exact(&mut payload)?;
        if payload != SIM_IMAGE_PAYLOAD {
            return Err(HelperError::Protocol("image payload mismatch".into()));
        }
        self.hv
            .set_total_pages(domid, kib_to_pages(spec.mem_target_kib));
        task.set_progress(100);
        Ok(RestoreOutcome {
            store_mfn: 0x1000 + u64::from(domid.0),
            console_mfn: 0x2000 + u64::from(domid.0),
        })
    }
}

/// States the simulated device model records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimDmState {
    /// Freshly started.
    Started,
    /// Started from saved state.
    Restored,
    /// Quiesced.
    Suspended,
    /// Running again after suspend.
    Resumed,
    /// Stopped.
    Stopped,
}

/// In-memory device-model supervisor.
#[derive(Debug, Default)]
pub struct SimDm {
    states: Mutex<HashMap<u32, SimDmState>>,
    restored_blobs: Mutex<HashMap<u32, Vec<u8>>>,
}

/// The state blob the simulated model produces on suspend.
pub const SIM_DM_STATE: &[u8] = b"sim-dm-state-v1";

impl SimDm {
    /// Creates an idle supervisor.
    pub fn new() -> Self {
        SimDm::default()
    }

    /// The model's state for a domain.
    pub fn state_of(&self, domid: DomId) -> Option<SimDmState> {
        self.states.lock().unwrap().get(&domid.0).copied()
    }

    /// The blob handed to the last restore for a domain.
    pub fn restored_blob(&self, domid: DomId) -> Option<Vec<u8>> {
        self.restored_blobs.lock().unwrap().get(&domid.0).cloned()
    }
}

impl DmSupervisor for SimDm {
    fn start(&self, _task: &TaskHandle, domid: DomId, _cfg: &DmConfig) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert(domid.0, SimDmState::Started);
        Ok(())
    }

    fn restore(
        &self,
        _task: &TaskHandle,
        domid: DomId,
        _cfg: &DmConfig,
        state: &[u8],
    ) -> Result<()> {
        self.restored_blobs
            .lock()
            .unwrap()
            .insert(domid.0, state.to_vec());
        self.states
            .lock()
            .unwrap()
            .insert(domid.0, SimDmState::Restored);
        Ok(())
    }

    fn suspend(&self, _task: &TaskHandle, domid: DomId) -> Result<Vec<u8>> {
        self.states
            .lock()
            .unwrap()
            .insert(domid.0, SimDmState::Suspended);
        Ok(SIM_DM_STATE.to_vec())
    }

    fn resume(&self, _task: &TaskHandle, domid: DomId) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert(domid.0, SimDmState::Resumed);
        Ok(())
    }

    fn stop(&self, domid: DomId) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert(domid.0, SimDmState::Stopped);
        Ok(())
    }
}

/// A cooperative guest: acknowledges `control/shutdown` requests and then
/// reports the matching shutdown to the hypervisor.
#[derive(Debug)]
pub struct SimGuestAgent {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SimGuestAgent {
    /// Spawns an agent playing the guest in `domid`.
    pub fn spawn(store: Arc<MemStore>, hv: Arc<SimHypervisor>, domid: DomId) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_in_thread = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("sim-guest-{}", domid))
            .spawn(move || {
                let path = format!("/local/domain/{}/control/shutdown", domid);
                while !stop_in_thread.load(Ordering::SeqCst) {
                    if let Ok(request) = store.read(&path) {
                        if !request.is_empty() {
                            if let Some(reason) = match request.as_str() {
                                "poweroff" => Some(ShutdownReason::Poweroff),
                                "reboot" => Some(ShutdownReason::Reboot),
                                "suspend" => Some(ShutdownReason::Suspend),
                                "halt" => Some(ShutdownReason::Halt),
                                _ => None,
                            } {
                                // Acknowledge first, then go down.
                                let _ = store.write(&path, "");
                                hv.mark_shutdown(domid, reason);
                            }
                        }
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .expect("spawn sim guest");
        SimGuestAgent {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for SimGuestAgent {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A host agent playing the block backends: acknowledges forced shutdown
/// requests so parallel VBD teardown can complete.
#[derive(Debug)]
pub struct SimBackendAgent {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SimBackendAgent {
    /// Spawns the backend responder against the tree.
    pub fn spawn(store: Arc<MemStore>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_in_thread = stop.clone();
        let handle = std::thread::Builder::new()
            .name("sim-backend".into())
            .spawn(move || {
                while !stop_in_thread.load(Ordering::SeqCst) {
                    respond_once(&*store);
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .expect("spawn sim backend");
        SimBackendAgent {
            stop,
            handle: Some(handle),
        }
    }
}

fn respond_once(store: &dyn Store) {
    let Ok(backend_domids) = store.directory("/local/domain") else {
        return;
    };
    for backend_domid in backend_domids {
        let vbd_root = format!("/local/domain/{}/backend/vbd", backend_domid);
        let Ok(frontends) = store.directory(&vbd_root) else {
            continue;
        };
        for frontend in frontends {
            let Ok(devids) = store.directory(&format!("{}/{}", vbd_root, frontend)) else {
                continue;
            };
            for devid in devids {
                let back = format!("{}/{}/{}", vbd_root, frontend, devid);
                let requested = store.read(&format!("{}/shutdown-request", back)).is_ok();
                let acked = store.read(&format!("{}/shutdown-done", back)).is_ok();
                if requested && !acked {
                    let _ = store.write(&format!("{}/shutdown-done", back), "");
                }
            }
        }
    }
}

impl Drop for SimBackendAgent {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
