// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The host-scoped event thread.
//!
//! One thread owns every tree watch and a mirror of the hypervisor's
//! domain list. Introduce/release events trigger a list rescan whose diff
//! becomes `Update::Vm` items; per-domain device paths becoming (dis)
//! connected become `Update::Vbd`/`Update::Vif` items. Consumers are
//! idempotent, so coalesced or repeated deliveries are harmless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::hypervisor::HypervisorControl;
use crate::iface::Interface;
use crate::store::{Store, WatchEvent, INTRODUCE_DOMAIN, RELEASE_DOMAIN};
use crate::updates::{Update, UpdateBus};
use crate::{DomId, Result, VmId};

const EVENT_POLL: Duration = Duration::from_millis(100);

// Backend keys whose changes matter to device state.
const BACKEND_KEYS: &[&str] = &["kthread-pid", "tapdisk-pid", "shutdown-done", "params"];

// Per-domain paths mirrored into Update::Vm.
const DOMAIN_KEYS: &[&str] = &[
    "data/updated",
    "memory/target",
    "memory/uncooperative",
    "console/vnc-port",
    "console/tc-port",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct DomSnapshot {
    uuid: String,
    shutdown: bool,
    shutdown_code: Option<u32>,
}

/// Handle on the running event thread; stops and joins on drop.
#[derive(Debug)]
pub struct EventThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    /// Spawns the watcher.
    pub fn spawn(
        store: Arc<dyn Store>,
        hv: Arc<dyn HypervisorControl>,
        bus: Arc<UpdateBus>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_in_thread = stop.clone();
        let handle = std::thread::Builder::new()
            .name("host-events".into())
            .spawn(move || {
                let mut watcher = Watcher {
                    store,
                    hv,
                    bus,
                    mirror: HashMap::new(),
                };
                watcher.register_special();
                while !stop_in_thread.load(Ordering::SeqCst) {
                    match watcher.store.next_watch_event(EVENT_POLL) {
                        Ok(Some(event)) => watcher.handle_event(event),
                        Ok(None) => (),
                        Err(e) => {
                            warn!("watch stream failed: {}", e);
                            std::thread::sleep(EVENT_POLL);
                        }
                    }
                }
            })
            .map_err(|e| crate::Error::InternalError(format!("spawn event thread: {}", e)))?;
        Ok(EventThread {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Watcher {
    store: Arc<dyn Store>,
    hv: Arc<dyn HypervisorControl>,
    bus: Arc<UpdateBus>,
    mirror: HashMap<u32, DomSnapshot>,
}

impl Watcher {
    fn register_special(&self) {
        for (path, token) in [(INTRODUCE_DOMAIN, "introduce"), (RELEASE_DOMAIN, "release")] {
            if let Err(e) = self.store.watch(path, token) {
                warn!("failed to watch {}: {}", path, e);
            }
        }
        if let Err(e) = self.store.watch("/local/domain/0/backend", "backend") {
            warn!("failed to watch the backend tree: {}", e);
        }
    }

    fn handle_event(&mut self, event: WatchEvent) {
        match event.token.as_str() {
            "introduce" | "release" => self.rescan_domains(),
            "backend" => {
                if let Some(update) = backend_update(&event.path, &self.mirror) {
                    self.bus.push(update);
                }
            }
            token if token.starts_with("dom:") => {
                if let Some(update) = domain_update(&event.path, token, &self.mirror) {
                    self.bus.push(update);
                }
            }
            _ => debug!("ignoring watch event {:?}", event),
        }
    }

    fn rescan_domains(&mut self) {
        let list = match self.hv.domain_getinfolist(DomId(0)) {
            Ok(list) => list,
            Err(e) => {
                warn!("domain list unavailable: {}", e);
                return;
            }
        };
        let mut seen: HashMap<u32, DomSnapshot> = HashMap::new();
        for info in &list {
            seen.insert(
                info.domid.0,
                DomSnapshot {
                    uuid: info.uuid.clone(),
                    shutdown: info.shutdown,
                    shutdown_code: info.shutdown_code,
                },
            );
        }

        for (domid, snapshot) in &seen {
            match self.mirror.get(domid) {
                None => {
                    debug!("domain {} appeared ({})", domid, snapshot.uuid);
                    self.watch_domain(DomId(*domid), &snapshot.uuid);
                    self.bus.push(Update::Vm(VmId(snapshot.uuid.clone())));
                }
                Some(previous) if previous != snapshot => {
                    self.bus.push(Update::Vm(VmId(snapshot.uuid.clone())));
                }
                Some(_) => (),
            }
        }
        for (domid, snapshot) in &self.mirror {
            if !seen.contains_key(domid) {
                debug!("domain {} disappeared ({})", domid, snapshot.uuid);
                self.unwatch_domain(DomId(*domid), &snapshot.uuid);
                self.bus.push(Update::Vm(VmId(snapshot.uuid.clone())));
            }
        }
        self.mirror = seen;
    }

    fn watch_domain(&self, domid: DomId, uuid: &str) {
        let token = format!("dom:{}:{}", domid, uuid);
        for key in DOMAIN_KEYS {
            let path = format!("/local/domain/{}/{}", domid, key);
            if let Err(e) = self.store.watch(&path, &token) {
                warn!("failed to watch {}: {}", path, e);
            }
        }
        let device_root = format!("/local/domain/{}/device", domid);
        if let Err(e) = self.store.watch(&device_root, &token) {
            warn!("failed to watch {}: {}", device_root, e);
        }
        let rtc = format!("/vm/{}/rtc/timeoffset", uuid);
        if let Err(e) = self.store.watch(&rtc, &token) {
            warn!("failed to watch {}: {}", rtc, e);
        }
    }

    fn unwatch_domain(&self, domid: DomId, uuid: &str) {
        let token = format!("dom:{}:{}", domid, uuid);
        for key in DOMAIN_KEYS {
            let _ = self
                .store
                .unwatch(&format!("/local/domain/{}/{}", domid, key), &token);
        }
        let _ = self
            .store
            .unwatch(&format!("/local/domain/{}/device", domid), &token);
        let _ = self
            .store
            .unwatch(&format!("/vm/{}/rtc/timeoffset", uuid), &token);
    }
}

// Event on a frontend path becomes a device update for its VM.
fn domain_update(path: &str, token: &str, _mirror: &HashMap<u32, DomSnapshot>) -> Option<Update> {
    let uuid = token.splitn(3, ':').nth(2)?;
    let vm = VmId(uuid.to_string());
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    // local/domain/<d>/device/<kind>/<devid>/...
    if parts.len() >= 6 && parts[3] == "device" {
        let devid: u32 = parts[5].parse().ok()?;
        return match parts[4] {
            "vbd" => Some(Update::Vbd(vm, linux_device_of_key(devid))),
            "vif" => Some(Update::Vif(vm, devid)),
            _ => Some(Update::Vm(vm)),
        };
    }
    Some(Update::Vm(vm))
}

// Event on a backend key becomes a device update for the frontend's VM.
fn backend_update(path: &str, mirror: &HashMap<u32, DomSnapshot>) -> Option<Update> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    // local/domain/<bd>/backend/<kind>/<frontend>/<devid>/<key>
    if parts.len() < 8 || parts[3] != "backend" {
        return None;
    }
    if !BACKEND_KEYS.contains(&parts[7]) {
        return None;
    }
    let frontend: u32 = parts[5].parse().ok()?;
    let devid: u32 = parts[6].parse().ok()?;
    let uuid = mirror.get(&frontend)?.uuid.clone();
    let vm = VmId(uuid);
    match parts[4] {
        "vbd" => Some(Update::Vbd(vm, linux_device_of_key(devid))),
        "vif" => Some(Update::Vif(vm, devid)),
        _ => Some(Update::Vm(vm)),
    }
}

fn linux_device_of_key(devid: u32) -> String {
    Interface::of_key(devid)
        .map(|iface| iface.to_linux_device())
        .unwrap_or_else(|_| devid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::ShutdownReason;
    use crate::store::MemStore;
    use crate::utilities::SimHypervisor;
    use std::time::Instant;

    fn wait_for_update(bus: &UpdateBus, last: u64, wanted: &Update) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut cursor = last;
        while Instant::now() < deadline {
            let (updates, next) = bus.get(cursor, Duration::from_millis(100));
            if updates.iter().any(|u| u == wanted) {
                return next;
            }
            cursor = next.saturating_sub(1);
        }
        panic!("update {:?} never arrived", wanted);
    }

    #[test]
    fn test_domain_lifecycle_updates() {
        let store = Arc::new(MemStore::new());
        let hv = Arc::new(SimHypervisor::new());
        hv.attach_store(store.clone());
        let bus = Arc::new(UpdateBus::new());
        let _events = EventThread::spawn(store.clone(), hv.clone(), bus.clone()).unwrap();

        let uuid = "11111111-1111-1111-1111-111111111111";
        let domid = hv.domain_create(0, Default::default(), uuid).unwrap();
        let vm = VmId(uuid.into());
        let cursor = wait_for_update(&bus, 0, &Update::Vm(vm.clone()));

        // A state change on the same domain surfaces again.
        hv.mark_shutdown(domid, ShutdownReason::Reboot);
        wait_for_update(&bus, cursor.saturating_sub(1), &Update::Vm(vm.clone()));

        // Destruction surfaces once the list loses the domain.
        hv.domain_destroy(domid).unwrap();
        wait_for_update(&bus, 0, &Update::Vm(vm));
    }

    #[test]
    fn test_device_path_updates() {
        let store = Arc::new(MemStore::new());
        let hv = Arc::new(SimHypervisor::new());
        hv.attach_store(store.clone());
        let bus = Arc::new(UpdateBus::new());
        let _events = EventThread::spawn(store.clone(), hv.clone(), bus.clone()).unwrap();

        let uuid = "22222222-2222-2222-2222-222222222222";
        let domid = hv.domain_create(0, Default::default(), uuid).unwrap();
        let vm = VmId(uuid.into());
        wait_for_update(&bus, 0, &Update::Vm(vm.clone()));

        let devid = 202 << 8;
        store
            .write(
                &format!("/local/domain/{}/device/vbd/{}/state", domid, devid),
                "4",
            )
            .unwrap();
        wait_for_update(&bus, 0, &Update::Vbd(vm.clone(), "xvda".into()));

        store
            .write(&format!("/local/domain/{}/device/vif/0/state", domid), "4")
            .unwrap();
        wait_for_update(&bus, 0, &Update::Vif(vm, 0));
    }

    #[test]
    fn test_backend_key_updates() {
        let store = Arc::new(MemStore::new());
        let hv = Arc::new(SimHypervisor::new());
        hv.attach_store(store.clone());
        let bus = Arc::new(UpdateBus::new());
        let _events = EventThread::spawn(store.clone(), hv.clone(), bus.clone()).unwrap();

        let uuid = "33333333-3333-3333-3333-333333333333";
        let domid = hv.domain_create(0, Default::default(), uuid).unwrap();
        let vm = VmId(uuid.into());
        wait_for_update(&bus, 0, &Update::Vm(vm.clone()));

        let devid = 202 << 8;
        store
            .write(
                &format!("/local/domain/0/backend/vbd/{}/{}/shutdown-done", domid, devid),
                "",
            )
            .unwrap();
        wait_for_update(&bus, 0, &Update::Vbd(vm, "xvda".into()));
    }

    #[test]
    fn test_frontend_path_parsing() {
        let mirror = HashMap::new();
        let update = domain_update(
            "/local/domain/5/device/vbd/51712/state",
            "dom:5:abc",
            &mirror,
        )
        .unwrap();
        assert_eq!(update, Update::Vbd(VmId("abc".into()), "xvda".into()));

        let update = domain_update("/local/domain/5/data/updated", "dom:5:abc", &mirror).unwrap();
        assert_eq!(update, Update::Vm(VmId("abc".into())));
    }

    #[test]
    fn test_backend_path_parsing() {
        let mut mirror = HashMap::new();
        mirror.insert(
            7,
            DomSnapshot {
                uuid: "abc".into(),
                shutdown: false,
                shutdown_code: None,
            },
        );
        let update =
            backend_update("/local/domain/0/backend/vbd/7/51712/params", &mirror).unwrap();
        assert_eq!(update, Update::Vbd(VmId("abc".into()), "xvda".into()));
        // Uninteresting keys are ignored.
        assert!(backend_update("/local/domain/0/backend/vbd/7/51712/state", &mirror).is_none());
        // Unknown frontends are ignored.
        assert!(backend_update("/local/domain/0/backend/vbd/9/51712/params", &mirror).is_none());
    }
}
