// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual block device frontends and backends.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::devices::{
    self, recorded_backend_path, xenbus_state, DeviceKind,
};
use crate::iface::Interface;
use crate::storage::DiskSource;
use crate::store::{read_opt, Store};
use crate::task::TaskHandle;
use crate::{DomId, Error, Result};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Guest access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdMode {
    /// Read-only attachment.
    ReadOnly,
    /// Read-write attachment.
    ReadWrite,
}

impl VbdMode {
    fn as_str(&self) -> &'static str {
        match self {
            VbdMode::ReadOnly => "r",
            VbdMode::ReadWrite => "w",
        }
    }
}

/// Which backend driver serves the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdBackendKind {
    /// Kernel block backend.
    Vbd,
    /// User-space tapdisk backend.
    Tap,
}

impl VbdBackendKind {
    fn as_str(&self) -> &'static str {
        match self {
            VbdBackendKind::Vbd => "vbd",
            VbdBackendKind::Tap => "tap",
        }
    }
}

/// Caller-facing description of one block device, snapshotted into the
/// persistent record so the device model and the suspend flush can be
/// regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbdSpec {
    /// Logical device id, the caller's stable handle.
    pub id: String,
    /// Access mode.
    pub mode: VbdMode,
    /// Serving backend driver.
    pub backend_kind: VbdBackendKind,
    /// Requested user-facing disk number; allocated when absent.
    pub device_number: Option<u32>,
    /// Disk contents; empty for a CDROM with no medium.
    pub disk: Option<DiskSource>,
    /// Removable-medium device.
    pub cdrom: bool,
    /// Extra backend keys forwarded after validation.
    pub extra_backend_keys: BTreeMap<String, String>,
}

/// Plugs a block frontend/backend pair. `params` is the backend parameter
/// string the storage layer resolved; returns the tree device number.
pub fn add(
    store: &dyn Store,
    frontend_domid: DomId,
    backend_domid: DomId,
    spec: &VbdSpec,
    iface: Interface,
    params: &str,
) -> Result<u32> {
    let devid = iface.to_key()?;
    let device = iface.to_linux_device();

    let mut frontend_keys = BTreeMap::new();
    frontend_keys.insert("virtual-device".into(), devid.to_string());
    frontend_keys.insert(
        "device-type".into(),
        if spec.cdrom { "cdrom" } else { "disk" }.into(),
    );

    let mut backend_keys = spec.extra_backend_keys.clone();
    backend_keys.insert("backend-kind".into(), spec.backend_kind.as_str().into());
    backend_keys.insert("dev".into(), device.clone());
    backend_keys.insert("mode".into(), spec.mode.as_str().into());
    backend_keys.insert("params".into(), params.into());
    backend_keys.insert("type".into(), "phy".into());
    backend_keys.insert("removable".into(), u32::from(spec.cdrom).to_string());

    devices::add_device(
        store,
        frontend_domid,
        backend_domid,
        DeviceKind::Vbd,
        devid,
        &spec.id,
        &frontend_keys,
        &backend_keys,
    )?;
    debug!(
        "vbd {} ({}) plugged for domain {} with backend {}",
        devid, device, frontend_domid, backend_domid
    );
    Ok(devid)
}

fn backend_of(store: &dyn Store, domid: DomId, devid: u32) -> Result<String> {
    recorded_backend_path(store, domid, DeviceKind::Vbd, devid)
}

/// Inserts a medium into a removable device.
pub fn media_insert(store: &dyn Store, domid: DomId, devid: u32, params: &str) -> Result<()> {
    let back = backend_of(store, domid, devid)?;
    store.transaction(&mut |tx| {
        tx.write(&format!("{}/params", back), params)?;
        tx.write(&format!("{}/media-present", back), "1")
    })?;
    Ok(())
}

/// Ejects the medium from a removable device.
pub fn media_eject(store: &dyn Store, domid: DomId, devid: u32) -> Result<()> {
    let back = backend_of(store, domid, devid)?;
    store.transaction(&mut |tx| {
        tx.write(&format!("{}/params", back), "")?;
        tx.write(&format!("{}/media-present", back), "0")
    })?;
    Ok(())
}

/// Whether the removable device currently has no medium.
pub fn media_is_ejected(store: &dyn Store, domid: DomId, devid: u32) -> Result<bool> {
    let back = backend_of(store, domid, devid)?;
    match read_opt(store, &format!("{}/media-present", back))? {
        Some(present) => Ok(present == "0"),
        None => Ok(read_opt(store, &format!("{}/params", back))?
            .map_or(true, |params| params.is_empty())),
    }
}

/// Asks the backend to close cleanly and waits for it. A backend that
/// reports an error or swings back to connected has rejected the detach.
pub fn clean_shutdown(
    store: &dyn Store,
    task: &TaskHandle,
    domid: DomId,
    devid: u32,
    timeout: Duration,
) -> Result<()> {
    let back = backend_of(store, domid, devid)?;
    let front = devices::frontend_path(domid, DeviceKind::Vbd, devid);
    store.write(&format!("{}/online", back), "0")?;
    store.write(&format!("{}/state", front), xenbus_state::CLOSING)?;

    let deadline = Instant::now() + timeout;
    loop {
        task.check_cancel()?;
        if read_opt(store, &format!("{}/error", back))?.is_some() {
            return Err(Error::DeviceDetachRejected);
        }
        match read_opt(store, &format!("{}/state", back))?.as_deref() {
            None | Some(xenbus_state::CLOSED) => return Ok(()),
            Some(xenbus_state::CONNECTED) => return Err(Error::DeviceDetachRejected),
            _ => (),
        }
        if Instant::now() >= deadline {
            return Err(Error::BackendTimeout);
        }
        std::thread::sleep(SHUTDOWN_POLL);
    }
}

/// Posts a forced-shutdown request; completion is signalled by the backend
/// through `shutdown-done`.
pub fn hard_shutdown_request(store: &dyn Store, domid: DomId, devid: u32) -> Result<String> {
    let back = backend_of(store, domid, devid)?;
    store.write(&format!("{}/online", back), "0")?;
    store.write(&format!("{}/shutdown-request", back), "force")?;
    Ok(back)
}

/// Hard-shuts every listed device in parallel: all requests are posted
/// first, then each backend's completion watch is awaited concurrently.
/// Any backend missing the deadline fails the call with `BackendTimeout`.
pub fn hard_shutdown_all(
    store: &dyn Store,
    task: &TaskHandle,
    domid: DomId,
    devids: &[u32],
    timeout: Duration,
) -> Result<()> {
    let mut backends = Vec::with_capacity(devids.len());
    for devid in devids {
        match hard_shutdown_request(store, domid, *devid) {
            Ok(back) => backends.push(back),
            // A device with no backend record is already gone.
            Err(Error::DoesNotExist) => (),
            Err(e) => return Err(e),
        }
    }

    let deadline = Instant::now() + timeout;
    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = backends
            .iter()
            .map(|back| {
                let task = task.clone();
                scope.spawn(move || wait_shutdown_done(store, &task, back, deadline))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::InternalError("shutdown waiter died".into())))
            })
            .collect()
    });
    for result in results {
        result?;
    }
    Ok(())
}

fn wait_shutdown_done(
    store: &dyn Store,
    task: &TaskHandle,
    back: &str,
    deadline: Instant,
) -> Result<()> {
    loop {
        task.check_cancel()?;
        if read_opt(store, &format!("{}/shutdown-done", back))?.is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!("backend {} missed its shutdown deadline", back);
            return Err(Error::BackendTimeout);
        }
        std::thread::sleep(SHUTDOWN_POLL);
    }
}

/// Releases every tree record of the device.
pub fn release(store: &dyn Store, domid: DomId, devid: u32) -> Result<()> {
    devices::remove_device(store, domid, DeviceKind::Vbd, devid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use std::sync::Arc;

    fn spec(id: &str, cdrom: bool) -> VbdSpec {
        VbdSpec {
            id: id.into(),
            mode: VbdMode::ReadWrite,
            backend_kind: VbdBackendKind::Vbd,
            device_number: Some(0),
            disk: Some(DiskSource::Local("/dev/loop0".into())),
            cdrom,
            extra_backend_keys: BTreeMap::new(),
        }
    }

    #[test]
    fn test_add_writes_backend_keys() {
        let store = MemStore::new();
        let iface = Interface::of_disk_number(false, 0).unwrap();
        let devid = add(&store, DomId(4), DomId(0), &spec("d0", false), iface, "/dev/loop0").unwrap();
        assert_eq!(devid, 202 << 8);
        let back = format!("/local/domain/0/backend/vbd/4/{}", devid);
        assert_eq!(store.read(&format!("{}/dev", back)).unwrap(), "xvda");
        assert_eq!(store.read(&format!("{}/mode", back)).unwrap(), "w");
        assert_eq!(store.read(&format!("{}/params", back)).unwrap(), "/dev/loop0");
    }

    #[test]
    fn test_media_cycle() {
        let store = MemStore::new();
        let iface = Interface::of_disk_number(true, 1).unwrap();
        let devid = add(&store, DomId(4), DomId(0), &spec("cd", true), iface, "").unwrap();
        assert!(media_is_ejected(&store, DomId(4), devid).unwrap());
        media_insert(&store, DomId(4), devid, "/isos/install.iso").unwrap();
        assert!(!media_is_ejected(&store, DomId(4), devid).unwrap());
        media_eject(&store, DomId(4), devid).unwrap();
        assert!(media_is_ejected(&store, DomId(4), devid).unwrap());
    }

    #[test]
    fn test_clean_shutdown_closed_backend() {
        let store = MemStore::new();
        let iface = Interface::of_disk_number(false, 0).unwrap();
        let devid = add(&store, DomId(4), DomId(0), &spec("d0", false), iface, "p").unwrap();
        let back = backend_of(&store, DomId(4), devid).unwrap();
        store
            .write(&format!("{}/state", back), xenbus_state::CLOSED)
            .unwrap();
        let task = TaskHandle::new("t");
        clean_shutdown(&store, &task, DomId(4), devid, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_clean_shutdown_rejected() {
        let store = MemStore::new();
        let iface = Interface::of_disk_number(false, 0).unwrap();
        let devid = add(&store, DomId(4), DomId(0), &spec("d0", false), iface, "p").unwrap();
        let back = backend_of(&store, DomId(4), devid).unwrap();
        store.write(&format!("{}/error", back), "in use").unwrap();
        let task = TaskHandle::new("t");
        assert_eq!(
            clean_shutdown(&store, &task, DomId(4), devid, Duration::from_millis(50)),
            Err(Error::DeviceDetachRejected)
        );
    }

    #[test]
    fn test_hard_shutdown_all_waits_for_every_backend() {
        let store = Arc::new(MemStore::new());
        let task = TaskHandle::new("t");
        let mut devids = Vec::new();
        for n in 0..3 {
            let iface = Interface::of_disk_number(false, n).unwrap();
            let mut s = spec(&format!("d{}", n), false);
            s.device_number = Some(n);
            devids.push(add(&*store, DomId(4), DomId(0), &s, iface, "p").unwrap());
        }

        // Play the backend: acknowledge each force request as it appears.
        let responder_store = store.clone();
        let responder = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            let mut done = 0;
            while done < 3 && Instant::now() < deadline {
                for devid in [202 << 8, (202 << 8) | 16, (202 << 8) | 32] {
                    let back = format!("/local/domain/0/backend/vbd/4/{}", devid);
                    let requested = responder_store
                        .read(&format!("{}/shutdown-request", back))
                        .is_ok();
                    let acked = responder_store
                        .read(&format!("{}/shutdown-done", back))
                        .is_ok();
                    if requested && !acked {
                        responder_store
                            .write(&format!("{}/shutdown-done", back), "")
                            .unwrap();
                        done += 1;
                    }
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        });

        hard_shutdown_all(&*store, &task, DomId(4), &devids, Duration::from_secs(1)).unwrap();
        responder.join().unwrap();
    }

    #[test]
    fn test_hard_shutdown_all_times_out() {
        let store = MemStore::new();
        let task = TaskHandle::new("t");
        let iface = Interface::of_disk_number(false, 0).unwrap();
        let devid = add(&store, DomId(4), DomId(0), &spec("d0", false), iface, "p").unwrap();
        assert_eq!(
            hard_shutdown_all(&store, &task, DomId(4), &[devid], Duration::from_millis(30)),
            Err(Error::BackendTimeout)
        );
    }
}
