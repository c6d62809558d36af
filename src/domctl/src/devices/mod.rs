// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual device supervision: block, network and PCI frontends/backends
//! plus the user-space device model.
//!
//! Frontend and backend records live in the control tree; every plug also
//! tags the device's private path with its logical id under `<kind>-id`,
//! so a device can always be found again by `(VmId, kind, logical-id)`
//! regardless of how the tree numbering shifted.

pub mod dm;
pub mod pci;
pub mod vbd;
pub mod vif;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::{read_opt, Perm, Perms, Store, StoreError};
use crate::{DomId, Error, Result};

/// Xenbus connection states published under `state` keys.
pub mod xenbus_state {
    /// Backend/frontend is initialising.
    pub const INITIALISING: &str = "1";
    /// Waiting for the peer.
    pub const INIT_WAIT: &str = "2";
    /// Initialised, not yet connected.
    pub const INITIALISED: &str = "3";
    /// Fully connected.
    pub const CONNECTED: &str = "4";
    /// Closing down.
    pub const CLOSING: &str = "5";
    /// Closed.
    pub const CLOSED: &str = "6";
}

/// The device kinds the engine supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Virtual block device.
    Vbd,
    /// Virtual network interface.
    Vif,
    /// Passed-through PCI device.
    Pci,
    /// Paravirtual framebuffer.
    Vfb,
}

impl DeviceKind {
    /// The tree directory name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Vbd => "vbd",
            DeviceKind::Vif => "vif",
            DeviceKind::Pci => "pci",
            DeviceKind::Vfb => "vfb",
        }
    }

    /// The private-path key the logical id is recorded under.
    pub fn id_key(&self) -> String {
        format!("{}-id", self.as_str())
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frontend directory for a device.
pub fn frontend_path(domid: DomId, kind: DeviceKind, devid: u32) -> String {
    format!("/local/domain/{}/device/{}/{}", domid, kind, devid)
}

/// Backend directory for a device, under the backend domain.
pub fn backend_path(backend: DomId, kind: DeviceKind, frontend: DomId, devid: u32) -> String {
    format!("/local/domain/{}/backend/{}/{}/{}", backend, kind, frontend, devid)
}

/// Engine-private directory for a device; guests have no access here.
pub fn private_path(domid: DomId, kind: DeviceKind, devid: u32) -> String {
    format!("/private/{}/{}/{}", domid, kind, devid)
}

/// Writes the frontend/backend/private record triple for one device inside
/// a single transaction, tagging the private path with the logical id.
#[allow(clippy::too_many_arguments)]
pub fn add_device(
    store: &dyn Store,
    frontend_domid: DomId,
    backend_domid: DomId,
    kind: DeviceKind,
    devid: u32,
    logical_id: &str,
    frontend_keys: &BTreeMap<String, String>,
    backend_keys: &BTreeMap<String, String>,
) -> Result<()> {
    let front = frontend_path(frontend_domid, kind, devid);
    let back = backend_path(backend_domid, kind, frontend_domid, devid);
    let private = private_path(frontend_domid, kind, devid);

    store.transaction(&mut |tx| {
        if tx.read(&format!("{}/state", front)).is_ok() {
            // An existing frontend means the device id is already taken.
            return Err(StoreError::Io(format!("device {} already exists", front)));
        }
        tx.write(&format!("{}/backend", front), &back)?;
        tx.write(&format!("{}/backend-id", front), &backend_domid.to_string())?;
        tx.write(&format!("{}/state", front), xenbus_state::INITIALISING)?;
        for (key, value) in frontend_keys {
            tx.write(&format!("{}/{}", front, key), value)?;
        }

        tx.write(&format!("{}/frontend", back), &front)?;
        tx.write(&format!("{}/frontend-id", back), &frontend_domid.to_string())?;
        tx.write(&format!("{}/online", back), "1")?;
        tx.write(&format!("{}/state", back), xenbus_state::INITIALISING)?;
        for (key, value) in backend_keys {
            tx.write(&format!("{}/{}", back, key), value)?;
        }

        tx.write(&format!("{}/{}", private, kind.id_key()), logical_id)?;
        tx.write(&format!("{}/backend-path", private), &back)?;

        tx.setperms(
            &front,
            &Perms {
                owner: frontend_domid,
                others: Perm::None,
            },
        )?;
        tx.setperms(
            &back,
            &Perms {
                owner: backend_domid,
                others: Perm::Read,
            },
        )?;
        Ok(())
    })?;
    Ok(())
}

/// Finds a device's tree number by its logical id. The mapping is injective
/// per `(domain, kind)`: each tree number carries exactly one id tag.
pub fn lookup_device(
    store: &dyn Store,
    domid: DomId,
    kind: DeviceKind,
    logical_id: &str,
) -> Result<Option<u32>> {
    let dir = format!("/private/{}/{}", domid, kind);
    let entries = match store.directory(&dir) {
        Ok(entries) => entries,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let tagged = read_opt(store, &format!("{}/{}/{}", dir, entry, kind.id_key()))?;
        if tagged.as_deref() == Some(logical_id) {
            let devid = entry
                .parse::<u32>()
                .map_err(|_| Error::InternalError(format!("bad device entry {}", entry)))?;
            return Ok(Some(devid));
        }
    }
    Ok(None)
}

/// Backend directory recorded for a device at plug time.
pub fn recorded_backend_path(
    store: &dyn Store,
    domid: DomId,
    kind: DeviceKind,
    devid: u32,
) -> Result<String> {
    let path = format!("{}/backend-path", private_path(domid, kind, devid));
    store.read(&path).map_err(Error::from)
}

/// Removes every tree record of a device. Used by release after the backend
/// has let go.
pub fn remove_device(store: &dyn Store, domid: DomId, kind: DeviceKind, devid: u32) -> Result<()> {
    let back = recorded_backend_path(store, domid, kind, devid).ok();
    store.transaction(&mut |tx| {
        for path in [
            frontend_path(domid, kind, devid),
            private_path(domid, kind, devid),
        ]
        .iter()
        .chain(back.iter())
        {
            match tx.rm(path) {
                Ok(()) | Err(StoreError::NotFound(_)) => (),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })?;
    Ok(())
}

/// Publishes VCPU availability nodes; the guest onlines its VCPUs from
/// these.
pub fn add_vcpus(store: &dyn Store, domid: DomId, count: u32) -> Result<()> {
    store.transaction(&mut |tx| {
        for vcpu in 0..count {
            tx.write(
                &format!("/local/domain/{}/cpu/{}/availability", domid, vcpu),
                "online",
            )?;
        }
        Ok(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn keys(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_add_device_writes_triple() {
        let store = MemStore::new();
        add_device(
            &store,
            DomId(5),
            DomId(0),
            DeviceKind::Vbd,
            768,
            "disk-0",
            &keys(&[("virtual-device", "768")]),
            &keys(&[("params", "/dev/sm/1")]),
        )
        .unwrap();
        assert_eq!(
            store.read("/local/domain/5/device/vbd/768/backend").unwrap(),
            "/local/domain/0/backend/vbd/5/768"
        );
        assert_eq!(
            store
                .read("/local/domain/0/backend/vbd/5/768/params")
                .unwrap(),
            "/dev/sm/1"
        );
        assert_eq!(
            store.read("/private/5/vbd/768/vbd-id").unwrap(),
            "disk-0"
        );
    }

    #[test]
    fn test_add_device_rejects_duplicate() {
        let store = MemStore::new();
        let empty = BTreeMap::new();
        add_device(
            &store,
            DomId(5),
            DomId(0),
            DeviceKind::Vif,
            0,
            "nic-0",
            &empty,
            &empty,
        )
        .unwrap();
        assert!(add_device(
            &store,
            DomId(5),
            DomId(0),
            DeviceKind::Vif,
            0,
            "nic-1",
            &empty,
            &empty,
        )
        .is_err());
    }

    #[test]
    fn test_lookup_device_by_logical_id() {
        let store = MemStore::new();
        let empty = BTreeMap::new();
        for (devid, id) in [(768u32, "disk-0"), (832, "disk-1")] {
            add_device(
                &store,
                DomId(2),
                DomId(0),
                DeviceKind::Vbd,
                devid,
                id,
                &empty,
                &empty,
            )
            .unwrap();
        }
        assert_eq!(
            lookup_device(&store, DomId(2), DeviceKind::Vbd, "disk-1").unwrap(),
            Some(832)
        );
        assert_eq!(
            lookup_device(&store, DomId(2), DeviceKind::Vbd, "disk-9").unwrap(),
            None
        );
        assert_eq!(
            lookup_device(&store, DomId(3), DeviceKind::Vbd, "disk-0").unwrap(),
            None
        );
    }

    #[test]
    fn test_remove_device_clears_all_records() {
        let store = MemStore::new();
        let empty = BTreeMap::new();
        add_device(
            &store,
            DomId(2),
            DomId(0),
            DeviceKind::Vbd,
            768,
            "disk-0",
            &empty,
            &empty,
        )
        .unwrap();
        remove_device(&store, DomId(2), DeviceKind::Vbd, 768).unwrap();
        assert!(store.read("/local/domain/2/device/vbd/768/state").is_err());
        assert!(store
            .read("/local/domain/0/backend/vbd/2/768/state")
            .is_err());
        assert!(store.read("/private/2/vbd/768/vbd-id").is_err());
    }

    #[test]
    fn test_add_vcpus() {
        let store = MemStore::new();
        add_vcpus(&store, DomId(1), 2).unwrap();
        assert_eq!(
            store.read("/local/domain/1/cpu/0/availability").unwrap(),
            "online"
        );
        assert_eq!(
            store.read("/local/domain/1/cpu/1/availability").unwrap(),
            "online"
        );
        assert!(store.read("/local/domain/1/cpu/2/availability").is_err());
    }
}
