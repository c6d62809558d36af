// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual network interface frontends and backends.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::devices::{self, DeviceKind};
use crate::store::Store;
use crate::{DomId, Result, VmId};

/// Where a network interface is patched in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkKind {
    /// Kernel bridge by name.
    Bridge(String),
    /// Virtual switch by name.
    VSwitch(String),
    /// Backend driver domain, addressed by its VM identity and the device
    /// id it serves.
    Netback(VmId, String),
}

/// Caller-facing description of one network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VifSpec {
    /// Logical device id, the caller's stable handle.
    pub id: String,
    /// Interface position on the guest bus; doubles as the tree device
    /// number.
    pub position: u32,
    /// MAC address string.
    pub mac: String,
    /// Interface MTU.
    pub mtu: u32,
    /// Rate limit as (kbytes/s, timeslice µs).
    pub rate: Option<(u64, u64)>,
    /// Attachment point.
    pub network: NetworkKind,
    /// Initial carrier state.
    pub carrier: bool,
    /// Opaque keys forwarded to the backend scripts after validation.
    pub other_config: BTreeMap<String, String>,
}

/// Plugs a network frontend/backend pair; returns the tree device number.
pub fn add(
    store: &dyn Store,
    frontend_domid: DomId,
    backend_domid: DomId,
    spec: &VifSpec,
) -> Result<u32> {
    let devid = spec.position;

    let mut frontend_keys = BTreeMap::new();
    frontend_keys.insert("handle".into(), devid.to_string());
    frontend_keys.insert("mac".into(), spec.mac.clone());
    frontend_keys.insert("mtu".into(), spec.mtu.to_string());

    let mut backend_keys = BTreeMap::new();
    backend_keys.insert("handle".into(), devid.to_string());
    backend_keys.insert("mac".into(), spec.mac.clone());
    backend_keys.insert("mtu".into(), spec.mtu.to_string());
    backend_keys.insert("online-carrier".into(), u32::from(spec.carrier).to_string());
    match &spec.network {
        NetworkKind::Bridge(name) => {
            backend_keys.insert("bridge".into(), name.clone());
        }
        NetworkKind::VSwitch(name) => {
            backend_keys.insert("bridge".into(), name.clone());
            backend_keys.insert("vswitch".into(), "1".into());
        }
        NetworkKind::Netback(vm, remote_id) => {
            backend_keys.insert("netback-vm".into(), vm.0.clone());
            backend_keys.insert("netback-id".into(), remote_id.clone());
        }
    }
    if let Some((kbytes_per_s, timeslice_us)) = spec.rate {
        backend_keys.insert("rate".into(), format!("{},{}", kbytes_per_s, timeslice_us));
    }
    for (key, value) in &spec.other_config {
        backend_keys.insert(format!("other-config/{}", key), value.clone());
    }

    devices::add_device(
        store,
        frontend_domid,
        backend_domid,
        DeviceKind::Vif,
        devid,
        &spec.id,
        &frontend_keys,
        &backend_keys,
    )?;
    debug!(
        "vif {} ({}) plugged for domain {}",
        devid, spec.mac, frontend_domid
    );
    Ok(devid)
}

/// Releases every tree record of the interface.
pub fn release(store: &dyn Store, domid: DomId, devid: u32) -> Result<()> {
    devices::remove_device(store, domid, DeviceKind::Vif, devid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn spec(position: u32, network: NetworkKind) -> VifSpec {
        VifSpec {
            id: format!("nic-{}", position),
            position,
            mac: "de:ad:be:ef:00:01".into(),
            mtu: 1500,
            rate: Some((1024, 50_000)),
            network,
            carrier: true,
            other_config: BTreeMap::new(),
        }
    }

    #[test]
    fn test_add_bridge_vif() {
        let store = MemStore::new();
        let devid = add(
            &store,
            DomId(6),
            DomId(0),
            &spec(0, NetworkKind::Bridge("xenbr0".into())),
        )
        .unwrap();
        assert_eq!(devid, 0);
        let back = "/local/domain/0/backend/vif/6/0";
        assert_eq!(store.read(&format!("{}/bridge", back)).unwrap(), "xenbr0");
        assert_eq!(store.read(&format!("{}/rate", back)).unwrap(), "1024,50000");
        assert_eq!(
            store.read("/private/6/vif/0/vif-id").unwrap(),
            "nic-0"
        );
    }

    #[test]
    fn test_add_netback_vif() {
        let store = MemStore::new();
        add(
            &store,
            DomId(6),
            DomId(0),
            &spec(1, NetworkKind::Netback(VmId("driver-vm".into()), "0".into())),
        )
        .unwrap();
        let back = "/local/domain/0/backend/vif/6/1";
        assert_eq!(
            store.read(&format!("{}/netback-vm", back)).unwrap(),
            "driver-vm"
        );
    }

    #[test]
    fn test_release() {
        let store = MemStore::new();
        let devid = add(
            &store,
            DomId(6),
            DomId(0),
            &spec(0, NetworkKind::Bridge("xenbr0".into())),
        )
        .unwrap();
        release(&store, DomId(6), devid).unwrap();
        assert!(store.read("/local/domain/6/device/vif/0/state").is_err());
    }
}
