// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! PCI passthrough.
//!
//! PV guests get the device through the kernel pciback driver plus explicit
//! hypervisor grants for its IRQ and I/O resources. HVM guests get it
//! hot-plugged through the device model's command channel.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::devices::{self, dm, DeviceKind};
use crate::hypervisor::HypervisorControl;
use crate::store::Store;
use crate::{DomId, Error, Result};

/// A host PCI address, `dddd:bb:ss.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciAddress {
    /// PCI domain.
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Slot number.
    pub slot: u8,
    /// Function number.
    pub func: u8,
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.func
        )
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = || -> Option<PciAddress> {
            let (rest, func) = s.rsplit_once('.')?;
            let mut parts = rest.split(':');
            let domain = u16::from_str_radix(parts.next()?, 16).ok()?;
            let bus = u8::from_str_radix(parts.next()?, 16).ok()?;
            let slot = u8::from_str_radix(parts.next()?, 16).ok()?;
            if parts.next().is_some() {
                return None;
            }
            Some(PciAddress {
                domain,
                bus,
                slot,
                func: u8::from_str_radix(func, 16).ok()?,
            })
        };
        parse().ok_or_else(|| Error::InternalError(format!("bad PCI address: {}", s)))
    }
}

/// Host resources granted to the guest along with the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciResources {
    /// Legacy interrupt line.
    pub irq: Option<u32>,
    /// I/O-port ranges as (first, count).
    pub io_ranges: Vec<(u32, u32)>,
    /// Machine-memory ranges as (first pfn, count).
    pub mem_ranges: Vec<(u64, u64)>,
}

/// Caller-facing description of one passed-through device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciSpec {
    /// Logical device id, the caller's stable handle.
    pub id: String,
    /// Virtual slot position in the guest.
    pub position: u32,
    /// Host device address.
    pub address: PciAddress,
    /// Translate MSIs through the device model.
    pub msitranslate: bool,
    /// Expose native PCI power management.
    pub power_mgmt: bool,
    /// Granted host resources.
    pub resources: PciResources,
}

/// Binds the host device to the passthrough backend and records it in the
/// tree; common to both guest styles.
pub fn bind(store: &dyn Store, domid: DomId, backend_domid: DomId, spec: &PciSpec) -> Result<u32> {
    let devid = spec.position;
    let mut frontend_keys = BTreeMap::new();
    frontend_keys.insert("dev".into(), spec.address.to_string());

    let mut backend_keys = BTreeMap::new();
    backend_keys.insert(format!("dev-{}", devid), spec.address.to_string());
    backend_keys.insert("num_devs".into(), "1".into());
    backend_keys.insert("msitranslate".into(), u32::from(spec.msitranslate).to_string());
    backend_keys.insert("pci_power_mgmt".into(), u32::from(spec.power_mgmt).to_string());

    devices::add_device(
        store,
        domid,
        backend_domid,
        DeviceKind::Pci,
        devid,
        &spec.id,
        &frontend_keys,
        &backend_keys,
    )?;
    Ok(devid)
}

/// Grants the device's host resources and plugs it into a PV guest.
pub fn plug_pv(
    hv: &dyn HypervisorControl,
    store: &dyn Store,
    domid: DomId,
    backend_domid: DomId,
    spec: &PciSpec,
) -> Result<u32> {
    grant_resources(hv, domid, &spec.resources, true)?;
    let devid = match bind(store, domid, backend_domid, spec) {
        Ok(devid) => devid,
        Err(e) => {
            // Undo the grants so a failed bind leaves nothing behind.
            let _ = grant_resources(hv, domid, &spec.resources, false);
            return Err(e);
        }
    };
    debug!("pci {} plugged into PV domain {}", spec.address, domid);
    Ok(devid)
}

/// Hot-plugs the device into an HVM guest through the device model.
pub fn plug_hvm(
    store: &dyn Store,
    domid: DomId,
    backend_domid: DomId,
    spec: &PciSpec,
    ack_timeout: Duration,
) -> Result<u32> {
    let devid = bind(store, domid, backend_domid, spec)?;
    let parameter = format!("{}@{}", spec.address, spec.position);
    if let Err(e) = dm::signal_command(store, domid, "pci-ins", Some(&parameter), ack_timeout) {
        let _ = devices::remove_device(store, domid, DeviceKind::Pci, devid);
        return Err(e);
    }
    debug!("pci {} hot-plugged into HVM domain {}", spec.address, domid);
    Ok(devid)
}

/// Unplugs from an HVM guest through the device model, then releases.
pub fn unplug_hvm(
    store: &dyn Store,
    domid: DomId,
    spec: &PciSpec,
    ack_timeout: Duration,
) -> Result<()> {
    let parameter = format!("{}@{}", spec.address, spec.position);
    dm::signal_command(store, domid, "pci-rem", Some(&parameter), ack_timeout)?;
    devices::remove_device(store, domid, DeviceKind::Pci, spec.position)
}

/// Revokes grants and releases a PV passthrough device.
pub fn unplug_pv(
    hv: &dyn HypervisorControl,
    store: &dyn Store,
    domid: DomId,
    spec: &PciSpec,
) -> Result<()> {
    devices::remove_device(store, domid, DeviceKind::Pci, spec.position)?;
    grant_resources(hv, domid, &spec.resources, false)
}

fn grant_resources(
    hv: &dyn HypervisorControl,
    domid: DomId,
    resources: &PciResources,
    allow: bool,
) -> Result<()> {
    if let Some(irq) = resources.irq {
        hv.domain_irq_permission(domid, irq, allow)?;
    }
    for (first, count) in &resources.io_ranges {
        hv.domain_ioport_permission(domid, *first, *count, allow)?;
    }
    for (first, count) in &resources.mem_ranges {
        hv.domain_iomem_permission(domid, *first, *count, allow)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::utilities::SimHypervisor;

    fn spec() -> PciSpec {
        PciSpec {
            id: "gpu".into(),
            position: 0,
            address: "0000:65:00.0".parse().unwrap(),
            msitranslate: true,
            power_mgmt: false,
            resources: PciResources {
                irq: Some(16),
                io_ranges: vec![(0xc000, 0x40)],
                mem_ranges: vec![(0xf000_0, 0x100)],
            },
        }
    }

    #[test]
    fn test_pci_address_round_trip() {
        let address: PciAddress = "0000:65:00.0".parse().unwrap();
        assert_eq!(address.to_string(), "0000:65:00.0");
        let address: PciAddress = "0001:0a:1f.7".parse().unwrap();
        assert_eq!(
            (address.domain, address.bus, address.slot, address.func),
            (1, 0x0a, 0x1f, 7)
        );
        assert!("65:00.0".parse::<PciAddress>().is_err());
        assert!("nonsense".parse::<PciAddress>().is_err());
    }

    #[test]
    fn test_plug_pv_grants_and_binds() {
        let store = MemStore::new();
        let hv = SimHypervisor::new();
        let domid = hv
            .domain_create(0, Default::default(), "11111111-0000-0000-0000-000000000000")
            .unwrap();
        plug_pv(&hv, &store, domid, DomId(0), &spec()).unwrap();
        assert!(hv.irq_granted(domid, 16));
        let back = format!("/local/domain/0/backend/pci/{}/0", domid);
        assert_eq!(store.read(&format!("{}/dev-0", back)).unwrap(), "0000:65:00.0");
        assert_eq!(store.read(&format!("{}/msitranslate", back)).unwrap(), "1");

        unplug_pv(&hv, &store, domid, &spec()).unwrap();
        assert!(!hv.irq_granted(domid, 16));
    }
}
