// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Thin, synchronous, typed surface over the hypervisor control boundary.
//!
//! Every call maps onto one privileged operation; no policy lives here.
//! Failures carry the hypervisor's own message text and are translated into
//! the public taxonomy by the callers that know the context.

use serde::{Deserialize, Serialize};

use crate::cpuid::LeafMasks;
use crate::DomId;

/// A failed hypervisor call, with the raw message text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("hypervisor call failed: {0}")]
pub struct HypervisorError(pub String);

/// Shorthand result type for hypervisor calls.
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Reason a domain shut down, or is asked to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// Clean power-off; the domain is gone for good.
    Poweroff,
    /// The guest wants to come back up.
    Reboot,
    /// The guest rendezvoused with a suspend request.
    Suspend,
    /// The guest crashed.
    Crash,
    /// Halted without restart.
    Halt,
}

impl ShutdownReason {
    /// The textual form written to `control/shutdown`. `Crash` is observed,
    /// never requested, so it has no textual form.
    pub fn as_request_str(&self) -> Option<&'static str> {
        match self {
            ShutdownReason::Poweroff => Some("poweroff"),
            ShutdownReason::Reboot => Some("reboot"),
            ShutdownReason::Suspend => Some("suspend"),
            ShutdownReason::Halt => Some("halt"),
            ShutdownReason::Crash => None,
        }
    }

    /// Decodes the hypervisor's numeric shutdown code.
    pub fn from_code(code: u32) -> Option<ShutdownReason> {
        match code {
            0 => Some(ShutdownReason::Poweroff),
            1 => Some(ShutdownReason::Reboot),
            2 => Some(ShutdownReason::Suspend),
            3 => Some(ShutdownReason::Crash),
            4 => Some(ShutdownReason::Halt),
            _ => None,
        }
    }

    /// The hypervisor's numeric code for this reason.
    pub fn to_code(self) -> u32 {
        match self {
            ShutdownReason::Poweroff => 0,
            ShutdownReason::Reboot => 1,
            ShutdownReason::Suspend => 2,
            ShutdownReason::Crash => 3,
            ShutdownReason::Halt => 4,
        }
    }
}

/// Flags for domain creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFlags {
    /// Hardware-virtualized guest.
    pub hvm: bool,
    /// Use hardware-assisted paging when available.
    pub hap: bool,
}

/// One row of the hypervisor's domain list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomInfo {
    /// Domain identifier.
    pub domid: DomId,
    /// The caller-provided handle (VM UUID) stamped at creation.
    pub uuid: String,
    /// Hardware-virtualized guest.
    pub hvm_guest: bool,
    /// The domain has shut down.
    pub shutdown: bool,
    /// Raw shutdown code, meaningful only when `shutdown` is set.
    pub shutdown_code: Option<u32>,
    /// Memory currently owned by the domain, in pages.
    pub total_memory_pages: u64,
}

impl DomInfo {
    /// Decoded shutdown reason, when the domain has shut down.
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        if !self.shutdown {
            return None;
        }
        self.shutdown_code.and_then(ShutdownReason::from_code)
    }
}

/// The hypervisor primitives the engine consumes.
pub trait HypervisorControl: Send + Sync {
    /// Creates an empty domain and returns its identifier.
    fn domain_create(&self, ssidref: u32, flags: CreateFlags, uuid: &str) -> Result<DomId>;
    /// Destroys a domain; its resources are reclaimed asynchronously.
    fn domain_destroy(&self, domid: DomId) -> Result<()>;
    /// Pauses all VCPUs.
    fn domain_pause(&self, domid: DomId) -> Result<()>;
    /// Unpauses all VCPUs.
    fn domain_unpause(&self, domid: DomId) -> Result<()>;
    /// Forces a shutdown with the given reason, bypassing the guest.
    fn domain_shutdown(&self, domid: DomId, reason: ShutdownReason) -> Result<()>;
    /// Queries one domain.
    fn domain_getinfo(&self, domid: DomId) -> Result<DomInfo>;
    /// Lists domains starting at `start`.
    fn domain_getinfolist(&self, start: DomId) -> Result<Vec<DomInfo>>;
    /// Re-stamps the domain's handle (VM UUID).
    fn domain_sethandle(&self, domid: DomId, uuid: &str) -> Result<()>;
    /// Allocates an unbound event channel toward `remote`; returns the port.
    fn evtchn_alloc_unbound(&self, domid: DomId, remote: DomId) -> Result<u32>;
    /// Current shadow page-table allocation, in MiB.
    fn shadow_allocation_get(&self, domid: DomId) -> Result<u64>;
    /// Sets the shadow page-table allocation, in MiB.
    fn shadow_allocation_set(&self, domid: DomId, mib: u64) -> Result<()>;
    /// Sets the domain's maximum memory, in KiB.
    fn domain_setmaxmem(&self, domid: DomId, kib: u64) -> Result<()>;
    /// Caps the pseudo-physical memory map, in KiB.
    fn domain_set_memmap_limit(&self, domid: DomId, kib: u64) -> Result<()>;
    /// Sets the maximum VCPU count; must precede building.
    fn domain_max_vcpus(&self, domid: DomId, count: u32) -> Result<()>;
    /// Pins one VCPU to the physical CPUs in the 64-bit bitmap.
    fn vcpu_affinity_set(&self, domid: DomId, vcpu: u32, mask: u64) -> Result<()>;
    /// Reads one VCPU's affinity bitmap.
    fn vcpu_affinity_get(&self, domid: DomId, vcpu: u32) -> Result<u64>;
    /// Grants or revokes an I/O-port range.
    fn domain_ioport_permission(
        &self,
        domid: DomId,
        first_port: u32,
        count: u32,
        allow: bool,
    ) -> Result<()>;
    /// Grants or revokes a machine-memory range.
    fn domain_iomem_permission(
        &self,
        domid: DomId,
        first_pfn: u64,
        count: u64,
        allow: bool,
    ) -> Result<()>;
    /// Grants or revokes an IRQ.
    fn domain_irq_permission(&self, domid: DomId, irq: u32, allow: bool) -> Result<()>;
    /// Installs one leaf of CPUID masking policy.
    fn domain_cpuid_set(
        &self,
        domid: DomId,
        leaf: u32,
        subleaf: Option<u32>,
        masks: &LeafMasks,
    ) -> Result<()>;
    /// Applies the installed CPUID policy to the domain.
    fn domain_cpuid_apply(&self, domid: DomId) -> Result<()>;
    /// Checks a policy leaf against the host; true when the host satisfies
    /// it.
    fn cpuid_check(&self, leaf: u32, subleaf: Option<u32>, masks: &LeafMasks) -> Result<bool>;
    /// Suppresses spurious page faults during early guest boot.
    fn domain_suppress_spurious_page_faults(&self, domid: DomId) -> Result<()>;
    /// Constrains the guest-visible machine address width, in bits.
    fn domain_set_machine_address_size(&self, domid: DomId, bits: u32) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_reason_codes_round_trip() {
        for code in 0..=4 {
            let reason = ShutdownReason::from_code(code).unwrap();
            assert_eq!(reason.to_code(), code);
        }
        assert!(ShutdownReason::from_code(9).is_none());
    }

    #[test]
    fn test_crash_is_not_requestable() {
        assert!(ShutdownReason::Crash.as_request_str().is_none());
        assert_eq!(ShutdownReason::Poweroff.as_request_str(), Some("poweroff"));
        assert_eq!(ShutdownReason::Halt.as_request_str(), Some("halt"));
    }

    #[test]
    fn test_dominfo_shutdown_reason() {
        let mut info = DomInfo {
            domid: DomId(3),
            uuid: "u".into(),
            hvm_guest: false,
            shutdown: false,
            shutdown_code: Some(1),
            total_memory_pages: 0,
        };
        assert_eq!(info.shutdown_reason(), None);
        info.shutdown = true;
        assert_eq!(info.shutdown_reason(), Some(ShutdownReason::Reboot));
    }
}
