// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The persistent per-VM record and its file-backed store.
//!
//! One record exists whenever any host-side resource survives for a VM —
//! a memory reservation, a device frontend, a suspended-state image, a
//! device-model process — and is removed only once nothing remains. Records
//! are single JSON files written atomically (temp file, fsync, rename) so a
//! crash mid-write never leaves a torn record behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cpuid::LeafPolicy;
use crate::devices::pci::PciSpec;
use crate::devices::vbd::VbdSpec;
use crate::devices::vif::VifSpec;
use crate::{DomId, Error, Result, VmId};

/// How a domain was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInfo {
    /// Hardware-virtualized guest.
    pub hvm: bool,
    /// Use hardware-assisted paging when available.
    pub hap: bool,
    /// Security identifier passed to the hypervisor.
    pub ssidref: u32,
    /// Guest name published in the tree.
    pub name: String,
    /// Initial control-tree data written under the domain root.
    pub xsdata: BTreeMap<String, String>,
    /// Platform keys published read-only to the guest.
    pub platformdata: BTreeMap<String, String>,
}

/// The builder flavor a domain was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuilderFlavor {
    /// HVM loader.
    Hvm,
    /// Paravirtual with a caller-supplied kernel.
    DirectPv,
    /// Paravirtual with the kernel extracted by a bootloader.
    IndirectPv,
}

/// HVM loader parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HvmParams {
    /// Expose PAE.
    pub pae: bool,
    /// Expose an APIC.
    pub apic: bool,
    /// Expose ACPI.
    pub acpi: bool,
    /// Expose NX.
    pub nx: bool,
    /// Expose Viridian enlightenments.
    pub viridian: bool,
    /// RTC offset from UTC in seconds, kept as text.
    pub timeoffset: String,
    /// Shadow page-table multiplier.
    pub shadow_multiplier: f64,
    /// Video memory in MiB.
    pub video_mib: u64,
}

/// Direct-PV build parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectPvParams {
    /// Kernel image on the host.
    pub kernel: PathBuf,
    /// Kernel command line.
    pub cmdline: String,
    /// Optional initial ramdisk.
    pub ramdisk: Option<PathBuf>,
}

/// Indirect-PV build parameters: a bootloader extracts the kernel from the
/// first boot disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectPvParams {
    /// Bootloader to run (`pygrub`-style).
    pub bootloader: String,
    /// Extra arguments handed to the bootloader.
    pub extra_args: String,
    /// Logical id of the boot disk.
    pub boot_disk: String,
}

/// Flavor-specific build parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuildPlan {
    /// HVM loader.
    Hvm(HvmParams),
    /// Paravirtual, caller-supplied kernel.
    DirectPv(DirectPvParams),
    /// Paravirtual, bootloader-extracted kernel.
    IndirectPv(IndirectPvParams),
}

impl BuildPlan {
    /// The flavor tag recorded after a successful build.
    pub fn flavor(&self) -> BuilderFlavor {
        match self {
            BuildPlan::Hvm(_) => BuilderFlavor::Hvm,
            BuildPlan::DirectPv(_) => BuilderFlavor::DirectPv,
            BuildPlan::IndirectPv(_) => BuilderFlavor::IndirectPv,
        }
    }
}

/// Build parameters persisted after a successful build; enough to rebuild
/// the domain on reboot or resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Maximum memory in KiB.
    pub memory_max_kib: u64,
    /// Initial target memory in KiB.
    pub memory_target_kib: u64,
    /// VCPU count.
    pub vcpus: u32,
    /// Flavor-specific parameters.
    pub plan: BuildPlan,
}

/// The persistent per-VM record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmExtra {
    /// Current or most recent domain id.
    pub domid: DomId,
    /// How the domain is created.
    pub create_info: CreateInfo,
    /// How the caller wants the domain built.
    pub plan: BuildPlan,
    /// Build parameters, present once built.
    pub build_info: Option<BuildInfo>,
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
    /// Bytes of the resumable suspend image; 0 when none exists.
    pub suspend_memory_bytes: u64,
    /// Builder flavor used, once built.
    pub ty: Option<BuilderFlavor>,
    /// Snapshot of plugged block devices.
    pub vbds: Vec<VbdSpec>,
    /// Snapshot of plugged network interfaces.
    pub vifs: Vec<VifSpec>,
    /// Snapshot of passed-through PCI devices.
    pub pcis: Vec<PciSpec>,
    /// CPUID masking policy applied after build.
    pub cpuid: Vec<LeafPolicy>,
    /// Seconds since the epoch of the last domain creation.
    pub last_create_time: u64,
}

impl VmExtra {
    /// Stamps `last_create_time` with the current wall clock.
    pub fn touch_create_time(&mut self) {
        self.last_create_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
    }
}

/// File-backed keyed store of [`VmExtra`] records: one subtree per VM under
/// the state root.
#[derive(Debug, Clone)]
pub struct ExtraStore {
    root: PathBuf,
}

impl ExtraStore {
    /// Opens (creating if needed) the store under `root`.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("vm"))?;
        Ok(ExtraStore {
            root: root.to_path_buf(),
        })
    }

    fn validate(vm: &VmId) -> Result<()> {
        if vm.0.is_empty()
            || !vm
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::InternalError(format!("unsafe VM id: {:?}", vm.0)));
        }
        Ok(())
    }

    fn record_dir(&self, vm: &VmId) -> PathBuf {
        self.root.join("vm").join(&vm.0)
    }

    fn record_path(&self, vm: &VmId) -> PathBuf {
        self.record_dir(vm).join("extra")
    }

    /// Where the VM's suspend image lives.
    pub fn suspend_image_path(&self, vm: &VmId) -> PathBuf {
        self.record_dir(vm).join("suspend-image")
    }

    /// Reads a record; `None` when the VM has none.
    pub fn read(&self, vm: &VmId) -> Result<Option<VmExtra>> {
        Self::validate(vm)?;
        let bytes = match fs::read(self.record_path(vm)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::InternalError(format!("corrupt record for {}: {}", vm, e)))
    }

    /// Writes a record atomically.
    pub fn write(&self, vm: &VmId, extra: &VmExtra) -> Result<()> {
        Self::validate(vm)?;
        let dir = self.record_dir(vm);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(".extra.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(
                &serde_json::to_vec_pretty(extra)
                    .map_err(|e| Error::InternalError(format!("encode record: {}", e)))?,
            )?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.record_path(vm))?;
        Ok(())
    }

    /// Removes the VM's whole subtree (record, suspend image); absent is
    /// fine.
    pub fn delete(&self, vm: &VmId) -> Result<()> {
        Self::validate(vm)?;
        match fs::remove_dir_all(self.record_dir(vm)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists every VM with a record.
    pub fn list(&self) -> Result<Vec<VmId>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.root.join("vm"))? {
            let entry = entry?;
            if entry.path().join("extra").is_file() {
                out.push(VmId(entry.file_name().to_string_lossy().into_owned()));
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    pub(crate) fn sample_extra() -> VmExtra {
        VmExtra {
            domid: DomId(3),
            create_info: CreateInfo {
                hvm: false,
                hap: false,
                ssidref: 0,
                name: "guest".into(),
                xsdata: BTreeMap::new(),
                platformdata: BTreeMap::new(),
            },
            plan: BuildPlan::DirectPv(DirectPvParams {
                kernel: "/tmp/k".into(),
                cmdline: "root=/dev/xvda1".into(),
                ramdisk: None,
            }),
            build_info: Some(BuildInfo {
                memory_max_kib: 262_144,
                memory_target_kib: 262_144,
                vcpus: 1,
                plan: BuildPlan::DirectPv(DirectPvParams {
                    kernel: "/tmp/k".into(),
                    cmdline: "root=/dev/xvda1".into(),
                    ramdisk: None,
                }),
            }),
            vcpus: 1,
            shadow_multiplier: 1.0,
            memory_static_max: 268_435_456,
            memory_dynamic_min: 268_435_456,
            memory_dynamic_max: 268_435_456,
            suspend_memory_bytes: 0,
            ty: Some(BuilderFlavor::DirectPv),
            vbds: Vec::new(),
            vifs: Vec::new(),
            pcis: Vec::new(),
            cpuid: Vec::new(),
            last_create_time: 0,
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ExtraStore::new(dir.as_path()).unwrap();
        let vm = VmId("11111111-1111-1111-1111-111111111111".into());
        assert!(store.read(&vm).unwrap().is_none());
        let extra = sample_extra();
        store.write(&vm, &extra).unwrap();
        assert_eq!(store.read(&vm).unwrap(), Some(extra));
        assert_eq!(store.list().unwrap(), vec![vm.clone()]);
        store.delete(&vm).unwrap();
        assert!(store.read(&vm).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_overwrite_keeps_last_write() {
        let dir = TempDir::new().unwrap();
        let store = ExtraStore::new(dir.as_path()).unwrap();
        let vm = VmId("22222222-2222-2222-2222-222222222222".into());
        let mut extra = sample_extra();
        store.write(&vm, &extra).unwrap();
        extra.suspend_memory_bytes = 268_435_456;
        extra.domid = DomId(9);
        store.write(&vm, &extra).unwrap();
        let read = store.read(&vm).unwrap().unwrap();
        assert_eq!(read.suspend_memory_bytes, 268_435_456);
        assert_eq!(read.domid, DomId(9));
    }

    #[test]
    fn test_leftover_temp_file_is_ignored() {
        // A crash between temp write and rename leaves only the temp file;
        // the record must read as absent.
        let dir = TempDir::new().unwrap();
        let store = ExtraStore::new(dir.as_path()).unwrap();
        let vm = VmId("33333333-3333-3333-3333-333333333333".into());
        let record_dir = dir.as_path().join("vm").join(vm.as_str());
        fs::create_dir_all(&record_dir).unwrap();
        fs::write(record_dir.join(".extra.tmp"), b"{ half a rec").unwrap();
        assert!(store.read(&vm).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_unsafe_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ExtraStore::new(dir.as_path()).unwrap();
        for bad in ["../escape", "a/b", ""] {
            assert!(store.read(&VmId(bad.into())).is_err());
        }
    }

    #[test]
    fn test_delete_is_recursive() {
        let dir = TempDir::new().unwrap();
        let store = ExtraStore::new(dir.as_path()).unwrap();
        let vm = VmId("44444444-4444-4444-4444-444444444444".into());
        store.write(&vm, &sample_extra()).unwrap();
        fs::write(store.suspend_image_path(&vm), b"image bytes").unwrap();
        store.delete(&vm).unwrap();
        assert!(!store.suspend_image_path(&vm).exists());
    }
}
