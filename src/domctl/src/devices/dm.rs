// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The user-space device model that emulates legacy hardware for HVM
//! guests, and the paravirtual framebuffer console for PV guests that ask
//! for one.
//!
//! The model is an external process. It is commanded through its node under
//! the control domain (`device-model/<domid>`): the engine writes a
//! `command` (with an optional `parameter`) and the model acknowledges by
//! setting `state` to `<command>-done`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::store::{read_opt, rm_if_present, Store};
use crate::task::TaskHandle;
use crate::units::{bytes_to_mib, kib_to_bytes};
use crate::{DomId, Error, Result};

const COMMAND_POLL: Duration = Duration::from_millis(10);

/// Control node for a domain's device model.
pub fn dm_path(domid: DomId) -> String {
    format!("/local/domain/0/device-model/{}", domid)
}

/// One emulated NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmNic {
    /// MAC address.
    pub mac: String,
    /// Host bridge to patch into.
    pub bridge: String,
    /// Position on the guest bus.
    pub position: u32,
}

/// One emulated disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmDisk {
    /// Index on the emulated controller.
    pub index: u32,
    /// Host path backing the disk.
    pub path: String,
    /// Expose as a CD drive.
    pub cdrom: bool,
}

/// Guest display configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmDisplay {
    /// Headless.
    None,
    /// VNC framebuffer.
    Vnc {
        /// Emulated video card model.
        video: String,
        /// Listen address.
        ip: String,
        /// TCP port (5900-based).
        port: u16,
        /// Keyboard map.
        keymap: String,
    },
}

/// Full device-model configuration, regenerated from the persistent VM
/// record on every start or restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmConfig {
    /// Guest memory in KiB.
    pub memory_kib: u64,
    /// BIOS boot order (`cdn` style).
    pub boot_order: String,
    /// Serial console device, if any.
    pub serial: Option<String>,
    /// VCPU count.
    pub vcpus: u32,
    /// Emulated NICs.
    pub nics: Vec<DmNic>,
    /// Emulated disks.
    pub disks: Vec<DmDisk>,
    /// Extra PCI emulations.
    pub pci_emulations: Vec<String>,
    /// Emulated USB devices.
    pub usb: Vec<String>,
    /// Expose ACPI.
    pub acpi: bool,
    /// Display configuration.
    pub display: DmDisplay,
    /// The guest has passed-through PCI devices.
    pub pci_passthrough: bool,
    /// Hardware-virtualized guest (false for a PV framebuffer console).
    pub hvm: bool,
    /// Video memory in MiB.
    pub video_mib: u64,
    /// Raw extra arguments, `(flag, optional value)`.
    pub extras: Vec<(String, Option<String>)>,
}

/// Renders the argument vector for the device-model process.
pub fn model_args(domid: DomId, cfg: &DmConfig, restore: Option<&PathBuf>) -> Vec<String> {
    let mut args = vec!["-d".into(), domid.to_string()];
    if cfg.hvm {
        args.push("-m".into());
        args.push(bytes_to_mib(kib_to_bytes(cfg.memory_kib)).to_string());
        args.push("-boot".into());
        args.push(cfg.boot_order.clone());
        args.push("-vcpus".into());
        args.push(cfg.vcpus.to_string());
        if let Some(serial) = &cfg.serial {
            args.push("-serial".into());
            args.push(serial.clone());
        }
        if cfg.acpi {
            args.push("-acpi".into());
        }
        for nic in &cfg.nics {
            args.push("-net".into());
            args.push(format!(
                "nic,vlan={},macaddr={},model=rtl8139",
                nic.position, nic.mac
            ));
            args.push("-net".into());
            args.push(format!("tap,vlan={},bridge={}", nic.position, nic.bridge));
        }
        for disk in &cfg.disks {
            args.push(if disk.cdrom { "-cdrom" } else { "-disk" }.into());
            if disk.cdrom {
                args.push(disk.path.clone());
            } else {
                args.push(format!("{}:{}", disk.index, disk.path));
            }
        }
        for emulation in &cfg.pci_emulations {
            args.push("-pciemulation".into());
            args.push(emulation.clone());
        }
        for usb in &cfg.usb {
            args.push("-usbdevice".into());
            args.push(usb.clone());
        }
        if cfg.pci_passthrough {
            args.push("-priv".into());
        }
        args.push("-videoram".into());
        args.push(cfg.video_mib.to_string());
    } else {
        // PV guests only get the framebuffer console out of the model.
        args.push("-M".into());
        args.push("xenpv".into());
    }
    match &cfg.display {
        DmDisplay::None => args.push("-nographic".into()),
        DmDisplay::Vnc {
            video,
            ip,
            port,
            keymap,
        } => {
            args.push("-std-vga".into());
            args.push(video.clone());
            args.push("-vnc".into());
            args.push(format!("{}:{}", ip, port.saturating_sub(5900)));
            args.push("-k".into());
            args.push(keymap.clone());
        }
    }
    if let Some(path) = restore {
        args.push("-loadvm".into());
        args.push(path.display().to_string());
    }
    for (flag, value) in &cfg.extras {
        args.push(format!("--{}", flag));
        if let Some(value) = value {
            args.push(value.clone());
        }
    }
    args
}

/// Sends one command over the model's control node and waits for its
/// acknowledgement.
pub fn signal_command(
    store: &dyn Store,
    domid: DomId,
    command: &str,
    parameter: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    let base = dm_path(domid);
    if let Some(parameter) = parameter {
        store.write(&format!("{}/parameter", base), parameter)?;
    }
    store.write(&format!("{}/command", base), command)?;

    let wanted = format!("{}-done", command);
    let deadline = Instant::now() + timeout;
    loop {
        if read_opt(store, &format!("{}/state", base))?.as_deref() == Some(wanted.as_str()) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!("device model for domain {} ignored {}", domid, command);
            return Err(Error::BackendTimeout);
        }
        std::thread::sleep(COMMAND_POLL);
    }
}

/// Supervision of the device-model process.
pub trait DmSupervisor: Send + Sync {
    /// Starts a fresh model for the domain.
    fn start(&self, task: &TaskHandle, domid: DomId, cfg: &DmConfig) -> Result<()>;
    /// Starts a model restoring the given saved state.
    fn restore(&self, task: &TaskHandle, domid: DomId, cfg: &DmConfig, state: &[u8])
        -> Result<()>;
    /// Quiesces the model and returns its state blob.
    fn suspend(&self, task: &TaskHandle, domid: DomId) -> Result<Vec<u8>>;
    /// Resumes a suspended model.
    fn resume(&self, task: &TaskHandle, domid: DomId) -> Result<()>;
    /// Stops the model and clears its control node. Idempotent.
    fn stop(&self, domid: DomId) -> Result<()>;
}

/// Process-backed [`DmSupervisor`] driving the emulator binary.
pub struct ProcessSupervisor {
    store: std::sync::Arc<dyn Store>,
    binary: PathBuf,
    state_dir: PathBuf,
    ack_timeout: Duration,
    children: Mutex<HashMap<u32, Child>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("binary", &self.binary)
            .field("state_dir", &self.state_dir)
            .finish()
    }
}

impl ProcessSupervisor {
    /// Creates a supervisor for the emulator at `binary`, with saved state
    /// exchanged under `state_dir`.
    pub fn new(
        store: std::sync::Arc<dyn Store>,
        binary: PathBuf,
        state_dir: PathBuf,
        ack_timeout: Duration,
    ) -> Self {
        ProcessSupervisor {
            store,
            binary,
            state_dir,
            ack_timeout,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn state_file(&self, domid: DomId) -> PathBuf {
        self.state_dir.join(format!("model-save.{}", domid))
    }

    fn spawn(&self, domid: DomId, args: &[String]) -> Result<()> {
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        debug!("device model for domain {} is pid {}", domid, child.id());
        self.children
            .lock()
            .expect("dm children lock poisoned")
            .insert(domid.0, child);
        Ok(())
    }

    fn wait_running(&self, task: &TaskHandle, domid: DomId) -> Result<()> {
        let state_path = format!("{}/state", dm_path(domid));
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            task.check_cancel()?;
            if read_opt(&*self.store, &state_path)?.as_deref() == Some("running") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::BackendTimeout);
            }
            std::thread::sleep(COMMAND_POLL);
        }
    }
}

impl DmSupervisor for ProcessSupervisor {
    fn start(&self, task: &TaskHandle, domid: DomId, cfg: &DmConfig) -> Result<()> {
        self.spawn(domid, &model_args(domid, cfg, None))?;
        self.wait_running(task, domid)
    }

    fn restore(
        &self,
        task: &TaskHandle,
        domid: DomId,
        cfg: &DmConfig,
        state: &[u8],
    ) -> Result<()> {
        let path = self.state_file(domid);
        fs::create_dir_all(&self.state_dir)?;
        fs::write(&path, state)?;
        self.spawn(domid, &model_args(domid, cfg, Some(&path)))?;
        self.wait_running(task, domid)
    }

    fn suspend(&self, task: &TaskHandle, domid: DomId) -> Result<Vec<u8>> {
        task.check_cancel()?;
        signal_command(&*self.store, domid, "save", None, self.ack_timeout)?;
        let blob = fs::read(self.state_file(domid))?;
        Ok(blob)
    }

    fn resume(&self, task: &TaskHandle, domid: DomId) -> Result<()> {
        task.check_cancel()?;
        signal_command(&*self.store, domid, "continue", None, self.ack_timeout)
    }

    fn stop(&self, domid: DomId) -> Result<()> {
        if let Some(mut child) = self
            .children
            .lock()
            .expect("dm children lock poisoned")
            .remove(&domid.0)
        {
            if let Err(e) = child.kill() {
                warn!("failed to kill device model for domain {}: {}", domid, e);
            }
            let _ = child.wait();
        }
        let _ = fs::remove_file(self.state_file(domid));
        rm_if_present(&*self.store, &dm_path(domid))?;
        Ok(())
    }
}
