// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client for the external storage daemon that attaches virtual disk
//! images.
//!
//! A disk is either a raw local path (CDROM ISOs, loopback images) or a
//! named virtual disk resolved to a (storage repository, virtual disk)
//! pair. Attach and activate are separate steps with symmetric teardown;
//! [`with_disk`] scopes the whole sequence so no path leaves an activated
//! disk behind.

use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::task::TaskHandle;
use crate::Error;

/// Errors from the storage daemon.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum StorageError {
    /// No such disk: {0}
    NotFound(String),
    /// Storage backend failure: {0}
    Backend(String),
    /// Storage I/O failure: {0}
    Io(String),
}

/// A storage repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRepo(pub String);

/// A virtual disk identifier within a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisk(pub String);

/// A datapath handle: one consumer's use of one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datapath(pub String);

/// Where a guest disk comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskSource {
    /// A raw path on the host, used as-is.
    Local(PathBuf),
    /// A named virtual disk, resolved through the storage daemon.
    Vdi(String),
}

/// Result of attaching a virtual disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachInfo {
    /// Backend parameter string (a host block path for local backends).
    pub params: String,
    /// UUID of the VM hosting the backend, when the storage daemon knows
    /// it; the engine maps this to a domain id and falls back to the
    /// control domain otherwise.
    pub backend_vm_uuid: Option<String>,
}

/// Operations exposed by the storage daemon.
pub trait StorageService: Send + Sync {
    /// Resolves a disk name to its repository and disk identifiers.
    fn get_by_name(&self, name: &str) -> Result<(StorageRepo, VirtualDisk), StorageError>;
    /// Creates a datapath for `caller`.
    fn dp_create(&self, id: &str, caller: &str) -> Result<Datapath, StorageError>;
    /// Destroys a datapath; `allow_leak` tolerates lingering activations.
    fn dp_destroy(&self, dp: &Datapath, allow_leak: bool) -> Result<(), StorageError>;
    /// Attaches a disk to a datapath.
    fn vdi_attach(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        read_write: bool,
    ) -> Result<AttachInfo, StorageError>;
    /// Activates an attached disk.
    fn vdi_activate(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), StorageError>;
    /// Deactivates an activated disk.
    fn vdi_deactivate(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), StorageError>;
    /// Detaches an attached disk.
    fn vdi_detach(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), StorageError>;
    /// Stamps the disk's content identity (mirror bookkeeping).
    fn vdi_set_content_id(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        content_id: &str,
    ) -> Result<(), StorageError>;
    /// Lists disks with similar content, nearest first.
    fn vdi_similar_content(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<Vec<VirtualDisk>, StorageError>;
    /// Clones a disk.
    fn vdi_clone(&self, sr: &StorageRepo, vdi: &VirtualDisk) -> Result<VirtualDisk, StorageError>;
    /// Snapshots a disk, optionally starting a mirror to `mirror_url`.
    fn vdi_snapshot(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        mirror_url: Option<&str>,
    ) -> Result<VirtualDisk, StorageError>;
    /// Composes a child delta onto its parent.
    fn vdi_compose(
        &self,
        sr: &StorageRepo,
        parent: &VirtualDisk,
        child: &VirtualDisk,
    ) -> Result<(), StorageError>;
}

/// [`StorageService`] speaking line-delimited JSON over the storage
/// daemon's unix socket, one `{method, params}` request per call.
#[derive(Debug, Clone)]
pub struct SocketStorage {
    socket: PathBuf,
}

impl SocketStorage {
    /// Creates a client for the storage daemon listening at `socket`.
    pub fn new(socket: PathBuf) -> Self {
        SocketStorage { socket }
    }

    fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, StorageError> {
        use std::io::{BufRead, BufReader, Write};

        let stream = std::os::unix::net::UnixStream::connect(&self.socket)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let mut writer = stream
            .try_clone()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let request = serde_json::json!({ "method": method, "params": params });
        writeln!(writer, "{}", request).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut line = String::new();
        BufReader::new(stream)
            .read_line(&mut line)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let reply: serde_json::Value = serde_json::from_str(&line)
            .map_err(|e| StorageError::Backend(format!("bad reply: {}", e)))?;
        if let Some(data) = reply.get("success") {
            return Ok(data.clone());
        }
        let message = reply
            .get("failure")
            .and_then(|f| f.as_str())
            .unwrap_or("unintelligible failure");
        if message.starts_with("NotFound") {
            return Err(StorageError::NotFound(message.to_string()));
        }
        Err(StorageError::Backend(message.to_string()))
    }

    fn field<T: serde::de::DeserializeOwned>(
        data: &serde_json::Value,
        key: &str,
    ) -> Result<T, StorageError> {
        data.get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| StorageError::Backend(format!("reply missing {}", key)))
    }
}

impl StorageService for SocketStorage {
    fn get_by_name(&self, name: &str) -> Result<(StorageRepo, VirtualDisk), StorageError> {
        let data = self.call("get_by_name", serde_json::json!({ "name": name }))?;
        Ok((
            StorageRepo(Self::field(&data, "sr")?),
            VirtualDisk(Self::field(&data, "vdi")?),
        ))
    }

    fn dp_create(&self, id: &str, caller: &str) -> Result<Datapath, StorageError> {
        let data = self.call(
            "DP.create",
            serde_json::json!({ "id": id, "caller": caller }),
        )?;
        Ok(Datapath(Self::field(&data, "dp")?))
    }

    fn dp_destroy(&self, dp: &Datapath, allow_leak: bool) -> Result<(), StorageError> {
        self.call(
            "DP.destroy",
            serde_json::json!({ "dp": dp.0, "allow_leak": allow_leak }),
        )?;
        Ok(())
    }

    fn vdi_attach(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        read_write: bool,
    ) -> Result<AttachInfo, StorageError> {
        let data = self.call(
            "VDI.attach",
            serde_json::json!({
                "dp": dp.0, "sr": sr.0, "vdi": vdi.0, "read_write": read_write,
            }),
        )?;
        Ok(AttachInfo {
            params: Self::field(&data, "params")?,
            backend_vm_uuid: data
                .get("backend_vm_uuid")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    fn vdi_activate(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), StorageError> {
        self.call(
            "VDI.activate",
            serde_json::json!({ "dp": dp.0, "sr": sr.0, "vdi": vdi.0 }),
        )?;
        Ok(())
    }

    fn vdi_deactivate(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), StorageError> {
        self.call(
            "VDI.deactivate",
            serde_json::json!({ "dp": dp.0, "sr": sr.0, "vdi": vdi.0 }),
        )?;
        Ok(())
    }

    fn vdi_detach(
        &self,
        dp: &Datapath,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<(), StorageError> {
        self.call(
            "VDI.detach",
            serde_json::json!({ "dp": dp.0, "sr": sr.0, "vdi": vdi.0 }),
        )?;
        Ok(())
    }

    fn vdi_set_content_id(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        content_id: &str,
    ) -> Result<(), StorageError> {
        self.call(
            "VDI.set_content_id",
            serde_json::json!({ "sr": sr.0, "vdi": vdi.0, "content_id": content_id }),
        )?;
        Ok(())
    }

    fn vdi_similar_content(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
    ) -> Result<Vec<VirtualDisk>, StorageError> {
        let data = self.call(
            "VDI.similar_content",
            serde_json::json!({ "sr": sr.0, "vdi": vdi.0 }),
        )?;
        let names: Vec<String> = Self::field(&data, "vdis")?;
        Ok(names.into_iter().map(VirtualDisk).collect())
    }

    fn vdi_clone(&self, sr: &StorageRepo, vdi: &VirtualDisk) -> Result<VirtualDisk, StorageError> {
        let data = self.call(
            "VDI.clone",
            serde_json::json!({ "sr": sr.0, "vdi": vdi.0 }),
        )?;
        Ok(VirtualDisk(Self::field(&data, "vdi")?))
    }

    fn vdi_snapshot(
        &self,
        sr: &StorageRepo,
        vdi: &VirtualDisk,
        mirror_url: Option<&str>,
    ) -> Result<VirtualDisk, StorageError> {
        let data = self.call(
            "VDI.snapshot",
            serde_json::json!({ "sr": sr.0, "vdi": vdi.0, "mirror_url": mirror_url }),
        )?;
        Ok(VirtualDisk(Self::field(&data, "vdi")?))
    }

    fn vdi_compose(
        &self,
        sr: &StorageRepo,
        parent: &VirtualDisk,
        child: &VirtualDisk,
    ) -> Result<(), StorageError> {
        self.call(
            "VDI.compose",
            serde_json::json!({ "sr": sr.0, "parent": parent.0, "child": child.0 }),
        )?;
        Ok(())
    }
}

/// Attaches and activates `disk`, hands `f` a usable local device path, and
/// deactivates/detaches on every exit path. Local disks are passed through
/// untouched.
pub fn with_disk<T>(
    storage: &dyn StorageService,
    task: &TaskHandle,
    dp_id: &str,
    disk: &DiskSource,
    read_write: bool,
    f: impl FnOnce(&Path) -> Result<T, Error>,
) -> Result<T, Error> {
    let name = match disk {
        DiskSource::Local(path) => return f(path),
        DiskSource::Vdi(name) => name,
    };
    task.check_cancel()?;
    let (sr, vdi) = storage.get_by_name(name)?;
    let dp = storage.dp_create(dp_id, "lifecycle-engine")?;
    let attached = storage.vdi_attach(&dp, &sr, &vdi, read_write)?;
    let activated = storage.vdi_activate(&dp, &sr, &vdi);

    let out = match &activated {
        Ok(()) => f(Path::new(&attached.params)),
        Err(e) => Err(e.clone().into()),
    };

    if activated.is_ok() {
        if let Err(e) = storage.vdi_deactivate(&dp, &sr, &vdi) {
            warn!("failed to deactivate {} after use: {}", name, e);
        }
    }
    if let Err(e) = storage.vdi_detach(&dp, &sr, &vdi) {
        warn!("failed to detach {} after use: {}", name, e);
    }
    if let Err(e) = storage.dp_destroy(&dp, false) {
        warn!("failed to destroy datapath {}: {}", dp.0, e);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::SimStorage;

    #[test]
    fn test_with_disk_local_passthrough() {
        let storage = SimStorage::new();
        let task = TaskHandle::new("t");
        let disk = DiskSource::Local(PathBuf::from("/dev/loop7"));
        let seen = with_disk(&storage, &task, "dp0", &disk, false, |path| {
            Ok(path.to_path_buf())
        })
        .unwrap();
        assert_eq!(seen, PathBuf::from("/dev/loop7"));
        assert_eq!(storage.active_count(), 0);
    }

    #[test]
    fn test_with_disk_attach_activate_teardown() {
        let storage = SimStorage::new();
        storage.add_vdi("root-disk", "/dev/sm/backend/1");
        let task = TaskHandle::new("t");
        let disk = DiskSource::Vdi("root-disk".into());
        let seen = with_disk(&storage, &task, "dp0", &disk, true, |path| {
            assert_eq!(storage.active_count(), 1);
            Ok(path.to_path_buf())
        })
        .unwrap();
        assert_eq!(seen, PathBuf::from("/dev/sm/backend/1"));
        assert_eq!(storage.active_count(), 0);
        assert_eq!(storage.attached_count(), 0);
    }

    #[test]
    fn test_with_disk_teardown_on_callback_error() {
        let storage = SimStorage::new();
        storage.add_vdi("root-disk", "/dev/sm/backend/1");
        let task = TaskHandle::new("t");
        let disk = DiskSource::Vdi("root-disk".into());
        let out: Result<(), Error> = with_disk(&storage, &task, "dp0", &disk, true, |_| {
            Err(Error::NoBootableDevice)
        });
        assert_eq!(out, Err(Error::NoBootableDevice));
        assert_eq!(storage.active_count(), 0);
        assert_eq!(storage.attached_count(), 0);
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        let storage = SimStorage::new();
        let task = TaskHandle::new("t");
        let disk = DiskSource::Vdi("missing".into());
        let out: Result<(), Error> = with_disk(&storage, &task, "dp0", &disk, false, |_| Ok(()));
        assert_eq!(out, Err(Error::DoesNotExist));
    }
}
