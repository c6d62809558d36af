// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The request/response surface the orchestrator drives.
//!
//! Requests are JSON `{method, params}` envelopes; responses are either
//! `{"success": data}` or `{"failure": error}` with the closed error
//! taxonomy as payload. Lifecycle operations are executed through the
//! per-VM work queues, so two requests against the same VM are totally
//! ordered while different VMs proceed in parallel; migration-like
//! streaming jobs run on a separate long-running pool. `UPDATES.get` is
//! answered inline from the bus.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::devices::pci::PciSpec;
use crate::devices::vbd::VbdSpec;
use crate::devices::vif::VifSpec;
use crate::devices::DeviceKind;
use crate::hypervisor::ShutdownReason;
use crate::lifecycle::{Engine, VmSpec};
use crate::storage::DiskSource;
use crate::task::TaskHandle;
use crate::updates::WorkPool;
use crate::{Error, Result, VmId};

/// One request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Dotted method name, e.g. `VM.create`.
    pub method: String,
    /// Method-specific parameters.
    #[serde(default)]
    pub params: Value,
}

/// One response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The operation succeeded with this payload.
    #[serde(rename = "success")]
    Success(Value),
    /// The operation failed with a taxonomy error.
    #[serde(rename = "failure")]
    Failure(Error),
}

#[derive(Debug, Deserialize)]
struct VmOnlyParams {
    vm: VmId,
}

#[derive(Debug, Deserialize)]
struct VmCreateParams {
    vm: VmId,
    spec: VmSpec,
}

#[derive(Debug, Deserialize)]
struct VmBuildParams {
    vm: VmId,
    #[serde(default)]
    vbds: Vec<VbdSpec>,
    #[serde(default)]
    vifs: Vec<VifSpec>,
}

#[derive(Debug, Deserialize)]
struct VmShutdownParams {
    vm: VmId,
    reason: ShutdownReason,
    ack_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VmDestroyParams {
    vm: VmId,
    #[serde(default)]
    preserve_vm_path: bool,
}

#[derive(Debug, Deserialize)]
struct VmReceiveMemoryParams {
    vm: VmId,
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct VmSetInternalParams {
    vm: VmId,
    state: Value,
}

#[derive(Debug, Deserialize)]
struct VbdPlugParams {
    vm: VmId,
    spec: VbdSpec,
}

#[derive(Debug, Deserialize)]
struct VifPlugParams {
    vm: VmId,
    spec: VifSpec,
}

#[derive(Debug, Deserialize)]
struct PciPlugParams {
    vm: VmId,
    spec: PciSpec,
}

#[derive(Debug, Deserialize)]
struct DeviceRefParams {
    vm: VmId,
    id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct VbdInsertParams {
    vm: VmId,
    id: String,
    disk: DiskSource,
}

#[derive(Debug, Deserialize)]
struct UpdatesGetParams {
    last: u64,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct DebugParams {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Routes requests onto the engine through the work queues.
#[derive(Debug)]
pub struct Dispatcher {
    engine: Arc<Engine>,
    lifecycle_pool: WorkPool,
    streaming_pool: WorkPool,
    next_task: AtomicU64,
    // Armed by DEBUG.trigger to exercise cancellation cleanup paths.
    cancel_trip_point: AtomicU64,
}

impl Dispatcher {
    /// Creates a dispatcher with per-VM queues of the given capacity.
    pub fn new(engine: Arc<Engine>, queue_capacity: usize) -> Self {
        Dispatcher {
            engine,
            lifecycle_pool: WorkPool::new("vm", queue_capacity),
            streaming_pool: WorkPool::new("vm-slow", queue_capacity),
            next_task: AtomicU64::new(1),
            cancel_trip_point: AtomicU64::new(0),
        }
    }

    /// Handles one request end to end; never panics the caller, never
    /// leaks a non-taxonomy error.
    pub fn handle(&self, request: Request) -> Response {
        match self.dispatch(request) {
            Ok(data) => Response::Success(data),
            Err(error) => Response::Failure(error),
        }
    }

    fn task(&self, method: &str) -> TaskHandle {
        let id = self.next_task.fetch_add(1, Ordering::SeqCst);
        let task = TaskHandle::new(format!("{}-{}", method, id));
        let trip = self.cancel_trip_point.load(Ordering::SeqCst);
        if trip != 0 {
            task.set_cancel_trip_point(u32::try_from(trip).unwrap_or(u32::MAX));
        }
        task
    }

    fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
        serde_json::from_value(params)
            .map_err(|e| Error::InternalError(format!("bad parameters: {}", e)))
    }

    // Runs a lifecycle operation on the VM's serial queue.
    fn queued<T: Serialize + Send + 'static>(
        &self,
        pool: &WorkPool,
        vm: &VmId,
        f: impl FnOnce(Arc<Engine>) -> Result<T> + Send + 'static,
    ) -> Result<Value> {
        let engine = self.engine.clone();
        let out = pool.run(vm, move || f(engine))??;
        serde_json::to_value(out).map_err(|e| Error::InternalError(format!("encode: {}", e)))
    }

    fn dispatch(&self, request: Request) -> Result<Value> {
        let method = request.method.clone();
        let task = self.task(&method);
        match method.as_str() {
            "VM.create" => {
                let p: VmCreateParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.create(&task, &p.vm, &p.spec)
                })
            }
            "VM.build" => {
                let p: VmBuildParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.build(&task, &p.vm, &p.vbds, &p.vifs)
                })
            }
            "VM.pause" => {
                let p: VmOnlyParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.pause(&task, &p.vm)
                })
            }
            "VM.unpause" => {
                let p: VmOnlyParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.unpause(&task, &p.vm)
                })
            }
            "VM.create_device_model" => {
                let p: VmOnlyParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.start_device_model(&task, &p.vm)
                })
            }
            "VM.shutdown" => {
                let p: VmShutdownParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    let timeout = Duration::from_millis(p.ack_timeout_ms.unwrap_or(30_000));
                    engine.request_shutdown(&task, &p.vm, p.reason, timeout)
                })
            }
            "VM.suspend" => {
                let p: VmOnlyParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.suspend(&task, &p.vm)
                })
            }
            "VM.restore" => {
                let p: VmOnlyParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.restore(&task, &p.vm)
                })
            }
            "VM.receive_memory" => {
                let p: VmReceiveMemoryParams = Self::parse(request.params)?;
                // Streaming restores must not block ordinary lifecycle
                // operations on other queues.
                self.queued(&self.streaming_pool, &p.vm.clone(), move |engine| {
                    engine.receive_memory(&task, &p.vm, &p.path)
                })
            }
            "VM.destroy" => {
                let p: VmDestroyParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.destroy(&task, &p.vm, p.preserve_vm_path)
                })
            }
            "VM.get_state" => {
                let p: VmOnlyParams = Self::parse(request.params)?;
                serde_json::to_value(self.engine.get_state(&p.vm)?)
                    .map_err(|e| Error::InternalError(format!("encode: {}", e)))
            }
            "VM.get_domain_action_request" => {
                let p: VmOnlyParams = Self::parse(request.params)?;
                serde_json::to_value(self.engine.get_domain_action_request(&p.vm)?)
                    .map_err(|e| Error::InternalError(format!("encode: {}", e)))
            }
            "VM.get_internal_state" => {
                let p: VmOnlyParams = Self::parse(request.params)?;
                self.engine.get_internal_state(&p.vm)
            }
            "VM.set_internal_state" => {
                let p: VmSetInternalParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.set_internal_state(&p.vm, p.state)
                })
            }
            "VBD.plug" => {
                let p: VbdPlugParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.vbd_plug(&task, &p.vm, &p.spec)
                })
            }
            "VBD.unplug" => {
                let p: DeviceRefParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.vbd_unplug(&task, &p.vm, &p.id, p.force)
                })
            }
            "VBD.insert" => {
                let p: VbdInsertParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.vbd_insert(&task, &p.vm, &p.id, p.disk)
                })
            }
            "VBD.eject" => {
                let p: DeviceRefParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.vbd_eject(&task, &p.vm, &p.id)
                })
            }
            "VBD.get_state" => {
                let p: DeviceRefParams = Self::parse(request.params)?;
                serde_json::to_value(self.engine.device_state(&p.vm, DeviceKind::Vbd, &p.id)?)
                    .map_err(|e| Error::InternalError(format!("encode: {}", e)))
            }
            "VBD.get_device_action_request" => {
                let p: DeviceRefParams = Self::parse(request.params)?;
                serde_json::to_value(self.engine.device_action_request(
                    &p.vm,
                    DeviceKind::Vbd,
                    &p.id,
                )?)
                .map_err(|e| Error::InternalError(format!("encode: {}", e)))
            }
            "VIF.plug" => {
                let p: VifPlugParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.vif_plug(&task, &p.vm, &p.spec)
                })
            }
            "VIF.unplug" => {
                let p: DeviceRefParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.vif_unplug(&task, &p.vm, &p.id)
                })
            }
            "VIF.get_state" => {
                let p: DeviceRefParams = Self::parse(request.params)?;
                serde_json::to_value(self.engine.device_state(&p.vm, DeviceKind::Vif, &p.id)?)
                    .map_err(|e| Error::InternalError(format!("encode: {}", e)))
            }
            "PCI.plug" => {
                let p: PciPlugParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.pci_plug(&task, &p.vm, &p.spec)
                })
            }
            "PCI.unplug" => {
                let p: DeviceRefParams = Self::parse(request.params)?;
                self.queued(&self.lifecycle_pool, &p.vm.clone(), move |engine| {
                    engine.pci_unplug(&task, &p.vm, &p.id)
                })
            }
            "PCI.get_state" => {
                let p: DeviceRefParams = Self::parse(request.params)?;
                serde_json::to_value(self.engine.device_state(&p.vm, DeviceKind::Pci, &p.id)?)
                    .map_err(|e| Error::InternalError(format!("encode: {}", e)))
            }
            "UPDATES.get" => {
                let p: UpdatesGetParams = Self::parse(request.params)?;
                let (updates, next_id) = self
                    .engine
                    .updates()
                    .get(p.last, Duration::from_millis(p.timeout_ms));
                serde_json::to_value((updates, next_id))
                    .map_err(|e| Error::InternalError(format!("encode: {}", e)))
            }
            "DEBUG.trigger" => {
                let p: DebugParams = Self::parse(request.params)?;
                if p.cmd == "set-cancel-trip-point" {
                    let n: u64 = p
                        .args
                        .first()
                        .and_then(|a| a.parse().ok())
                        .ok_or(Error::NotSupported)?;
                    self.cancel_trip_point.store(n, Ordering::SeqCst);
                    return serde_json::to_value(format!("tripping at checkpoint {}", n))
                        .map_err(|e| Error::InternalError(format!("encode: {}", e)));
                }
                serde_json::to_value(self.engine.debug_trigger(&p.cmd, &p.args)?)
                    .map_err(|e| Error::InternalError(format!("encode: {}", e)))
            }
            other => Err(Error::InternalError(format!("unknown method {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_round_trip() {
        let request: Request = serde_json::from_str(
            r#"{"method": "VM.get_state", "params": {"vm": "11111111-1111-1111-1111-111111111111"}}"#,
        )
        .unwrap();
        assert_eq!(request.method, "VM.get_state");
        let p: VmOnlyParams = serde_json::from_value(request.params).unwrap();
        assert_eq!(p.vm.as_str(), "11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn test_response_encoding() {
        let success = Response::Success(serde_json::json!({"domid": 3}));
        assert_eq!(
            serde_json::to_string(&success).unwrap(),
            r#"{"success":{"domid":3}}"#
        );
        let failure = Response::Failure(Error::DoesNotExist);
        assert_eq!(
            serde_json::to_string(&failure).unwrap(),
            r#"{"failure":"DoesNotExist"}"#
        );
    }

    #[test]
    fn test_params_default_for_missing_fields() {
        let p: VmBuildParams = serde_json::from_value(serde_json::json!({"vm": "x"})).unwrap();
        assert!(p.vbds.is_empty() && p.vifs.is_empty());
        let p: DeviceRefParams =
            serde_json::from_value(serde_json::json!({"vm": "x", "id": "d0"})).unwrap();
        assert!(!p.force);
    }
}
