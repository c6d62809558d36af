// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration. Everything the engine reaches outside itself for —
//! the state root, helper binaries, service sockets — and every tunable
//! wait is configuration, never a constant baked into call sites.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Keys recognized in device extra-key dictionaries. Unknown keys are
/// logged and, in strict mode, rejected.
pub const RECOGNIZED_BACKEND_KEYS: &[&str] = &[
    "discard-enable",
    "polling-duration",
    "polling-idle-threshold",
    "sm-data",
];

/// Keys recognized under `platform/*`. Unknown keys are logged and, in
/// strict mode, rejected.
pub const RECOGNIZED_PLATFORM_KEYS: &[&str] = &[
    "acpi",
    "apic",
    "boot-order",
    "device-model",
    "keymap",
    "machine-address-size",
    "nx",
    "pae",
    "serial",
    "stdvga",
    "suppress-spurious-page-faults",
    "timeoffset",
    "usb",
    "vcpu-mask",
    "vnc-ip",
    "vnc-port",
    "video-mib",
    "viridian",
];

fn default_state_root() -> PathBuf {
    PathBuf::from("/var/lib/domctl")
}

fn default_helper_binary() -> PathBuf {
    PathBuf::from("/usr/libexec/domctl/domain-builder")
}

fn default_bootloader_binary() -> PathBuf {
    PathBuf::from("/usr/bin/pygrub")
}

fn default_model_binary() -> PathBuf {
    PathBuf::from("/usr/libexec/domctl/device-model")
}

fn default_hvm_loader() -> PathBuf {
    PathBuf::from("/usr/libexec/domctl/hvmloader")
}

fn default_ctrl_path() -> PathBuf {
    PathBuf::from("/dev/xen/privcmd")
}

fn default_storage_socket() -> PathBuf {
    PathBuf::from("/run/domctl/storage.sock")
}

fn default_broker_socket() -> PathBuf {
    PathBuf::from("/run/domctl/balloon.sock")
}

fn default_dying_poll_period_ms() -> u64 {
    5_000
}

fn default_dying_budget_ms() -> u64 {
    30_000
}

fn default_shutdown_ack_delay_ms() -> u64 {
    30_000
}

fn default_suspend_budget_ms() -> u64 {
    20 * 60 * 1_000
}

fn default_device_shutdown_timeout_ms() -> u64 {
    60_000
}

fn default_dm_ack_timeout_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    64
}

/// Daemon configuration, deserialized from the JSON file named on the
/// command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Root directory for persistent per-VM state.
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    /// Builder-helper binary.
    #[serde(default = "default_helper_binary")]
    pub helper_binary: PathBuf,
    /// Bootloader run against indirect-PV boot disks.
    #[serde(default = "default_bootloader_binary")]
    pub bootloader_binary: PathBuf,
    /// Device-model binary.
    #[serde(default = "default_model_binary")]
    pub model_binary: PathBuf,
    /// Firmware loader built into HVM guests in place of a kernel.
    #[serde(default = "default_hvm_loader")]
    pub hvm_loader: PathBuf,
    /// Hypervisor control node handed to the helper.
    #[serde(default = "default_ctrl_path")]
    pub ctrl_path: PathBuf,
    /// Storage daemon socket.
    #[serde(default = "default_storage_socket")]
    pub storage_socket: PathBuf,
    /// Ballooning broker socket.
    #[serde(default = "default_broker_socket")]
    pub broker_socket: PathBuf,
    /// Poll period while waiting for a dying domain to disappear.
    #[serde(default = "default_dying_poll_period_ms")]
    pub dying_poll_period_ms: u64,
    /// Wall budget for a dying domain to disappear; the effective bound is
    /// this plus one poll period.
    #[serde(default = "default_dying_budget_ms")]
    pub dying_budget_ms: u64,
    /// How long a guest gets to acknowledge `control/shutdown`.
    #[serde(default = "default_shutdown_ack_delay_ms")]
    pub shutdown_ack_delay_ms: u64,
    /// Wall budget for a suspending guest to shut down.
    #[serde(default = "default_suspend_budget_ms")]
    pub suspend_budget_ms: u64,
    /// Wall budget for parallel device hard-shutdown.
    #[serde(default = "default_device_shutdown_timeout_ms")]
    pub device_shutdown_timeout_ms: u64,
    /// Wall budget for device-model command acknowledgement.
    #[serde(default = "default_dm_ack_timeout_ms")]
    pub dm_ack_timeout_ms: u64,
    /// Bound on each per-VM work queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Reject unrecognized platform/extra keys instead of just logging.
    #[serde(default)]
    pub strict_keys: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

impl DaemonConfig {
    /// Poll period while waiting for a dying domain.
    pub fn dying_poll_period(&self) -> Duration {
        Duration::from_millis(self.dying_poll_period_ms)
    }

    /// Wall budget for a dying domain.
    pub fn dying_budget(&self) -> Duration {
        Duration::from_millis(self.dying_budget_ms)
    }

    /// Guest shutdown-acknowledgement delay.
    pub fn shutdown_ack_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_ack_delay_ms)
    }

    /// Suspend wall budget.
    pub fn suspend_budget(&self) -> Duration {
        Duration::from_millis(self.suspend_budget_ms)
    }

    /// Device hard-shutdown wall budget.
    pub fn device_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.device_shutdown_timeout_ms)
    }

    /// Device-model acknowledgement budget.
    pub fn dm_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.dm_ack_timeout_ms)
    }

    /// Validates a caller-supplied key dictionary against a recognized
    /// list: unknown keys are logged, and rejected in strict mode.
    pub fn validate_keys<'a>(
        &self,
        what: &str,
        allowlist: &[&str],
        keys: impl Iterator<Item = &'a str>,
    ) -> Result<()> {
        let recognized: BTreeSet<&str> = allowlist.iter().copied().collect();
        for key in keys {
            if !recognized.contains(key) {
                warn!("{}: unrecognized key {:?}", what, key);
                if self.strict_keys {
                    return Err(Error::InternalError(format!(
                        "{}: unrecognized key {:?}",
                        what, key
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_config() {
        let cfg: DaemonConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.dying_poll_period(), Duration::from_secs(5));
        assert_eq!(cfg.dying_budget(), Duration::from_secs(30));
        assert_eq!(cfg.suspend_budget(), Duration::from_secs(1200));
        assert!(!cfg.strict_keys);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(serde_json::from_str::<DaemonConfig>(r#"{"surprise": 1}"#).is_err());
    }

    #[test]
    fn test_overrides() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{"dying_poll_period_ms": 100, "state_root": "/tmp/s", "strict_keys": true}"#,
        )
        .unwrap();
        assert_eq!(cfg.dying_poll_period(), Duration::from_millis(100));
        assert_eq!(cfg.state_root, PathBuf::from("/tmp/s"));
        assert!(cfg.strict_keys);
    }

    #[test]
    fn test_key_validation() {
        let mut cfg = DaemonConfig::default();
        assert!(cfg
            .validate_keys(
                "platform",
                RECOGNIZED_PLATFORM_KEYS,
                ["acpi", "mystery"].into_iter()
            )
            .is_ok());
        cfg.strict_keys = true;
        assert!(cfg
            .validate_keys(
                "platform",
                RECOGNIZED_PLATFORM_KEYS,
                ["acpi", "mystery"].into_iter()
            )
            .is_err());
        assert!(cfg
            .validate_keys("platform", RECOGNIZED_PLATFORM_KEYS, ["acpi"].into_iter())
            .is_ok());
    }
}
