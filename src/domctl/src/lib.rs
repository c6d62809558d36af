// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane engine for a paravirtualizing hypervisor host.
//!
//! The crate drives guest domains through their whole lifecycle (create,
//! build, device plug, run, shutdown/suspend/resume, destroy) while keeping
//! the host's view of memory reservations, block attachments, control-tree
//! nodes and helper processes consistent across partial failures. The
//! hypervisor, the host configuration tree, the memory broker, the storage
//! service and the builder helper are reached through narrow trait
//! boundaries so the whole engine can be exercised against simulated hosts.

pub mod builder_helper;
pub mod config;
pub mod cpuid;
pub mod devices;
pub mod events;
pub mod hypervisor;
pub mod iface;
pub mod lifecycle;
pub mod memory_broker;
pub mod persist;
pub mod rpc_interface;
pub mod storage;
pub mod store;
pub mod task;
pub mod units;
pub mod updates;
/// Simulated collaborators used by the test suite and the scenario tests.
pub mod utilities;

use serde::{Deserialize, Serialize};

/// Hypervisor-assigned domain identifier. Unique within a host while the
/// domain is resident; reused after destruction.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct DomId(pub u32);

/// Caller-provided stable VM identity (a textual UUID). The engine keeps at
/// most one live domain per `VmId`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub struct VmId(pub String);

impl VmId {
    /// Borrows the textual UUID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VmId {
    fn from(s: &str) -> Self {
        VmId(s.to_string())
    }
}

/// The closed error taxonomy surfaced over the RPC boundary. Every engine
/// operation has a total, typed result; the RPC layer wraps anything outside
/// this enum as `InternalError`.
#[derive(
    Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display, Serialize, Deserialize,
)]
pub enum Error {
    /// Object does not exist
    DoesNotExist,
    /// Object already exists
    AlreadyExists,
    /// Device is not connected
    DeviceNotConnected,
    /// Device refused to detach
    DeviceDetachRejected,
    /// Domain has not been built
    DomainNotBuilt,
    /// Malformed CPUID mask template
    BadCpuidTemplate,
    /// Unrepresentable device interface name
    BadInterfaceName,
    /// Bad magic in saved-domain image
    BadSignature,
    /// Truncated device-model state record
    TruncatedDmState,
    /// Domain builder failed
    BuildFailed,
    /// Builder helper spoke out of protocol: {0}
    HelperProtocol(String),
    /// Builder helper reported: {0}
    HelperReported(String),
    /// Bootloader {0} failed: {1}
    BootloaderError(String, String),
    /// No bootable device
    NoBootableDevice,
    /// Ballooning failure {0}: {1}
    BallooningError(i64, String),
    /// Ballooning service is not running
    BallooningServiceAbsent,
    /// Timed out waiting for a device backend
    BackendTimeout,
    /// Domain {0} is stuck in the dying state
    StuckInDyingState(DomId),
    /// Operation was cancelled
    Cancelled,
    /// I/O failure
    IoError,
    /// Internal error: {0}
    InternalError(String),
    /// Operation not supported
    NotSupported,
}

/// Shorthand result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::IoError
    }
}

impl From<store::StoreError> for Error {
    fn from(e: store::StoreError) -> Self {
        match e {
            store::StoreError::NotFound(_) => Error::DoesNotExist,
            store::StoreError::Io(_) => Error::IoError,
            other => Error::InternalError(other.to_string()),
        }
    }
}

impl From<hypervisor::HypervisorError> for Error {
    fn from(e: hypervisor::HypervisorError) -> Self {
        Error::InternalError(e.to_string())
    }
}

impl From<builder_helper::HelperError> for Error {
    fn from(e: builder_helper::HelperError) -> Self {
        use builder_helper::HelperError;
        match e {
            HelperError::BadSignature => Error::BadSignature,
            HelperError::TruncatedDmState => Error::TruncatedDmState,
            HelperError::BuildFailed => Error::BuildFailed,
            HelperError::Protocol(text) => Error::HelperProtocol(text),
            HelperError::Reported(text) => Error::HelperReported(text),
            HelperError::Cancelled => Error::Cancelled,
            HelperError::Io(_) => Error::IoError,
        }
    }
}

impl From<memory_broker::BrokerError> for Error {
    fn from(e: memory_broker::BrokerError) -> Self {
        match e {
            memory_broker::BrokerError::ServiceAbsent => Error::BallooningServiceAbsent,
            memory_broker::BrokerError::Failure(code, text) => Error::BallooningError(code, text),
        }
    }
}

impl From<storage::StorageError> for Error {
    fn from(e: storage::StorageError) -> Self {
        match e {
            storage::StorageError::NotFound(_) => Error::DoesNotExist,
            storage::StorageError::Io(_) => Error::IoError,
            other => Error::InternalError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::StuckInDyingState(DomId(7)).to_string(),
            "Domain 7 is stuck in the dying state"
        );
        assert_eq!(
            Error::BallooningError(2, "cannot free".into()).to_string(),
            "Ballooning failure 2: cannot free"
        );
    }

    #[test]
    fn test_error_round_trips_through_json() {
        for err in [
            Error::DoesNotExist,
            Error::HelperReported("no memory".into()),
            Error::StuckInDyingState(DomId(12)),
            Error::BootloaderError("pygrub".into(), "exit 2".into()),
        ] {
            let encoded = serde_json::to_string(&err).unwrap();
            let decoded: Error = serde_json::from_str(&encoded).unwrap();
            assert_eq!(err, decoded);
        }
    }
}
