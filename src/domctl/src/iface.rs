// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block interface naming.
//!
//! A virtual disk is addressed three ways: by the user-facing disk number,
//! by the linux device string the guest sees (`xvda`, `sda1`, `hdc`), and by
//! the integer device key used in the control tree. The mapping depends on
//! the bus: HVM guests get the low disk numbers on the emulated IDE bus
//! (two buses of two devices) and everything above on the paravirtual bus,
//! while PV guests only ever use the paravirtual numbering.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Number of disks reachable over the emulated IDE fan-out (bus 0-1,
/// device 0-1).
pub const IDE_DISKS: u32 = 4;

const IDE_PARTS: u32 = 64;
const SCSI_DISKS: u32 = 16;
const SCSI_PARTS: u32 = 16;
const XEN_SHORT_DISKS: u32 = 16;
const XEN_SHORT_PARTS: u32 = 16;
const XEN_EXT_DISKS: u32 = 1 << 20;
const XEN_EXT_PARTS: u32 = 256;

const XEN_MAJOR: u32 = 202;
const SCSI_MAJOR: u32 = 8;
const IDE01_MAJOR: u32 = 3;
const IDE23_MAJOR: u32 = 22;
const XEN_EXT_FLAG: u32 = 1 << 28;

/// A bus-qualified (disk, partition) pair. Partition 0 addresses the whole
/// disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interface {
    /// Paravirtual disk (`xvd*`).
    Xen {
        /// Disk index on the bus.
        disk: u32,
        /// Partition, 0 for the whole disk.
        partition: u32,
    },
    /// Emulated SCSI disk (`sd*`).
    Scsi {
        /// Disk index on the bus.
        disk: u32,
        /// Partition, 0 for the whole disk.
        partition: u32,
    },
    /// Emulated IDE disk (`hd*`).
    Ide {
        /// Disk index on the bus.
        disk: u32,
        /// Partition, 0 for the whole disk.
        partition: u32,
    },
}

impl Interface {
    fn representable(&self) -> bool {
        match *self {
            Interface::Xen { disk, partition } => {
                (disk < XEN_SHORT_DISKS && partition < XEN_SHORT_PARTS)
                    || (disk < XEN_EXT_DISKS && partition < XEN_EXT_PARTS)
            }
            Interface::Scsi { disk, partition } => disk < SCSI_DISKS && partition < SCSI_PARTS,
            Interface::Ide { disk, partition } => disk < IDE_DISKS && partition < IDE_PARTS,
        }
    }

    /// Maps a user-facing disk number to an interface. HVM guests fill the
    /// IDE fan-out first and fall through to paravirtual numbering; PV
    /// guests use paravirtual numbering only. The first scheme that yields a
    /// representable interface wins.
    pub fn of_disk_number(hvm: bool, number: u32) -> Result<Interface, Error> {
        let candidate = if hvm && number < IDE_DISKS {
            Interface::Ide {
                disk: number,
                partition: 0,
            }
        } else {
            Interface::Xen {
                disk: number,
                partition: 0,
            }
        };
        if candidate.representable() {
            Ok(candidate)
        } else {
            Err(Error::BadInterfaceName)
        }
    }

    /// Parses a linux device string such as `xvda`, `sda3` or `hdc`.
    pub fn of_linux_device(name: &str) -> Result<Interface, Error> {
        let (rest, make) = if let Some(rest) = name.strip_prefix("xvd") {
            (rest, Interface::xen as fn(u32, u32) -> Interface)
        } else if let Some(rest) = name.strip_prefix("sd") {
            (rest, Interface::scsi as fn(u32, u32) -> Interface)
        } else if let Some(rest) = name.strip_prefix("hd") {
            (rest, Interface::ide as fn(u32, u32) -> Interface)
        } else {
            return Err(Error::BadInterfaceName);
        };

        let letters: String = rest.chars().take_while(|c| c.is_ascii_lowercase()).collect();
        let digits = &rest[letters.len()..];
        if letters.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::BadInterfaceName);
        }
        let disk = letters_to_disk(&letters).ok_or(Error::BadInterfaceName)?;
        let partition = if digits.is_empty() {
            0
        } else {
            digits.parse::<u32>().map_err(|_| Error::BadInterfaceName)?
        };

        let iface = make(disk, partition);
        if iface.representable() {
            Ok(iface)
        } else {
            Err(Error::BadInterfaceName)
        }
    }

    /// Renders the linux device string the guest sees.
    pub fn to_linux_device(&self) -> String {
        let (prefix, disk, partition) = match *self {
            Interface::Xen { disk, partition } => ("xvd", disk, partition),
            Interface::Scsi { disk, partition } => ("sd", disk, partition),
            Interface::Ide { disk, partition } => ("hd", disk, partition),
        };
        let mut out = format!("{}{}", prefix, disk_to_letters(disk));
        if partition != 0 {
            out.push_str(&partition.to_string());
        }
        out
    }

    /// Encodes the integer device key published in the control tree.
    pub fn to_key(&self) -> Result<u32, Error> {
        if !self.representable() {
            return Err(Error::BadInterfaceName);
        }
        Ok(match *self {
            Interface::Xen { disk, partition } => {
                if disk < XEN_SHORT_DISKS && partition < XEN_SHORT_PARTS {
                    (XEN_MAJOR << 8) | (disk << 4) | partition
                } else {
                    XEN_EXT_FLAG | (disk << 8) | partition
                }
            }
            Interface::Scsi { disk, partition } => (SCSI_MAJOR << 8) | (disk << 4) | partition,
            Interface::Ide { disk, partition } => {
                if disk < 2 {
                    (IDE01_MAJOR << 8) | (disk << 6) | partition
                } else {
                    (IDE23_MAJOR << 8) | ((disk - 2) << 6) | partition
                }
            }
        })
    }

    /// Decodes a control-tree device key.
    pub fn of_key(key: u32) -> Result<Interface, Error> {
        if key & XEN_EXT_FLAG != 0 {
            let disk = (key & !XEN_EXT_FLAG) >> 8;
            let partition = key & 0xff;
            return Ok(Interface::xen(disk, partition));
        }
        let iface = match key >> 8 {
            XEN_MAJOR => Interface::xen((key >> 4) & 0xf, key & 0xf),
            SCSI_MAJOR => Interface::scsi((key >> 4) & 0xf, key & 0xf),
            IDE01_MAJOR => Interface::ide((key >> 6) & 0x3, key & 0x3f),
            IDE23_MAJOR => Interface::ide(2 + ((key >> 6) & 0x3), key & 0x3f),
            _ => return Err(Error::BadInterfaceName),
        };
        if iface.representable() {
            Ok(iface)
        } else {
            Err(Error::BadInterfaceName)
        }
    }

    /// The user-facing disk number this interface answers to.
    pub fn disk_number(&self) -> u32 {
        match *self {
            Interface::Xen { disk, .. }
            | Interface::Scsi { disk, .. }
            | Interface::Ide { disk, .. } => disk,
        }
    }

    fn xen(disk: u32, partition: u32) -> Interface {
        Interface::Xen { disk, partition }
    }

    fn scsi(disk: u32, partition: u32) -> Interface {
        Interface::Scsi { disk, partition }
    }

    fn ide(disk: u32, partition: u32) -> Interface {
        Interface::Ide { disk, partition }
    }
}

fn disk_to_letters(mut disk: u32) -> String {
    // Spreadsheet-column encoding: a..z, aa..az, ba..
    let mut letters = Vec::new();
    disk += 1;
    while disk > 0 {
        disk -= 1;
        letters.push(b'a' + (disk % 26) as u8);
        disk /= 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

fn letters_to_disk(letters: &str) -> Option<u32> {
    let mut disk: u64 = 0;
    for ch in letters.chars() {
        if !ch.is_ascii_lowercase() {
            return None;
        }
        disk = disk * 26 + (ch as u64 - 'a' as u64 + 1);
        if disk > u64::from(XEN_EXT_DISKS) {
            return None;
        }
    }
    Some((disk - 1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_number_policy() {
        assert_eq!(
            Interface::of_disk_number(true, 0).unwrap(),
            Interface::ide(0, 0)
        );
        assert_eq!(
            Interface::of_disk_number(true, 3).unwrap(),
            Interface::ide(3, 0)
        );
        // Past the IDE fan-out the HVM guest falls through to xvd numbering.
        assert_eq!(
            Interface::of_disk_number(true, 4).unwrap(),
            Interface::xen(4, 0)
        );
        assert_eq!(
            Interface::of_disk_number(false, 0).unwrap(),
            Interface::xen(0, 0)
        );
        assert_eq!(
            Interface::of_disk_number(false, 2).unwrap(),
            Interface::xen(2, 0)
        );
    }

    #[test]
    fn test_linux_device_round_trip() {
        for name in ["xvda", "xvdb3", "xvdp15", "sda", "sdc1", "hda", "hdc2", "xvdaa"] {
            let iface = Interface::of_linux_device(name).unwrap();
            assert_eq!(iface.to_linux_device(), name, "{}", name);
        }
    }

    #[test]
    fn test_bad_names() {
        for name in ["", "xvd", "sd1", "vda", "hde", "xvda1x", "sdq9"] {
            assert_eq!(
                Interface::of_linux_device(name),
                Err(Error::BadInterfaceName),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_key_round_trip() {
        let cases = [
            (Interface::xen(0, 0), 202 << 8),
            (Interface::xen(1, 2), (202 << 8) | (1 << 4) | 2),
            (Interface::scsi(0, 1), (8 << 8) | 1),
            (Interface::ide(0, 0), 3 << 8),
            (Interface::ide(2, 1), (22 << 8) | 1),
        ];
        for (iface, key) in cases {
            assert_eq!(iface.to_key().unwrap(), key);
            assert_eq!(Interface::of_key(key).unwrap(), iface);
        }
        // Disks past the short-format range use the extended encoding.
        let big = Interface::xen(26, 0);
        let key = big.to_key().unwrap();
        assert_eq!(key, (1 << 28) | (26 << 8));
        assert_eq!(Interface::of_key(key).unwrap(), big);
    }

    #[test]
    fn test_reverse_lookup_is_injective() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for n in 0..32 {
            let key = Interface::of_disk_number(true, n).unwrap().to_key().unwrap();
            assert!(seen.insert(key));
        }
    }
}
