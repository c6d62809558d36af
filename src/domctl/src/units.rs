// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Byte/KiB/MiB/page arithmetic for guest memory accounting.
//!
//! The control tree publishes memory values in KiB, the hypervisor reports
//! pages and the callers speak bytes; everything that crosses one of those
//! boundaries goes through here.

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Page shift corresponding to [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = 12;

/// Converts bytes to KiB, rounding down.
pub fn bytes_to_kib(bytes: u64) -> u64 {
    bytes >> 10
}

/// Converts KiB to bytes.
pub fn kib_to_bytes(kib: u64) -> u64 {
    kib << 10
}

/// Converts bytes to MiB, rounding down.
pub fn bytes_to_mib(bytes: u64) -> u64 {
    bytes >> 20
}

/// Converts MiB to bytes.
pub fn mib_to_bytes(mib: u64) -> u64 {
    mib << 20
}

/// Converts MiB to KiB.
pub fn mib_to_kib(mib: u64) -> u64 {
    mib << 10
}

/// Converts bytes to pages, rounding up to cover the trailing partial page.
pub fn bytes_to_pages_round_up(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Converts a page count to bytes.
pub fn pages_to_bytes(pages: u64) -> u64 {
    pages << PAGE_SHIFT
}

/// Converts KiB to pages, rounding down.
pub fn kib_to_pages(kib: u64) -> u64 {
    kib >> (PAGE_SHIFT - 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips() {
        assert_eq!(bytes_to_kib(268_435_456), 262_144);
        assert_eq!(kib_to_bytes(262_144), 268_435_456);
        assert_eq!(bytes_to_mib(268_435_456), 256);
        assert_eq!(mib_to_bytes(256), 268_435_456);
        assert_eq!(mib_to_kib(1), 1024);
    }

    #[test]
    fn test_page_rounding() {
        assert_eq!(bytes_to_pages_round_up(0), 0);
        assert_eq!(bytes_to_pages_round_up(1), 1);
        assert_eq!(bytes_to_pages_round_up(PAGE_SIZE), 1);
        assert_eq!(bytes_to_pages_round_up(PAGE_SIZE + 1), 2);
        assert_eq!(pages_to_bytes(65536), 268_435_456);
        assert_eq!(kib_to_pages(8), 2);
    }
}
