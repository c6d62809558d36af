// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! CPUID masking policy.
//!
//! Each register of a policed leaf is described by a 32-character template,
//! one character per bit, most significant bit first:
//!
//! * `0` — force the bit clear
//! * `1` — force the bit set
//! * `x` — leave the hypervisor default
//! * `s` — copy the host's bit
//! * `k` — keep the incoming (guest-visible) bit
//!
//! Templates are parsed and validated in full before any hypervisor call is
//! made, so a malformed policy can never leave a domain half-masked.

use serde::{Deserialize, Serialize};

use crate::Error;

/// A parsed per-register bit template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskTemplate {
    /// Bits forced to one.
    pub set: u32,
    /// Bits forced to zero.
    pub clear: u32,
    /// Bits copied from the host register.
    pub host: u32,
    /// Bits kept from the incoming value.
    pub keep: u32,
}

impl MaskTemplate {
    /// Parses a 32-character template. Any other length, or any character
    /// outside the template vocabulary, fails with `BadCpuidTemplate`.
    pub fn parse(template: &str) -> Result<Self, Error> {
        if template.len() != 32 {
            return Err(Error::BadCpuidTemplate);
        }
        let mut parsed = MaskTemplate::default();
        for (idx, ch) in template.chars().enumerate() {
            let bit = 1u32 << (31 - idx);
            match ch {
                '0' => parsed.clear |= bit,
                '1' => parsed.set |= bit,
                'x' => (),
                's' => parsed.host |= bit,
                'k' => parsed.keep |= bit,
                _ => return Err(Error::BadCpuidTemplate),
            }
        }
        Ok(parsed)
    }

    /// Applies the template to a register: start from the hypervisor
    /// default, then overlay forced, host-copied and kept bits.
    pub fn apply(&self, default: u32, host: u32, incoming: u32) -> u32 {
        let mut value = default;
        value |= self.set;
        value &= !self.clear;
        value = (value & !self.host) | (host & self.host);
        value = (value & !self.keep) | (incoming & self.keep);
        value
    }
}

/// Policy for one CPUID leaf: optional templates for each of the four
/// registers, kept in their textual form so the record round-trips through
/// the persistent store unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafPolicy {
    /// Input leaf (EAX at CPUID time).
    pub leaf: u32,
    /// Optional input subleaf (ECX at CPUID time).
    pub subleaf: Option<u32>,
    /// Template for EAX.
    pub eax: Option<String>,
    /// Template for EBX.
    pub ebx: Option<String>,
    /// Template for ECX.
    pub ecx: Option<String>,
    /// Template for EDX.
    pub edx: Option<String>,
}

/// The four parsed register templates of one leaf; `None` leaves the
/// register untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafMasks {
    /// Parsed EAX template.
    pub eax: Option<MaskTemplate>,
    /// Parsed EBX template.
    pub ebx: Option<MaskTemplate>,
    /// Parsed ECX template.
    pub ecx: Option<MaskTemplate>,
    /// Parsed EDX template.
    pub edx: Option<MaskTemplate>,
}

impl LeafPolicy {
    /// Validates and parses all templates of this leaf.
    pub fn masks(&self) -> Result<LeafMasks, Error> {
        fn parse_opt(t: &Option<String>) -> Result<Option<MaskTemplate>, Error> {
            t.as_deref().map(MaskTemplate::parse).transpose()
        }
        Ok(LeafMasks {
            eax: parse_opt(&self.eax)?,
            ebx: parse_opt(&self.ebx)?,
            ecx: parse_opt(&self.ecx)?,
            edx: parse_opt(&self.edx)?,
        })
    }
}

/// Parses every leaf of a policy up front. This is the validation gate the
/// lifecycle engine runs before touching the hypervisor.
pub fn parse_policy(policy: &[LeafPolicy]) -> Result<Vec<(u32, Option<u32>, LeafMasks)>, Error> {
    policy
        .iter()
        .map(|leaf| Ok((leaf.leaf, leaf.subleaf, leaf.masks()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_bad_length() {
        assert_eq!(MaskTemplate::parse(""), Err(Error::BadCpuidTemplate));
        assert_eq!(MaskTemplate::parse("01x"), Err(Error::BadCpuidTemplate));
        assert_eq!(
            MaskTemplate::parse(&"x".repeat(33)),
            Err(Error::BadCpuidTemplate)
        );
    }

    #[test]
    fn test_parse_rejects_bad_vocabulary() {
        let mut t = "x".repeat(32);
        t.replace_range(4..5, "?");
        assert_eq!(MaskTemplate::parse(&t), Err(Error::BadCpuidTemplate));
    }

    #[test]
    fn test_apply_precedence() {
        // MSB-first: bit 31 forced set, bit 30 forced clear, bit 29 host,
        // bit 28 keep, the rest default.
        let t = MaskTemplate::parse(&format!("10sk{}", "x".repeat(28))).unwrap();
        let out = t.apply(0x0000_0001, 0x2000_0000, 0x1000_0000);
        assert_eq!(out, 0x8000_0000 | 0x2000_0000 | 0x1000_0000 | 0x0000_0001);
    }

    #[test]
    fn test_policy_validation_is_total() {
        let good = LeafPolicy {
            leaf: 1,
            subleaf: None,
            eax: Some("x".repeat(32)),
            ..Default::default()
        };
        let bad = LeafPolicy {
            leaf: 0x8000_0001,
            subleaf: Some(0),
            edx: Some("q".repeat(32)),
            ..Default::default()
        };
        assert!(parse_policy(&[good.clone()]).is_ok());
        assert_eq!(
            parse_policy(&[good, bad]),
            Err(Error::BadCpuidTemplate)
        );
    }
}
