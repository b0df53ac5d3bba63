//! 29-bit J1939 identifier codec
//!
//! ```text
//!  28  26 25                      8 7        0
//! ┌──────┬──────────────────────────┬──────────┐
//! │ prio │   PGN (18 bits)          │  source  │
//! └──────┴──────────────────────────┴──────────┘
//!                       └─ low byte = destination (PDU1, e.g. 0xDA)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::J1939Error;

/// Largest value an extended (29-bit) CAN identifier can hold
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

const PRIORITY_MASK: u32 = 0x07;
const PGN_MASK: u32 = 0x3_FFFF;
const ADDRESS_MASK: u32 = 0xFF;

/// PDU format byte of the physically addressed diagnostic PGN (0xDAxx)
pub const DIAGNOSTIC_PDU_FORMAT: u8 = 0xDA;

/// Extended CAN identifier split into its J1939 fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CanIdentifier {
    priority: u8,
    pgn: u32,
    src: u8,
}

impl CanIdentifier {
    /// Build an identifier from raw fields, masking each to its bit width
    pub fn new(priority: u8, pgn: u32, src: u8) -> Self {
        Self {
            priority: (priority as u32 & PRIORITY_MASK) as u8,
            pgn: pgn & PGN_MASK,
            src,
        }
    }

    /// Physically addressed diagnostic identifier `src -> dst`
    pub fn diagnostic(priority: u8, dst: u8, src: u8) -> Self {
        Self::new(
            priority,
            ((DIAGNOSTIC_PDU_FORMAT as u32) << 8) | dst as u32,
            src,
        )
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            priority: ((raw >> 26) & PRIORITY_MASK) as u8,
            pgn: (raw >> 8) & PGN_MASK,
            src: (raw & ADDRESS_MASK) as u8,
        }
    }

    pub fn encode(&self) -> u32 {
        (((self.priority as u32) << 26) | (self.pgn << 8) | self.src as u32) & EXTENDED_ID_MASK
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn pgn(&self) -> u32 {
        self.pgn
    }

    pub fn src(&self) -> u8 {
        self.src
    }

    /// Destination address, the low byte of a PDU1 PGN
    pub fn dst(&self) -> u8 {
        (self.pgn & ADDRESS_MASK) as u8
    }

    /// PDU format byte (bits 15..8 of the PGN)
    pub fn pdu_format(&self) -> u8 {
        ((self.pgn >> 8) & 0xFF) as u8
    }

    pub fn is_diagnostic(&self) -> bool {
        self.pdu_format() == DIAGNOSTIC_PDU_FORMAT
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = (priority as u32 & PRIORITY_MASK) as u8;
    }

    pub fn set_src(&mut self, src: u8) {
        self.src = src;
    }

    /// Rewrite the destination byte, leaving the rest of the PGN alone
    pub fn set_dst(&mut self, dst: u8) {
        self.pgn = (self.pgn & !ADDRESS_MASK) | dst as u32;
    }

    pub fn with_src(mut self, src: u8) -> Self {
        self.set_src(src);
        self
    }

    pub fn with_dst(mut self, dst: u8) -> Self {
        self.set_dst(dst);
        self
    }
}

impl From<u32> for CanIdentifier {
    fn from(raw: u32) -> Self {
        Self::decode(raw)
    }
}

impl From<CanIdentifier> for u32 {
    fn from(id: CanIdentifier) -> Self {
        id.encode()
    }
}

impl fmt::Display for CanIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.encode())
    }
}

impl FromStr for CanIdentifier {
    type Err = J1939Error;

    /// Parses a hex identifier, with or without a `0x` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = parse_hex_u32(s)?;
        if raw > EXTENDED_ID_MASK {
            return Err(J1939Error::OutOfRange(raw));
        }
        Ok(Self::decode(raw))
    }
}

impl Serialize for CanIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CanIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a hex number (supports an optional 0x prefix)
pub fn parse_hex_u32(s: &str) -> Result<u32, J1939Error> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| J1939Error::Parse(format!("'{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_decode_default_response_id() {
        let id = CanIdentifier::decode(0x18DA_F16A);
        assert_eq!(id.priority(), 6);
        assert_eq!(id.pgn(), 0xDAF1);
        assert_eq!(id.dst(), 0xF1);
        assert_eq!(id.src(), 0x6A);
        assert!(id.is_diagnostic());
    }

    #[rstest]
    #[case(0x0000_0000)]
    #[case(0x18DA_6AF1)]
    #[case(0x18DA_F16A)]
    #[case(0x0CF0_0400)]
    #[case(0x1FFF_FFFF)]
    #[case(0x1234_5678)]
    fn test_encode_decode_roundtrip(#[case] raw: u32) {
        assert_eq!(CanIdentifier::decode(raw).encode(), raw);
    }

    #[test]
    fn test_roundtrip_sweep() {
        for raw in (0..=EXTENDED_ID_MASK).step_by(0x0001_0003) {
            assert_eq!(CanIdentifier::decode(raw).encode(), raw, "raw 0x{:08X}", raw);
        }
    }

    #[test]
    fn test_encode_masks_to_29_bits() {
        // Bits above 28 are dropped on decode, so encode never exceeds the mask
        let id = CanIdentifier::decode(0xFFFF_FFFF);
        assert_eq!(id.encode(), EXTENDED_ID_MASK);
    }

    #[test]
    fn test_set_dst_only_touches_low_pgn_byte() {
        let mut id = CanIdentifier::decode(0x18DA_6AF1);
        id.set_dst(0x42);

        assert_eq!(id.dst(), 0x42);
        assert_eq!(id.priority(), 6);
        assert_eq!(id.pdu_format(), 0xDA);
        assert_eq!(id.src(), 0xF1);
        assert_eq!(id.encode(), 0x18DA_42F1);
    }

    #[test]
    fn test_set_dst_every_value() {
        let base = CanIdentifier::decode(0x18DA_6AF1);
        for d in 0..=u8::MAX {
            let id = CanIdentifier::decode(base.with_dst(d).encode());
            assert_eq!(id.dst(), d);
            assert_eq!(id.src(), base.src());
            assert_eq!(id.priority(), base.priority());
            assert_eq!(id.pdu_format(), base.pdu_format());
        }
    }

    #[test]
    fn test_diagnostic_constructor() {
        let id = CanIdentifier::diagnostic(6, 0x6A, 0xF1);
        assert_eq!(id.encode(), 0x18DA_6AF1);
    }

    #[test]
    fn test_non_diagnostic_pgn() {
        // EEC1, broadcast PGN 0xF004
        let id = CanIdentifier::decode(0x0CF0_0400);
        assert!(!id.is_diagnostic());
    }

    #[test]
    fn test_parse_with_and_without_prefix() {
        let a: CanIdentifier = "0x18DA6AF1".parse().unwrap();
        let b: CanIdentifier = "18da6af1".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "0x18DA6AF1");
    }

    #[test]
    fn test_parse_rejects_standard_overflow() {
        assert!("0x20000000".parse::<CanIdentifier>().is_err());
        assert!("not-hex".parse::<CanIdentifier>().is_err());
    }
}
