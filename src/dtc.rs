//! Diagnostic Trouble Code (DTC) codec.
//!
//! ECUs report DTCs as 16-bit big-endian words: the top two bits select the
//! domain (P/C/B/U), the low 14 bits are the code number. Code 0 is reserved
//! for "no fault" and is never emitted or listed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// DTC domain, encoded in the top two bits of the raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtcDomain {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcDomain {
    pub fn letter(self) -> char {
        match self {
            DtcDomain::Powertrain => 'P',
            DtcDomain::Chassis => 'C',
            DtcDomain::Body => 'B',
            DtcDomain::Network => 'U',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'P' => Some(DtcDomain::Powertrain),
            'C' => Some(DtcDomain::Chassis),
            'B' => Some(DtcDomain::Body),
            'U' => Some(DtcDomain::Network),
            _ => None,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            0 => DtcDomain::Powertrain,
            1 => DtcDomain::Chassis,
            2 => DtcDomain::Body,
            _ => DtcDomain::Network,
        }
    }
}

/// A single diagnostic trouble code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticCode {
    pub domain: DtcDomain,
    /// 14-bit code number.
    pub number: u16,
}

impl DiagnosticCode {
    /// Decode a raw 16-bit code. Returns `None` for the reserved value 0.
    pub fn from_raw(raw: u16) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        Some(Self {
            domain: DtcDomain::from_bits(raw >> 14),
            number: raw & 0x3FFF,
        })
    }

    /// Re-encode to the raw 16-bit form.
    pub fn raw(&self) -> u16 {
        let bits = match self.domain {
            DtcDomain::Powertrain => 0u16,
            DtcDomain::Chassis => 1,
            DtcDomain::Body => 2,
            DtcDomain::Network => 3,
        };
        (bits << 14) | (self.number & 0x3FFF)
    }

    /// Parse canonical text (e.g. `"P0420"`) back to a code.
    pub fn parse(text: &str) -> Option<Self> {
        let mut chars = text.chars();
        let domain = DtcDomain::from_letter(chars.next()?)?;
        let digits = chars.as_str();
        if digits.len() != 4 {
            return None;
        }
        let number = u16::from_str_radix(digits, 16).ok()?;
        if number > 0x3FFF {
            return None;
        }
        let code = Self { domain, number };
        if code.raw() == 0 {
            return None;
        }
        Some(code)
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:04X}", self.domain.letter(), self.number)
    }
}

/// Decode a list of 2-byte big-endian codes, skipping reserved zeros and a
/// trailing odd byte.
pub fn decode_list(data: &[u8]) -> Vec<DiagnosticCode> {
    data.chunks_exact(2)
        .filter_map(|pair| DiagnosticCode::from_raw(u16::from_be_bytes([pair[0], pair[1]])))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_zero_padded_uppercase() {
        let code = DiagnosticCode::from_raw(0x0420).unwrap();
        assert_eq!(code.to_string(), "P0420");
        assert_eq!(code.domain, DtcDomain::Powertrain);

        let code = DiagnosticCode::from_raw(0x4001).unwrap();
        assert_eq!(code.to_string(), "C0001");

        let code = DiagnosticCode::from_raw(0xABCD).unwrap();
        assert_eq!(code.to_string(), "B2BCD");

        let code = DiagnosticCode::from_raw(0xFFFF).unwrap();
        assert_eq!(code.to_string(), "U3FFF");
    }

    #[test]
    fn test_zero_is_reserved() {
        assert!(DiagnosticCode::from_raw(0).is_none());
        assert!(DiagnosticCode::parse("P0000").is_none());
    }

    #[test]
    fn test_round_trip_all_domains() {
        for raw in [0x0001u16, 0x2AAF, 0x4B93, 0x8001, 0xC123, 0xFFFF] {
            let code = DiagnosticCode::from_raw(raw).unwrap();
            assert_eq!(code.raw(), raw);
            assert_eq!(DiagnosticCode::parse(&code.to_string()), Some(code));
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DiagnosticCode::parse("X0123").is_none());
        assert!(DiagnosticCode::parse("P012").is_none());
        assert!(DiagnosticCode::parse("P01234").is_none());
        assert!(DiagnosticCode::parse("PZZZZ").is_none());
        assert!(DiagnosticCode::parse("").is_none());
    }

    #[test]
    fn test_decode_list_skips_zeros() {
        let data = [0x04, 0x20, 0x00, 0x00, 0x2A, 0xAF];
        let codes = decode_list(&data);
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].to_string(), "P0420");
        assert_eq!(codes[1].to_string(), "P2AAF");
    }

    #[test]
    fn test_decode_list_ignores_trailing_byte() {
        let codes = decode_list(&[0x04, 0x20, 0x2A]);
        assert_eq!(codes.len(), 1);
    }
}
