//! Per-family memory region tables and address validation.
//!
//! Every read or write range is checked against these tables before a single
//! frame goes on the wire; the region's class also selects the read/write
//! opcode and decides whether a flash sector erase must precede a write.

use serde::Serialize;

use crate::ecu::EcuFamily;
use crate::error::ValidationError;

/// Region classification, used for opcode selection and erase policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryClass {
    /// ROM/flash: erase-before-write, verified after programming.
    Flash,
    Ram,
    Eeprom,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryRegion {
    pub name: &'static str,
    pub start: u32,
    pub length: u32,
    pub class: MemoryClass,
    pub access: Access,
}

impl MemoryRegion {
    pub fn end(&self) -> u32 {
        self.start + (self.length - 1)
    }

    pub fn contains(&self, address: u32, length: u32) -> bool {
        address >= self.start && length <= self.length && address - self.start <= self.length - length
    }
}

use Access::{ReadOnly, ReadWrite};
use MemoryClass::{Eeprom, Flash, Io, Ram};

// Bosch ME17 frames carry 3-byte addresses, so its map lives in 24-bit space.
const BOSCH_REGIONS: &[MemoryRegion] = &[
    MemoryRegion { name: "Internal Flash", start: 0x00_0000, length: 0x18_0000, class: Flash, access: ReadWrite },
    MemoryRegion { name: "Calibration Flash", start: 0x18_0000, length: 0x08_0000, class: Flash, access: ReadWrite },
    MemoryRegion { name: "RAM", start: 0xC0_0000, length: 0x04_0000, class: Ram, access: ReadWrite },
    MemoryRegion { name: "EEPROM", start: 0xE0_0000, length: 0x00_2000, class: Eeprom, access: ReadWrite },
    MemoryRegion { name: "Boot ROM", start: 0xFF_0000, length: 0x01_0000, class: Flash, access: ReadOnly },
];

const SIEMENS_REGIONS: &[MemoryRegion] = &[
    MemoryRegion { name: "Flash Bank 1", start: 0x0000_0000, length: 0x0010_0000, class: Flash, access: ReadWrite },
    MemoryRegion { name: "Flash Bank 2", start: 0x0010_0000, length: 0x0010_0000, class: Flash, access: ReadWrite },
    MemoryRegion { name: "EEPROM", start: 0x0800_0000, length: 0x0000_4000, class: Eeprom, access: ReadWrite },
    MemoryRegion { name: "RAM", start: 0x4000_0000, length: 0x0002_0000, class: Ram, access: ReadWrite },
];

const DENSO_REGIONS: &[MemoryRegion] = &[
    MemoryRegion { name: "Program ROM", start: 0x0000_0000, length: 0x0008_0000, class: Flash, access: ReadWrite },
    MemoryRegion { name: "Data EEPROM", start: 0x00FE_0000, length: 0x0000_2000, class: Eeprom, access: ReadWrite },
    MemoryRegion { name: "I/O Registers", start: 0x05FF_E000, length: 0x0000_1000, class: Io, access: ReadWrite },
    MemoryRegion { name: "System RAM", start: 0x05FF_FF00, length: 0x0000_4000, class: Ram, access: ReadWrite },
];

/// The declared memory map of a family, exposed read-only.
pub fn regions(family: EcuFamily) -> &'static [MemoryRegion] {
    match family {
        EcuFamily::Bosch => BOSCH_REGIONS,
        EcuFamily::Siemens => SIEMENS_REGIONS,
        EcuFamily::Denso => DENSO_REGIONS,
    }
}

/// Flash sector size used for erase alignment.
pub fn sector_size(family: EcuFamily) -> u32 {
    match family {
        EcuFamily::Bosch => 0x2000,
        EcuFamily::Siemens => 0x1000,
        EcuFamily::Denso => 0x1000,
    }
}

/// Align an address down to its containing sector boundary.
pub fn align_sector(family: EcuFamily, address: u32) -> u32 {
    address & !(sector_size(family) - 1)
}

/// Find the single region that fully contains `[address, address+length)`.
pub fn find_region(
    family: EcuFamily,
    address: u32,
    length: u32,
) -> Result<&'static MemoryRegion, ValidationError> {
    if length == 0 || address.checked_add(length - 1).is_none() {
        return Err(ValidationError::LengthInvalid(length));
    }
    regions(family)
        .iter()
        .find(|r| r.contains(address, length))
        .ok_or(ValidationError::AddressOutOfRange {
            family,
            address,
            length,
        })
}

/// Same as [`find_region`], additionally requiring the region to be
/// writable.
pub fn find_writable_region(
    family: EcuFamily,
    address: u32,
    length: u32,
) -> Result<&'static MemoryRegion, ValidationError> {
    let region = find_region(family, address, length)?;
    if region.access == Access::ReadOnly {
        return Err(ValidationError::AddressOutOfRange {
            family,
            address,
            length,
        });
    }
    Ok(region)
}
