//! Siemens MSV session: UDS (ISO 14229) over ISO-TP.
//!
//! Runs on a real CAN interface or on a serial cable that bridges CAN
//! frames, selected by the transport descriptor. Addressing is fixed:
//! requests go out on 0x7E0, responses arrive on 0x7E8. Memory access is
//! data-identifier based; the DID is derived from the address.

use crate::checksum::sum16;
use crate::dtc::{self, DiagnosticCode};
use crate::ecu::{
    ascii_field, hex_upper, EcuFamily, EcuIdentity, EcuSession, SessionState,
    TransportDescriptor, TransportKind,
};
use crate::error::{Error, ProtocolError, Result, StateError, ValidationError};
use crate::isotp::IsoTpEndpoint;
use crate::memory::{self, MemoryClass};
use crate::transport::{CanLink, FrameBus, SerialCanBridge, SerialLink};

const REQUEST_ID: u32 = 0x7E0;
const RESPONSE_ID: u32 = 0x7E8;

const SID_SESSION_CONTROL: u8 = 0x10;
const SID_READ_DATA_BY_ID: u8 = 0x22;
const SID_WRITE_DATA_BY_ID: u8 = 0x2E;
const SID_ROUTINE_CONTROL: u8 = 0x31;
const SID_READ_DTC_INFO: u8 = 0x19;
const SID_CLEAR_DTC: u8 = 0x14;

const SESSION_DEFAULT: u8 = 0x01;
const SESSION_EXTENDED: u8 = 0x03;

const ROUTINE_START: u8 = 0x01;
/// Routine identifier for flash sector erase.
const ROUTINE_ERASE: [u8; 2] = [0xFF, 0x00];

const POSITIVE_OFFSET: u8 = 0x40;
const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Identification data identifiers.
const DID_ACTIVE_SESSION: u16 = 0xF186;
const DID_PART_NUMBER: u16 = 0xF187;
const DID_SOFTWARE_VERSION: u16 = 0xF189;

/// Largest payload after the 3-byte service header within one ISO-TP
/// message.
const MAX_DATA: usize = 0x0FFF - 3;

/// MSV protocol session.
pub struct SiemensSession {
    descriptor: TransportDescriptor,
    bus: Box<dyn FrameBus>,
    endpoint: IsoTpEndpoint,
    state: SessionState,
    identity: Option<EcuIdentity>,
}

impl SiemensSession {
    /// Session over SocketCAN or, for serial descriptors, over a CAN
    /// bridge cable.
    pub fn new(descriptor: TransportDescriptor) -> Self {
        let bus: Box<dyn FrameBus> = match descriptor.kind {
            TransportKind::Can => Box::new(CanLink::new(descriptor.port.clone())),
            TransportKind::Serial => Box::new(SerialCanBridge::new(Box::new(SerialLink::new(
                descriptor.port.clone(),
                descriptor.baud_rate,
                serialport::Parity::None,
            )))),
        };
        Self::with_bus(descriptor, bus)
    }

    pub fn with_bus(descriptor: TransportDescriptor, bus: Box<dyn FrameBus>) -> Self {
        Self {
            descriptor,
            bus,
            endpoint: IsoTpEndpoint::new(REQUEST_ID, RESPONSE_ID),
            state: SessionState::Disconnected,
            identity: None,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(StateError::NotConnected.into());
        }
        Ok(())
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let timeout = self.descriptor.timeout();
        let response = self
            .endpoint
            .transact(self.bus.as_mut(), request, timeout)?;
        if response.first() == Some(&NEGATIVE_RESPONSE) {
            let nrc = response.get(2).copied().unwrap_or(0);
            return Err(Error::DeviceNak(nrc));
        }
        let sid = request[0];
        if response.first() != Some(&(sid.wrapping_add(POSITIVE_OFFSET))) {
            return Err(ProtocolError::InvalidFrame(format!(
                "unexpected response 0x{:02X} to service 0x{:02X}",
                response.first().copied().unwrap_or(0),
                sid
            ))
            .into());
        }
        Ok(response)
    }

    fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let retries = self.descriptor.retries;
        let mut attempt = 0;
        loop {
            match self.exchange(request) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    if attempt >= retries {
                        return Err(ProtocolError::Timeout.into());
                    }
                    attempt += 1;
                    log::warn!(
                        "MSV service 0x{:02X}: no valid frame ({}), retry {}/{}",
                        request[0],
                        e,
                        attempt,
                        retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn did_for(address: u32) -> u16 {
        ((address >> 8) & 0xFFFF) as u16
    }

    /// ReadDataByIdentifier, returning the record bytes after the echoed
    /// DID.
    fn read_did(&mut self, did: u16) -> Result<Vec<u8>> {
        let [hi, lo] = did.to_be_bytes();
        let response = self.transact(&[SID_READ_DATA_BY_ID, hi, lo])?;
        if response.len() < 3 || response[1] != hi || response[2] != lo {
            return Err(ProtocolError::InvalidFrame(format!(
                "DID 0x{:04X} echo missing in response",
                did
            ))
            .into());
        }
        Ok(response[3..].to_vec())
    }

    fn erase_sector(&mut self, sector: u32) -> Result<()> {
        log::info!("MSV erasing flash sector 0x{:08X}", sector);
        let mut request = vec![SID_ROUTINE_CONTROL, ROUTINE_START];
        request.extend_from_slice(&ROUTINE_ERASE);
        request.extend_from_slice(&sector.to_be_bytes());
        self.transact(&request)?;
        Ok(())
    }

    fn verify_written(&mut self, did: u16, data: &[u8]) -> Result<()> {
        let record = self.read_did(did)?;
        if record.len() < data.len() {
            return Err(ProtocolError::InvalidFrame(format!(
                "verify readback returned {} of {} bytes",
                record.len(),
                data.len()
            ))
            .into());
        }
        let expected = sum16(data);
        let actual = sum16(&record[..data.len()]);
        if expected != actual {
            return Err(Error::VerifyMismatch { expected, actual });
        }
        Ok(())
    }

    fn capture_identity(&mut self) -> EcuIdentity {
        let mut identity = EcuIdentity::new(
            EcuFamily::Siemens,
            "UDS/ISO14229",
            self.descriptor.connection_string(),
        );
        // Each DID is best-effort; not every MSV variant serves all three.
        match self.read_did(DID_PART_NUMBER) {
            Ok(record) => identity.part_number = Some(ascii_field(&record)),
            Err(e) => log::warn!("MSV part number unavailable: {}", e),
        }
        match self.read_did(DID_SOFTWARE_VERSION) {
            Ok(record) => identity.software_version = Some(ascii_field(&record)),
            Err(e) => log::warn!("MSV software version unavailable: {}", e),
        }
        match self.read_did(DID_ACTIVE_SESSION) {
            Ok(record) => {
                identity
                    .extra
                    .insert("active_session".into(), hex_upper(&record));
            }
            Err(e) => log::warn!("MSV active session unavailable: {}", e),
        }
        identity
    }
}

impl EcuSession for SiemensSession {
    fn family(&self) -> EcuFamily {
        EcuFamily::Siemens
    }

    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn connect(&mut self) -> Result<EcuIdentity> {
        if self.state == SessionState::Connected {
            return Err(StateError::AlreadyConnected.into());
        }
        self.state = SessionState::Connecting;
        log::info!("Connecting to Siemens MSV on {}", self.descriptor.port);

        let result = (|| -> Result<()> {
            self.bus.open()?;
            self.transact(&[SID_SESSION_CONTROL, SESSION_EXTENDED])?;
            Ok(())
        })();

        if let Err(e) = result {
            self.bus.close();
            self.state = SessionState::Disconnected;
            return Err(e);
        }

        self.state = SessionState::Connected;
        let identity = self.capture_identity();
        self.identity = Some(identity.clone());
        log::info!("Connected to Siemens MSV");
        Ok(identity)
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.state != SessionState::Connected {
            return Ok(());
        }
        self.state = SessionState::Disconnecting;
        // Drop back to the default session; best-effort.
        if let Err(e) = self.transact(&[SID_SESSION_CONTROL, SESSION_DEFAULT]) {
            log::warn!("MSV default session request failed: {}", e);
        }
        self.bus.close();
        self.identity = None;
        self.state = SessionState::Disconnected;
        log::info!("Disconnected from Siemens MSV");
        Ok(())
    }

    fn read_memory(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        memory::find_region(EcuFamily::Siemens, address, length)?;
        if length as usize > MAX_DATA {
            return Err(ValidationError::LengthInvalid(length).into());
        }
        let did = Self::did_for(address);
        let record = self.read_did(did)?;
        if record.len() < length as usize {
            return Err(ProtocolError::InvalidFrame(format!(
                "DID 0x{:04X} returned {} of {} bytes",
                did,
                record.len(),
                length
            ))
            .into());
        }
        Ok(record[..length as usize].to_vec())
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        let region = memory::find_writable_region(EcuFamily::Siemens, address, data.len() as u32)?;
        if data.len() > MAX_DATA {
            return Err(ValidationError::LengthInvalid(data.len() as u32).into());
        }

        if region.class == MemoryClass::Flash {
            let sector_size = memory::sector_size(EcuFamily::Siemens);
            let first = memory::align_sector(EcuFamily::Siemens, address);
            let last = memory::align_sector(EcuFamily::Siemens, address + data.len() as u32 - 1);
            let mut sector = first;
            while sector <= last {
                self.erase_sector(sector)?;
                sector += sector_size;
            }
        }

        let did = Self::did_for(address);
        let [hi, lo] = did.to_be_bytes();
        let mut request = Vec::with_capacity(3 + data.len());
        request.push(SID_WRITE_DATA_BY_ID);
        request.push(hi);
        request.push(lo);
        request.extend_from_slice(data);
        // Segmentation for large records happens in the ISO-TP layer.
        self.transact(&request)?;

        if region.class == MemoryClass::Flash {
            self.verify_written(did, data)?;
        }
        log::debug!("MSV wrote {} bytes to DID 0x{:04X}", data.len(), did);
        Ok(())
    }

    fn identity(&self) -> Option<&EcuIdentity> {
        self.identity.as_ref()
    }

    fn read_dtcs(&mut self) -> Result<Vec<DiagnosticCode>> {
        self.ensure_connected()?;
        // Report DTCs by status mask: all confirmed codes.
        let response = self.transact(&[SID_READ_DTC_INFO, 0x02, 0xFF])?;
        if response.len() < 3 {
            return Ok(Vec::new());
        }
        Ok(dtc::decode_list(&response[3..]))
    }

    fn clear_dtcs(&mut self) -> Result<()> {
        self.ensure_connected()?;
        // Group-of-DTC 0xFFFFFF clears everything.
        self.transact(&[SID_CLEAR_DTC, 0xFF, 0xFF, 0xFF])?;
        log::info!("MSV DTCs cleared");
        Ok(())
    }
}
