//! Bosch ME17 session: KWP2000-style length-prefixed frames over K-Line.
//!
//! Frame layout: `[LEN][payload...][CHK]` with `CHK = (sum(payload) + LEN) & 0xFF`.
//! Services follow the KWP2000 convention: a positive response echoes the
//! service id plus 0x40, a negative response is `7F <sid> <code>`.

use std::thread;
use std::time::Duration;

use crate::checksum::{sum8, sum16};
use crate::dtc::{self, DiagnosticCode};
use crate::ecu::{
    hex_upper, EcuFamily, EcuIdentity, EcuSession, SessionState, TransportDescriptor,
};
use crate::error::{Error, ProtocolError, Result, StateError};
use crate::memory::{self, MemoryClass};
use crate::transport::{SerialLink, TransportLink};

/// KWP2000 service ids used by the ME17.
const SID_START_COMMUNICATION: u8 = 0x81;
const SID_STOP_COMMUNICATION: u8 = 0x82;
const SID_READ_MEMORY: u8 = 0x23;
const SID_WRITE_MEMORY: u8 = 0x3D;
const SID_READ_IDENTIFICATION: u8 = 0x1A;
const SID_ROUTINE_CONTROL: u8 = 0x31;
const SID_READ_DTC: u8 = 0x19;
const SID_CLEAR_DTC: u8 = 0x14;

const POSITIVE_OFFSET: u8 = 0x40;
const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Identification record variant requested from the ECU.
const ID_OPTION_ECU_IDENT: u8 = 0x86;

/// Routine id for flash sector erase.
const ROUTINE_START: u8 = 0x01;

/// Largest data slice carried per frame; the 1-byte LEN caps the payload.
const MAX_CHUNK: usize = 0x80;

/// Fast-init wake-up pattern sent before session establishment.
const WAKE_UP: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x55, 0x01, 0x8A];

/// Encode a payload into a KWP2000-style frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > 0xFF {
        return Err(ProtocolError::InvalidFrame(format!(
            "payload length {} outside 1..=255",
            payload.len()
        ))
        .into());
    }
    let len = payload.len() as u8;
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(len);
    frame.extend_from_slice(payload);
    frame.push(sum8(payload).wrapping_add(len));
    Ok(frame)
}

/// Decode a complete frame back to its payload, verifying length and
/// checksum.
pub fn decode_frame(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < 3 {
        return Err(ProtocolError::InvalidFrame(format!("frame of {} bytes", raw.len())).into());
    }
    let len = raw[0] as usize;
    if len == 0 || raw.len() != len + 2 {
        return Err(ProtocolError::InvalidFrame(format!(
            "length byte {} disagrees with frame size {}",
            len,
            raw.len()
        ))
        .into());
    }
    let payload = &raw[1..1 + len];
    let expected = sum8(payload).wrapping_add(raw[0]);
    if raw[len + 1] != expected {
        return Err(ProtocolError::ChecksumMismatch.into());
    }
    Ok(payload.to_vec())
}

/// ME17 protocol session over a serial K-Line transport.
pub struct BoschSession {
    descriptor: TransportDescriptor,
    link: Box<dyn TransportLink>,
    state: SessionState,
    identity: Option<EcuIdentity>,
}

impl BoschSession {
    /// Session over a plain serial port (8N1) described by `descriptor`.
    pub fn new(descriptor: TransportDescriptor) -> Self {
        let link = SerialLink::new(
            descriptor.port.clone(),
            descriptor.baud_rate,
            serialport::Parity::None,
        );
        Self::with_link(descriptor, Box::new(link))
    }

    /// Session over a caller-supplied link.
    pub fn with_link(descriptor: TransportDescriptor, link: Box<dyn TransportLink>) -> Self {
        Self {
            descriptor,
            link,
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

    fn recv_payload(&mut self) -> Result<Vec<u8>> {
        let timeout = self.descriptor.timeout();
        let header = self.link.read_exact(1, timeout)?;
        let len = header[0] as usize;
        if len == 0 {
            return Err(ProtocolError::InvalidFrame("empty frame".into()).into());
        }
        let body = self.link.read_exact(len + 1, timeout)?;
        let mut raw = header;
        raw.extend_from_slice(&body);
        decode_frame(&raw)
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.link.write(&encode_frame(request)?)?;
        let payload = self.recv_payload()?;
        if payload.first() == Some(&NEGATIVE_RESPONSE) {
            let code = payload.get(2).copied().unwrap_or(0);
            return Err(Error::DeviceNak(code));
        }
        let sid = request[0];
        if payload.first() != Some(&(sid.wrapping_add(POSITIVE_OFFSET))) {
            return Err(ProtocolError::InvalidFrame(format!(
                "unexpected response 0x{:02X} to service 0x{:02X}",
                payload.first().copied().unwrap_or(0),
                sid
            ))
            .into());
        }
        Ok(payload)
    }

    /// One request/response round with local retries for "no valid frame"
    /// conditions. A device NAK is surfaced immediately.
    fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let retries = self.descriptor.retries;
        let mut attempt = 0;
        loop {
            match self.exchange(request) {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_retryable() => {
                    if attempt >= retries {
                        return Err(ProtocolError::Timeout.into());
                    }
                    attempt += 1;
                    log::warn!(
                        "ME17 service 0x{:02X}: no valid frame ({}), retry {}/{}",
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

    fn read_chunked(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length as usize);
        let mut offset = 0u32;
        while offset < length {
            let chunk = (length - offset).min(MAX_CHUNK as u32);
            let addr = address + offset;
            let request = [
                SID_READ_MEMORY,
                (addr >> 16) as u8,
                (addr >> 8) as u8,
                addr as u8,
                (chunk >> 8) as u8,
                chunk as u8,
            ];
            let payload = self.transact(&request)?;
            let data = &payload[1..];
            if data.len() != chunk as usize {
                return Err(ProtocolError::InvalidFrame(format!(
                    "asked for {} bytes, got {}",
                    chunk,
                    data.len()
                ))
                .into());
            }
            out.extend_from_slice(data);
            offset += chunk;
        }
        Ok(out)
    }

    fn erase_sector(&mut self, sector: u32) -> Result<()> {
        log::info!("ME17 erasing flash sector 0x{:06X}", sector);
        let request = [
            SID_ROUTINE_CONTROL,
            ROUTINE_START,
            (sector >> 16) as u8,
            (sector >> 8) as u8,
            sector as u8,
        ];
        self.transact(&request)?;
        Ok(())
    }

    /// Checksum readback over the freshly written range. The device ACK is
    /// not trusted on its own.
    fn verify_written(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let readback = self.read_chunked(address, data.len() as u32)?;
        let expected = sum16(data);
        let actual = sum16(&readback);
        if expected != actual {
            return Err(Error::VerifyMismatch { expected, actual });
        }
        Ok(())
    }

    fn capture_identity(&mut self) -> EcuIdentity {
        let mut identity = EcuIdentity::new(
            EcuFamily::Bosch,
            "KWP2000",
            self.descriptor.connection_string(),
        );
        // Identification is best-effort; a mute ECU still connects.
        match self.transact(&[SID_READ_IDENTIFICATION, ID_OPTION_ECU_IDENT]) {
            Ok(payload) if payload.len() >= 22 => {
                let data = &payload[2..];
                identity.part_number = Some(hex_upper(&data[0..10]));
                identity.software_version = Some(hex_upper(&data[10..14]));
                identity.hardware_version = Some(hex_upper(&data[14..18]));
                identity
                    .extra
                    .insert("supplier_id".into(), hex_upper(&data[18..20]));
            }
            Ok(_) => log::warn!("ME17 identification response too short"),
            Err(e) => log::warn!("ME17 identification unavailable: {}", e),
        }
        identity
    }
}

impl EcuSession for BoschSession {
    fn family(&self) -> EcuFamily {
        EcuFamily::Bosch
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
        log::info!("Connecting to Bosch ME17 on {}", self.descriptor.port);

        let result = (|| -> Result<()> {
            self.link.open()?;
            self.link.write(WAKE_UP)?;
            thread::sleep(Duration::from_millis(50));
            self.transact(&[SID_START_COMMUNICATION])?;
            Ok(())
        })();

        if let Err(e) = result {
            self.link.close();
            self.state = SessionState::Disconnected;
            return Err(e);
        }

        self.state = SessionState::Connected;
        let identity = self.capture_identity();
        self.identity = Some(identity.clone());
        log::info!("Connected to Bosch ME17");
        Ok(identity)
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.state != SessionState::Connected {
            return Ok(());
        }
        self.state = SessionState::Disconnecting;
        // Teardown is best-effort; the transport closes regardless.
        if let Err(e) = self.transact(&[SID_STOP_COMMUNICATION]) {
            log::warn!("ME17 stop communication failed: {}", e);
        }
        self.link.close();
        self.identity = None;
        self.state = SessionState::Disconnected;
        log::info!("Disconnected from Bosch ME17");
        Ok(())
    }

    fn read_memory(&mut self, address: u32, length: u32) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        memory::find_region(EcuFamily::Bosch, address, length)?;
        self.read_chunked(address, length)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        let region = memory::find_writable_region(EcuFamily::Bosch, address, data.len() as u32)?;

        if region.class == MemoryClass::Flash {
            let sector_size = memory::sector_size(EcuFamily::Bosch);
            let first = memory::align_sector(EcuFamily::Bosch, address);
            let last = memory::align_sector(EcuFamily::Bosch, address + data.len() as u32 - 1);
            let mut sector = first;
            while sector <= last {
                self.erase_sector(sector)?;
                sector += sector_size;
            }
        }

        for (i, chunk) in data.chunks(MAX_CHUNK).enumerate() {
            let addr = address + (i * MAX_CHUNK) as u32;
            let mut request = Vec::with_capacity(4 + chunk.len());
            request.push(SID_WRITE_MEMORY);
            request.push((addr >> 16) as u8);
            request.push((addr >> 8) as u8);
            request.push(addr as u8);
            request.extend_from_slice(chunk);
            self.transact(&request)?;
        }

        if region.class == MemoryClass::Flash {
            self.verify_written(address, data)?;
        }
        log::debug!("ME17 wrote {} bytes at 0x{:06X}", data.len(), address);
        Ok(())
    }

    fn identity(&self) -> Option<&EcuIdentity> {
        self.identity.as_ref()
    }

    fn read_dtcs(&mut self) -> Result<Vec<DiagnosticCode>> {
        self.ensure_connected()?;
        let payload = self.transact(&[SID_READ_DTC, 0x02])?;
        // A bare acknowledgment carries no code list.
        if payload.len() < 2 {
            return Ok(Vec::new());
        }
        Ok(dtc::decode_list(&payload[2..]))
    }

    fn clear_dtcs(&mut self) -> Result<()> {
        self.ensure_connected()?;
        self.transact(&[SID_CLEAR_DTC, 0xFF, 0x00])?;
        log::info!("ME17 DTCs cleared");
        Ok(())
    }
}
