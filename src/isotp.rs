//! ISO-TP (ISO 15765-2) transport layer over a [`FrameBus`].
//!
//! Carries diagnostic payloads longer than a single CAN frame by segmenting
//! them into First/Consecutive frames, gated by the peer's Flow Control.
//! Used by the Siemens UDS stack; addressing is fixed per endpoint
//! (request id and response id).

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{ProtocolError, Result, TransportError};
use crate::transport::FrameBus;

/// ISO-TP frame types, from the high nibble of the PCI byte.
pub const PCI_SINGLE: u8 = 0x00;
pub const PCI_FIRST: u8 = 0x10;
pub const PCI_CONSECUTIVE: u8 = 0x20;
pub const PCI_FLOW_CONTROL: u8 = 0x30;

/// One ISO-TP frame, decoded from or encoded into 8 CAN data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoTpFrame {
    pub frame_type: u8,
    pub data: Vec<u8>,
    pub sequence: Option<u8>,
    pub total_length: Option<u16>,
}

impl IsoTpFrame {
    /// Single frame; payload up to 7 bytes.
    pub fn single(data: Vec<u8>) -> Result<Self> {
        if data.len() > 7 {
            return Err(ProtocolError::InvalidFrame(format!(
                "{} bytes do not fit a single frame",
                data.len()
            ))
            .into());
        }
        Ok(Self {
            frame_type: PCI_SINGLE,
            data,
            sequence: None,
            total_length: None,
        })
    }

    /// First frame of a segmented message; carries the first 6 bytes.
    pub fn first(data: &[u8], total_length: u16) -> Self {
        Self {
            frame_type: PCI_FIRST,
            data: data[..6.min(data.len())].to_vec(),
            sequence: None,
            total_length: Some(total_length),
        }
    }

    /// Consecutive frame; sequence wraps modulo 16.
    pub fn consecutive(data: Vec<u8>, sequence: u8) -> Self {
        Self {
            frame_type: PCI_CONSECUTIVE,
            data,
            sequence: Some(sequence & 0x0F),
            total_length: None,
        }
    }

    /// Flow control frame: flag (0 = clear to send), block size,
    /// separation time.
    pub fn flow_control(flag: u8, block_size: u8, separation_time: u8) -> Self {
        Self {
            frame_type: PCI_FLOW_CONTROL,
            data: vec![flag, block_size, separation_time],
            sequence: None,
            total_length: None,
        }
    }

    /// Encode into the 8 data bytes of a CAN frame, zero-padded.
    pub fn to_can_data(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        match self.frame_type & 0xF0 {
            PCI_SINGLE => {
                out[0] = self.data.len() as u8;
                out[1..1 + self.data.len()].copy_from_slice(&self.data);
            }
            PCI_FIRST => {
                let len = self.total_length.unwrap_or(0);
                out[0] = PCI_FIRST | ((len >> 8) as u8 & 0x0F);
                out[1] = (len & 0xFF) as u8;
                let n = self.data.len().min(6);
                out[2..2 + n].copy_from_slice(&self.data[..n]);
            }
            PCI_CONSECUTIVE => {
                out[0] = PCI_CONSECUTIVE | (self.sequence.unwrap_or(0) & 0x0F);
                let n = self.data.len().min(7);
                out[1..1 + n].copy_from_slice(&self.data[..n]);
            }
            _ => {
                out[0] = PCI_FLOW_CONTROL | (self.data.first().copied().unwrap_or(0) & 0x0F);
                out[1] = self.data.get(1).copied().unwrap_or(0);
                out[2] = self.data.get(2).copied().unwrap_or(0);
            }
        }
        out
    }

    /// Decode from the 8 data bytes of a CAN frame.
    pub fn from_can_data(data: &[u8; 8]) -> Result<Self> {
        let pci = data[0];
        match pci & 0xF0 {
            PCI_SINGLE => {
                let len = (pci & 0x0F) as usize;
                if len == 0 || len > 7 {
                    return Err(ProtocolError::InvalidFrame(format!(
                        "single frame length {} outside 1..=7",
                        len
                    ))
                    .into());
                }
                Ok(Self {
                    frame_type: PCI_SINGLE,
                    data: data[1..=len].to_vec(),
                    sequence: None,
                    total_length: None,
                })
            }
            PCI_FIRST => {
                let len = (((pci & 0x0F) as u16) << 8) | data[1] as u16;
                Ok(Self {
                    frame_type: PCI_FIRST,
                    data: data[2..8].to_vec(),
                    sequence: None,
                    total_length: Some(len),
                })
            }
            PCI_CONSECUTIVE => Ok(Self {
                frame_type: PCI_CONSECUTIVE,
                data: data[1..].to_vec(),
                sequence: Some(pci & 0x0F),
                total_length: None,
            }),
            PCI_FLOW_CONTROL => Ok(Self {
                frame_type: PCI_FLOW_CONTROL,
                data: vec![pci & 0x0F, data[1], data[2]],
                sequence: None,
                total_length: None,
            }),
            other => Err(ProtocolError::InvalidFrame(format!(
                "unknown PCI type 0x{:02X}",
                other
            ))
            .into()),
        }
    }
}

/// Fixed-address ISO-TP endpoint: one request id, one response id.
#[derive(Debug, Clone, Copy)]
pub struct IsoTpEndpoint {
    pub tx_id: u32,
    pub rx_id: u32,
}

impl IsoTpEndpoint {
    pub fn new(tx_id: u32, rx_id: u32) -> Self {
        Self { tx_id, rx_id }
    }

    /// Send one complete message, segmenting if it exceeds 7 bytes.
    pub fn send(&self, bus: &mut dyn FrameBus, data: &[u8], timeout: Duration) -> Result<()> {
        if data.is_empty() || data.len() > 0x0FFF {
            return Err(ProtocolError::InvalidFrame(format!(
                "message length {} outside 1..=4095",
                data.len()
            ))
            .into());
        }

        if data.len() <= 7 {
            let frame = IsoTpFrame::single(data.to_vec())?;
            return Ok(bus.send(self.tx_id, frame.to_can_data())?);
        }

        let first = IsoTpFrame::first(data, data.len() as u16);
        bus.send(self.tx_id, first.to_can_data())?;

        let (mut block_size, mut separation) = self.await_flow_control(bus, timeout)?;

        let mut offset = 6;
        let mut sequence = 1u8;
        let mut sent_in_block = 0u8;

        while offset < data.len() {
            let chunk_end = (offset + 7).min(data.len());
            let cf = IsoTpFrame::consecutive(data[offset..chunk_end].to_vec(), sequence);
            bus.send(self.tx_id, cf.to_can_data())?;

            offset = chunk_end;
            sequence = (sequence + 1) & 0x0F;
            sent_in_block += 1;

            if offset < data.len() {
                if block_size != 0 && sent_in_block == block_size {
                    let (bs, st) = self.await_flow_control(bus, timeout)?;
                    block_size = bs;
                    separation = st;
                    sent_in_block = 0;
                } else if separation > 0 && separation <= 0x7F {
                    thread::sleep(Duration::from_millis(separation as u64));
                }
            }
        }
        Ok(())
    }

    /// Receive one complete message, reassembling segmented responses and
    /// answering First Frames with a clear-to-send Flow Control.
    pub fn receive(&self, bus: &mut dyn FrameBus, timeout: Duration) -> Result<Vec<u8>> {
        let start = Instant::now();
        let frame = IsoTpFrame::from_can_data(&bus.recv(self.rx_id, timeout)?)?;

        match frame.frame_type {
            PCI_SINGLE => Ok(frame.data),
            PCI_FIRST => {
                let total = frame.total_length.unwrap_or(0) as usize;
                let mut message = frame.data;

                let cts = IsoTpFrame::flow_control(0, 0, 0);
                bus.send(self.tx_id, cts.to_can_data())?;

                let mut expected_seq = 1u8;
                while message.len() < total {
                    let remaining = timeout
                        .checked_sub(start.elapsed())
                        .ok_or(TransportError::TimedOut)?;
                    let cf = IsoTpFrame::from_can_data(&bus.recv(self.rx_id, remaining)?)?;
                    if cf.frame_type != PCI_CONSECUTIVE {
                        return Err(ProtocolError::InvalidFrame(format!(
                            "expected consecutive frame, got PCI 0x{:02X}",
                            cf.frame_type
                        ))
                        .into());
                    }
                    let seq = cf.sequence.unwrap_or(0);
                    if seq != expected_seq {
                        return Err(ProtocolError::InvalidFrame(format!(
                            "sequence jump: expected {}, got {}",
                            expected_seq, seq
                        ))
                        .into());
                    }
                    message.extend_from_slice(&cf.data);
                    expected_seq = (expected_seq + 1) & 0x0F;
                }
                message.truncate(total);
                Ok(message)
            }
            other => Err(ProtocolError::InvalidFrame(format!(
                "unexpected PCI 0x{:02X} at message start",
                other
            ))
            .into()),
        }
    }

    /// Send a request and collect the reassembled response.
    pub fn transact(
        &self,
        bus: &mut dyn FrameBus,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.send(bus, request, timeout)?;
        self.receive(bus, timeout)
    }

    fn await_flow_control(
        &self,
        bus: &mut dyn FrameBus,
        timeout: Duration,
    ) -> Result<(u8, u8)> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(TransportError::TimedOut)?;
            let frame = IsoTpFrame::from_can_data(&bus.recv(self.rx_id, remaining)?)?;
            if frame.frame_type != PCI_FLOW_CONTROL {
                return Err(ProtocolError::InvalidFrame(format!(
                    "expected flow control, got PCI 0x{:02X}",
                    frame.frame_type
                ))
                .into());
            }
            match frame.data.first().copied().unwrap_or(0) {
                // Clear to send: (block size, separation time).
                0 => return Ok((frame.data[1], frame.data[2])),
                // Wait: the peer will send another flow control.
                1 => continue,
                flag => {
                    return Err(ProtocolError::InvalidFrame(format!(
                        "flow control abort (flag {})",
                        flag
                    ))
                    .into())
                }
            }
        }
    }
}
