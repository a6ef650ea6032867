//! Core ECU types: families, transport descriptors, session state, and the
//! capability interface implemented by each protocol family.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::dtc::DiagnosticCode;
use crate::error::Result;

/// Supported ECU families. Determines the memory map, frame format, and
/// opcode set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EcuFamily {
    Bosch,
    Siemens,
    Denso,
}

impl fmt::Display for EcuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EcuFamily::Bosch => "Bosch ME17",
            EcuFamily::Siemens => "Siemens MSV",
            EcuFamily::Denso => "Denso SH705x",
        };
        f.write_str(name)
    }
}

/// Physical transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Serial,
    Can,
}

/// Immutable description of how to reach an ECU. Supplied by the caller —
/// the core never hardcodes device paths or rates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDescriptor {
    pub kind: TransportKind,
    /// Device path (`/dev/ttyUSB0`) or CAN interface name (`can0`).
    pub port: String,
    /// Serial baud rate; ignored for CAN.
    pub baud_rate: u32,
    /// CAN bit rate; informational for SocketCAN (the interface is
    /// configured out of band) and used by the serial CAN bridge.
    pub bitrate: u32,
    /// Per-read timeout in milliseconds.
    pub timeout_ms: u64,
    /// Local retries for "no valid frame" conditions.
    pub retries: u8,
}

impl TransportDescriptor {
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            kind: TransportKind::Serial,
            port: port.into(),
            baud_rate,
            bitrate: 0,
            timeout_ms: 1000,
            retries: 3,
        }
    }

    pub fn can(interface: impl Into<String>, bitrate: u32) -> Self {
        Self {
            kind: TransportKind::Can,
            port: interface.into(),
            baud_rate: 0,
            bitrate,
            timeout_ms: 1000,
            retries: 3,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Human-readable connection string, e.g. `/dev/ttyUSB0@38400`.
    pub fn connection_string(&self) -> String {
        match self.kind {
            TransportKind::Serial => format!("{}@{}", self.port, self.baud_rate),
            TransportKind::Can => format!("{}@{}", self.port, self.bitrate),
        }
    }
}

/// Session lifecycle. `Connecting` and `Disconnecting` are transient and
/// resolve within a single operation call; no half-connected state is ever
/// observable between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Identification snapshot captured when a session connects.
///
/// The fixed fields cover what the identification commands of all three
/// families expose; anything genuinely family-specific lands in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuIdentity {
    pub family: EcuFamily,
    pub protocol: String,
    pub connection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rom_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_size: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl EcuIdentity {
    pub fn new(family: EcuFamily, protocol: &str, connection: String) -> Self {
        Self {
            family,
            protocol: protocol.to_string(),
            connection,
            part_number: None,
            software_version: None,
            hardware_version: None,
            cpu_id: None,
            rom_size: None,
            ram_size: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Uppercase hex rendering of a raw identification field.
pub(crate) fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Printable projection of a fixed-width ASCII identification field,
/// padding stripped.
pub(crate) fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Capability interface implemented once per ECU family.
///
/// All operations are synchronous and half-duplex: a session never has two
/// frames in flight. Operations other than `connect`/`disconnect` require
/// the `Connected` state and fail with `StateError::NotConnected` before any
/// transport I/O otherwise.
pub trait EcuSession: Send {
    fn family(&self) -> EcuFamily;

    fn descriptor(&self) -> &TransportDescriptor;

    fn state(&self) -> SessionState;

    /// Open the transport, run the family's wake-up and session
    /// establishment sequence, and capture the identification snapshot.
    /// Any failure leaves the session `Disconnected`.
    fn connect(&mut self) -> Result<EcuIdentity>;

    /// Send the family's teardown frame (best-effort) and close the
    /// transport. Idempotent: disconnecting a `Disconnected` session
    /// succeeds without I/O.
    fn disconnect(&mut self) -> Result<()>;

    /// Read `length` bytes starting at `address`. The range must lie
    /// entirely within one declared memory region of the family.
    fn read_memory(&mut self, address: u32, length: u32) -> Result<Vec<u8>>;

    /// Write `data` at `address`. Flash-class regions are erased
    /// sector-by-sector first and verified by checksum readback after the
    /// device acknowledges.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// The identification snapshot captured at connect, if connected.
    fn identity(&self) -> Option<&EcuIdentity>;

    fn read_dtcs(&mut self) -> Result<Vec<DiagnosticCode>>;

    fn clear_dtcs(&mut self) -> Result<()>;
}
