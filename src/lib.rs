//! ECU diagnostic and programming bridge.
//!
//! Talks to engine control units over serial (K-Line) and CAN transports to
//! read and program firmware/calibration memory and to retrieve or clear
//! diagnostic trouble codes, across three vendor protocol families behind
//! one capability interface:
//!
//! - **Bosch ME17** — KWP2000-style length-prefixed frames over K-Line
//! - **Denso SH705x** — STX/ETX framed serial protocol, even parity
//! - **Siemens MSV** — UDS (ISO 14229) over ISO-TP on CAN
//!
//! The [`bridge::EcuBridge`] coordinator owns one session per family,
//! tracks the active one, and routes family-less calls to it. Callers
//! supply connection parameters as [`ecu::TransportDescriptor`] values;
//! nothing is hardcoded here.

pub mod bosch;
pub mod bridge;
pub mod checksum;
pub mod denso;
pub mod dtc;
pub mod ecu;
pub mod error;
pub mod isotp;
pub mod memory;
pub mod siemens;
pub mod transport;


pub use bosch::BoschSession;
pub use bridge::{EcuBridge, SessionRecord};
pub use denso::DensoSession;
pub use dtc::{DiagnosticCode, DtcDomain};
pub use ecu::{
    EcuFamily, EcuIdentity, EcuSession, SessionState, TransportDescriptor, TransportKind,
};
pub use error::{Error, ProtocolError, Result, StateError, TransportError, ValidationError};
pub use memory::{Access, MemoryClass, MemoryRegion};
pub use siemens::SiemensSession;
pub use transport::{CanLink, FrameBus, SerialCanBridge, SerialLink, TransportLink};
