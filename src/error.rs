//! Error taxonomy for ECU communication.
//!
//! Link-level failures, framing failures, explicit device rejections, state
//! misuse, and pre-flight validation are distinct kinds: a caller can always
//! tell "the wire broke" from "the device said no" from "you called this in
//! the wrong order".

use thiserror::Error;

use crate::ecu::EcuFamily;

/// Byte/frame level link failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read timed out")]
    TimedOut,

    #[error("link is not open")]
    NotOpen,

    #[error("invalid CAN arbitration id 0x{0:X}")]
    InvalidId(u32),
}

/// No valid frame was obtained from the link.
///
/// A checksum mismatch or a short/garbled read is not distinct from a
/// timeout at the operation level: all three mean "no valid frame received"
/// and are retried up to the descriptor's retry count before surfacing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("no response within timeout")]
    Timeout,
}

/// Operation called against the wrong session state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("no active session")]
    NoActiveSession,

    #[error("no session registered for {0}")]
    UnsupportedFamily(EcuFamily),
}

/// Request rejected before any frame was sent.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("address range 0x{address:08X}+0x{length:X} is outside the {family} memory map")]
    AddressOutOfRange {
        family: EcuFamily,
        address: u32,
        length: u32,
    },

    #[error("invalid length {0}")]
    LengthInvalid(u32),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The device explicitly rejected the request. Never auto-retried.
    #[error("device rejected request, error code 0x{0:02X}")]
    DeviceNak(u8),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Device acknowledged a write but the readback checksum disagrees.
    #[error("write verification failed: expected checksum 0x{expected:04X}, got 0x{actual:04X}")]
    VerifyMismatch { expected: u16, actual: u16 },

    #[error("session export failed: {0}")]
    Export(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the "no valid frame" conditions that are retried locally.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Protocol(
                ProtocolError::ChecksumMismatch
                    | ProtocolError::InvalidFrame(_)
                    | ProtocolError::Timeout
            ) | Error::Transport(TransportError::TimedOut)
        )
    }
}
