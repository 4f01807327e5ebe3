//! Frame codec error types
//!
//! Truncation errors are recoverable: the caller keeps its buffer and retries
//! once more bytes have arrived. Everything else is a protocol violation that
//! ends the offending connection.

use thiserror::Error;

use super::close::CloseCode;

/// Errors produced while decoding or validating a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than the two fixed header bytes are available
    #[error("Truncated frame header")]
    TruncatedHeader,

    /// Extended payload length bytes are not yet available
    #[error("Truncated extended payload length")]
    TruncatedLength,

    /// Masking key bytes are not yet available
    #[error("Truncated masking key")]
    TruncatedMask,

    /// Payload bytes are not yet available
    #[error("Truncated payload: need {needed} bytes, have {available}")]
    TruncatedFrame { needed: u64, available: usize },

    /// Opcode outside the set defined by RFC 6455
    #[error("Invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    /// Declared payload exceeds the configured limit (or sets the 64-bit MSB)
    #[error("Payload length {len} exceeds maximum {max}")]
    PayloadTooLarge { len: u64, max: u64 },

    /// RSV bits set without a negotiated extension
    #[error("Non-zero reserved bits: 0b{0:03b}")]
    ReservedBits(u8),

    /// Client-to-server frame without the mask bit
    #[error("Client frame is not masked")]
    UnmaskedFrame,

    /// Close, Ping or Pong frame with FIN clear
    #[error("Control frame must not be fragmented")]
    FragmentedControl,

    /// Control frame payload above 125 bytes
    #[error("Control frame payload too long: {0} bytes")]
    ControlFrameTooLong(u64),

    /// Close frame carrying a status code that must not be sent on the wire
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),
}

impl FrameError {
    /// True for the `Truncated*` kinds: await more bytes, then retry
    pub fn is_truncated(&self) -> bool {
        matches!(
            self,
            FrameError::TruncatedHeader
                | FrameError::TruncatedLength
                | FrameError::TruncatedMask
                | FrameError::TruncatedFrame { .. }
        )
    }

    /// Status code to send when this error terminates a connection
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::PayloadTooLarge { .. } => CloseCode::MESSAGE_TOO_BIG,
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }
}

/// Result type alias for codec operations
pub type FrameResult<T> = Result<T, FrameError>;
