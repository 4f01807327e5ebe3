//! RFC 6455 Base Framing
//!
//! Pure, stateless transforms between raw bytes and structured frames:
//!
//! - **frame**: `Frame`, `OpCode`, `encode` / `decode`, masking
//! - **close**: Close payload layout and status codes
//! - **error**: Codec and validation errors
//!
//! # Wire Layout
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking-key (0 or 4 bytes)     |     Payload Data ...     |
//! +------------------------------------+--------------------------+
//! ```
//!
//! No I/O happens here. The session layer owns buffering and retries.

pub mod close;
pub mod error;
pub mod frame;

pub use close::{build_close_payload, parse_close_payload, CloseCode};
pub use error::{FrameError, FrameResult};
pub use frame::{apply_mask, decode, decode_limited, encode, encode_masked, Frame, OpCode};
