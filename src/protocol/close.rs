//! Close frame payloads (RFC 6455 section 5.5.1 and 7.4)

use super::frame::{Frame, OpCode};

/// Well-known close status codes
pub struct CloseCode;

impl CloseCode {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// "No status received"; the default when no code is supplied
    pub const NO_STATUS: u16 = 1005;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Whether `code` may appear in a Close frame on the wire
    ///
    /// 1004-1006 and 1015 are reserved for local use, 1016-2999 are
    /// unassigned, and anything outside 1000-4999 is invalid.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

/// Control frame payloads are capped at 125 bytes, two of which hold the code
const MAX_REASON_LEN: usize = 123;

/// Build a close payload: big-endian code followed by the UTF-8 reason
///
/// The reason is cut on a character boundary so the payload never exceeds
/// the control frame limit.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(MAX_REASON_LEN);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

/// Split a close payload into (code, reason)
///
/// Payloads shorter than two bytes carry no status, reported as 1005.
pub fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (code, reason)
    } else {
        (CloseCode::NO_STATUS, String::new())
    }
}

impl Frame {
    /// Server-originated Close frame
    pub fn close(code: u16, reason: &str) -> Self {
        Frame::new(OpCode::Close, build_close_payload(code, reason))
    }
}
