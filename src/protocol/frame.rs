//! Frame codec (RFC 6455 section 5.2 and 5.3)
//!
//! `decode` parses one frame from the front of a buffer and reports how many
//! bytes it occupied; it never consumes anything on failure, so a truncated
//! buffer can simply be retried once more data has been appended. `encode`
//! produces unmasked server frames. Bit-level layout stays in this file.

use super::error::{FrameError, FrameResult};

/// Largest payload representable on the wire (the 64-bit length MSB must be 0)
const MAX_WIRE_PAYLOAD: u64 = i64::MAX as u64;

/// Control frames carry at most 125 payload bytes
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Parse the low nibble of the first header byte
    pub fn from_u8(value: u8) -> FrameResult<OpCode> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(FrameError::InvalidOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, Ping and Pong
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

/// A decoded protocol unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Set on the last fragment of a message
    pub fin: bool,
    pub opcode: OpCode,
    /// RSV1-3, right-aligned
    pub reserved: u8,
    /// Key the payload arrived masked with; `None` for unmasked frames
    pub mask_key: Option<[u8; 4]>,
    /// Payload, already unmasked
    pub payload: Vec<u8>,
}

impl Frame {
    /// Final, unmasked frame with no reserved bits
    pub fn new(opcode: OpCode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            reserved: 0,
            mask_key: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, text.into().into_bytes())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Ping, data)
    }

    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// Set or clear the FIN bit
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Attach a masking key (client-originated frames)
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask_key = Some(key);
        self
    }

    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Check the rules every client-to-server frame must satisfy
    ///
    /// `strict` rejects non-zero reserved bits; no extensions are ever
    /// negotiated, so a relay should normally run strict.
    pub fn validate_inbound(&self, strict: bool) -> FrameResult<()> {
        if strict && self.reserved != 0 {
            return Err(FrameError::ReservedBits(self.reserved));
        }
        if !self.is_masked() {
            return Err(FrameError::UnmaskedFrame);
        }
        if self.opcode.is_control() {
            if !self.fin {
                return Err(FrameError::FragmentedControl);
            }
            if self.payload_len() > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlFrameTooLong(self.payload_len()));
            }
        }
        Ok(())
    }
}

/// XOR a payload with a 4-byte key; applying it twice restores the input
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decode one frame with no payload limit beyond what the wire allows
pub fn decode(buf: &[u8]) -> FrameResult<(Frame, usize)> {
    decode_limited(buf, MAX_WIRE_PAYLOAD)
}

/// Decode one frame from the front of `buf`
///
/// Returns the frame and the number of bytes it occupied. On any error the
/// buffer is left untouched; `Truncated*` errors mean "retry with more data".
pub fn decode_limited(buf: &[u8], max_payload: u64) -> FrameResult<(Frame, usize)> {
    let [b0, b1] = take::<2>(buf, 0, FrameError::TruncatedHeader)?;

    let fin = b0 & 0x80 != 0;
    let reserved = (b0 >> 4) & 0x07;
    let opcode = OpCode::from_u8(b0 & 0x0F)?;
    let masked = b1 & 0x80 != 0;

    let mut cursor = 2;
    let payload_len = match b1 & 0x7F {
        126 => {
            let ext = take::<2>(buf, cursor, FrameError::TruncatedLength)?;
            cursor += 2;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let ext = take::<8>(buf, cursor, FrameError::TruncatedLength)?;
            cursor += 8;
            u64::from_be_bytes(ext)
        }
        literal => literal as u64,
    };

    let max = max_payload.min(MAX_WIRE_PAYLOAD);
    if payload_len > max {
        return Err(FrameError::PayloadTooLarge {
            len: payload_len,
            max,
        });
    }

    let mask_key = if masked {
        let key = take::<4>(buf, cursor, FrameError::TruncatedMask)?;
        cursor += 4;
        Some(key)
    } else {
        None
    };

    let available = buf.len() - cursor;
    if (available as u64) < payload_len {
        return Err(FrameError::TruncatedFrame {
            needed: payload_len,
            available,
        });
    }

    let end = cursor + payload_len as usize;
    let mut payload = buf[cursor..end].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok((
        Frame {
            fin,
            opcode,
            reserved,
            mask_key,
            payload,
        },
        end,
    ))
}

/// Encode a server frame; the mask bit is never set
pub fn encode(frame: &Frame) -> Vec<u8> {
    write_frame(frame, None)
}

/// Encode a client frame, masking the payload with `key`
///
/// Servers never send these; this exists for clients and test tooling.
pub fn encode_masked(frame: &Frame, key: [u8; 4]) -> Vec<u8> {
    write_frame(frame, Some(key))
}

fn write_frame(frame: &Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(14 + len);

    let fin = if frame.fin { 0x80 } else { 0x00 };
    out.push(fin | ((frame.reserved & 0x07) << 4) | frame.opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(&frame.payload),
    }

    out
}

fn take<const N: usize>(buf: &[u8], at: usize, err: FrameError) -> FrameResult<[u8; N]> {
    buf.get(at..at + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn test_decode_rfc_unmasked_hello() {
        let bytes = [0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f];
        let (frame, consumed) = decode(&bytes).unwrap();

        assert_eq!(consumed, 7);
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(!frame.is_masked());
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_decode_rfc_masked_hello() {
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let (frame, consumed) = decode(&bytes).unwrap();

        assert_eq!(consumed, 11);
        assert_eq!(frame.mask_key, Some(KEY));
        assert_eq!(frame.payload, b"Hello");
        assert_eq!(frame.payload_len(), 5);
    }

    #[test]
    fn test_encode_small_frame() {
        let bytes = encode(&Frame::text("Hello"));
        assert_eq!(bytes, vec![0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_masked_matches_rfc() {
        let bytes = encode_masked(&Frame::text("Hello"), KEY);
        assert_eq!(
            bytes,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_round_trip() {
        let frames = vec![
            Frame::text("round-trip"),
            Frame::binary(vec![0u8, 1, 2, 255]),
            Frame::new(OpCode::Continuation, b"tail".to_vec()),
            Frame::text("head").with_fin(false),
            Frame::ping(Vec::new()),
            Frame::pong(b"beat".to_vec()),
            Frame::close(1000, "done"),
            Frame {
                reserved: 0b101,
                ..Frame::binary(vec![7u8; 300])
            },
        ];

        for frame in frames {
            let bytes = encode(&frame);
            let (decoded, consumed) = decode(&bytes).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_length_boundaries() {
        // (payload length, header length, 7-bit indicator)
        let table = [
            (0usize, 2usize, 0u8),
            (125, 2, 125),
            (126, 4, 126),
            (65535, 4, 126),
            (65536, 10, 127),
        ];

        for (len, header_len, indicator) in table {
            let frame = Frame::binary(vec![0xAB; len]);
            let bytes = encode(&frame);

            assert_eq!(bytes.len(), header_len + len, "len {}", len);
            assert_eq!(bytes[1] & 0x7F, indicator, "len {}", len);
            assert_eq!(bytes[1] & 0x80, 0, "server frames are never masked");

            let (decoded, _) = decode(&bytes).unwrap();
            assert_eq!(decoded.payload_len(), len as u64);
        }
    }

    #[test]
    fn test_masking_involution() {
        for len in [0usize, 1, 3, 4, 5, 127, 1000] {
            let original: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let mut data = original.clone();
            apply_mask(&mut data, KEY);
            apply_mask(&mut data, KEY);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn test_truncation_at_every_stage() {
        let bytes = encode_masked(&Frame::binary(vec![9u8; 200]), KEY);

        assert_eq!(decode(&[]), Err(FrameError::TruncatedHeader));
        assert_eq!(decode(&bytes[..1]), Err(FrameError::TruncatedHeader));
        assert_eq!(decode(&bytes[..3]), Err(FrameError::TruncatedLength));
        assert_eq!(decode(&bytes[..6]), Err(FrameError::TruncatedMask));
        assert_eq!(
            decode(&bytes[..50]),
            Err(FrameError::TruncatedFrame {
                needed: 200,
                available: 42
            })
        );

        // Any strict prefix fails with a retryable error
        for cut in 0..bytes.len() {
            let err = decode(&bytes[..cut]).unwrap_err();
            assert!(err.is_truncated(), "prefix {} gave {:?}", cut, err);
        }

        let (frame, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.payload, vec![9u8; 200]);
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut bytes = encode(&Frame::text("one"));
        let first_len = bytes.len();
        bytes.extend(encode(&Frame::text("two")));

        let (first, consumed) = decode(&bytes).unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(consumed, first_len);

        let (second, _) = decode(&bytes[consumed..]).unwrap();
        assert_eq!(second.payload, b"two");
    }

    #[test]
    fn test_non_minimal_length_tolerated() {
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&5u64.to_be_bytes());
        bytes.extend_from_slice(b"abcde");

        let (frame, consumed) = decode(&bytes).unwrap();
        assert_eq!(frame.payload, b"abcde");
        assert_eq!(consumed, 15);
    }

    #[test]
    fn test_invalid_opcode() {
        for op in [0x3u8, 0x7, 0xB, 0xF] {
            assert_eq!(decode(&[0x80 | op, 0x00]), Err(FrameError::InvalidOpcode(op)));
        }
    }

    #[test]
    fn test_payload_limits() {
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(FrameError::PayloadTooLarge { .. })
        ));

        let bytes = encode(&Frame::binary(vec![0u8; 100]));
        assert_eq!(
            decode_limited(&bytes, 64),
            Err(FrameError::PayloadTooLarge { len: 100, max: 64 })
        );
        assert!(decode_limited(&bytes, 100).is_ok());
    }

    #[test]
    fn test_reserved_bits_decoded_not_rejected() {
        let (frame, _) = decode(&[0xC1, 0x00]).unwrap();
        assert_eq!(frame.reserved, 0b100);
        assert_eq!(
            frame.validate_inbound(true),
            Err(FrameError::ReservedBits(0b100))
        );
    }

    #[test]
    fn test_validate_inbound() {
        let ok = Frame::text("hi").with_mask(KEY);
        assert!(ok.validate_inbound(true).is_ok());

        assert_eq!(
            Frame::text("hi").validate_inbound(true),
            Err(FrameError::UnmaskedFrame)
        );

        let reserved = Frame {
            reserved: 0b010,
            ..ok.clone()
        };
        assert!(reserved.validate_inbound(false).is_ok());
        assert_eq!(
            reserved.validate_inbound(true),
            Err(FrameError::ReservedBits(0b010))
        );

        assert_eq!(
            Frame::ping(Vec::new())
                .with_fin(false)
                .with_mask(KEY)
                .validate_inbound(true),
            Err(FrameError::FragmentedControl)
        );
        assert_eq!(
            Frame::ping(vec![0u8; 126])
                .with_mask(KEY)
                .validate_inbound(true),
            Err(FrameError::ControlFrameTooLong(126))
        );
    }

    #[test]
    fn test_opcode_classes() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(!OpCode::Continuation.is_control());
    }
}
