//! # Local Transport Command Framing
//!
//! Local endpoints (UDS or local TCP) don't speak raw SOME/IP on the wire —
//! every command is wrapped with fixed start/end tags plus a small header so
//! the local routing daemon can multiplex control commands (client
//! assignment, ping/pong) alongside forwarded SOME/IP payloads on the same
//! stream. Grounded on `local_uds_server_endpoint_impl.cpp`/
//! `local_tcp_client_endpoint_impl.cpp`'s frame layout, reimplemented here as
//! a standalone encode/decode module rather than embedded in the receive
//! loop directly, so `endpoint::client`/`endpoint::server` can share one
//! framer for both local variants.

pub mod local_tcp;
pub mod uds;

use crate::error::EndpointError;

/// Marks the start of a local command frame.
pub const START_TAG: [u8; 4] = [0x67, 0x37, 0x6D, 0x07];
/// Marks the end of a local command frame.
pub const END_TAG: [u8; 4] = [0x07, 0x6D, 0x37, 0x67];

/// Bytes preceding the body: 4-byte start tag, 1-byte opcode, 2-byte client
/// (big-endian, matching the SOME/IP header's own field order), 4-byte
/// little-endian body size.
pub const HEADER_LENGTH: usize = START_TAG.len() + 1 + 2 + 4;
/// Trailing end tag length.
pub const FOOTER_LENGTH: usize = END_TAG.len();

/// Command opcodes exchanged on the control channel. `Message` carries a
/// forwarded SOME/IP payload; the others drive the client-id handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Message,
    AssignClientId,
    AssignClientAck,
    Ping,
    Pong,
}

impl Opcode {
    fn to_byte(self) -> u8 {
        match self {
            Opcode::Message => 0x00,
            Opcode::AssignClientId => 0x01,
            Opcode::AssignClientAck => 0x02,
            Opcode::Ping => 0x03,
            Opcode::Pong => 0x04,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Opcode::Message),
            0x01 => Some(Opcode::AssignClientId),
            0x02 => Some(Opcode::AssignClientAck),
            0x03 => Some(Opcode::Ping),
            0x04 => Some(Opcode::Pong),
            _ => None,
        }
    }
}

/// One decoded local command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub client: u16,
    pub body: Vec<u8>,
}

/// Encodes a frame as `start-tag || opcode || client || size || body ||
/// end-tag`.
pub fn encode(opcode: Opcode, client: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LENGTH + body.len() + FOOTER_LENGTH);
    out.extend_from_slice(&START_TAG);
    out.push(opcode.to_byte());
    out.extend_from_slice(&client.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&END_TAG);
    out
}

/// Result of attempting to decode one frame from the front of `buf`.
pub enum DecodeOutcome {
    /// A complete, validated frame was found; `consumed` is the number of
    /// bytes to drop from the front of the buffer.
    Frame { frame: Frame, consumed: usize },
    /// Not enough bytes yet. `missing_capacity` is how many additional
    /// bytes the caller should grow its buffer by before reading again, so
    /// the next read enlarges the buffer exactly rather than guessing.
    Incomplete { missing_capacity: usize },
}

/// Locates the start tag, reads the command header, and validates the end
/// tag at the position the declared size implies. Missing either tag, or a
/// declared size past `max_body_len`, is a framing error that should cause
/// the caller to drop the connection and reset its buffers.
pub fn decode(buf: &[u8], max_body_len: usize) -> Result<DecodeOutcome, EndpointError> {
    let start = match find_subslice(buf, &START_TAG) {
        Some(pos) => pos,
        None => {
            // No start tag at all yet; keep the last (START_TAG.len() - 1)
            // bytes in case a partial tag is split across reads, so ask for
            // the rest of the header beyond that.
            return Ok(DecodeOutcome::Incomplete {
                missing_capacity: HEADER_LENGTH,
            });
        }
    };

    if buf.len() < start + HEADER_LENGTH {
        return Ok(DecodeOutcome::Incomplete {
            missing_capacity: start + HEADER_LENGTH - buf.len(),
        });
    }

    let header = &buf[start..start + HEADER_LENGTH];
    let opcode_byte = header[START_TAG.len()];
    let opcode = Opcode::from_byte(opcode_byte).ok_or_else(|| {
        EndpointError::LocalFraming(format!("unknown local command opcode {opcode_byte:#04x}"))
    })?;
    let client = u16::from_be_bytes([header[5], header[6]]);
    let size = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

    if size > max_body_len {
        return Err(EndpointError::LocalFraming(format!(
            "declared local command size {size} exceeds max {max_body_len}"
        )));
    }

    let frame_end = start + HEADER_LENGTH + size + FOOTER_LENGTH;
    if buf.len() < frame_end {
        return Ok(DecodeOutcome::Incomplete {
            missing_capacity: frame_end - buf.len(),
        });
    }

    let body_start = start + HEADER_LENGTH;
    let body_end = body_start + size;
    let footer = &buf[body_end..frame_end];
    if footer != END_TAG {
        return Err(EndpointError::LocalFraming(
            "missing end tag at declared command size boundary".into(),
        ));
    }

    Ok(DecodeOutcome::Frame {
        frame: Frame {
            opcode,
            client,
            body: buf[body_start..body_end].to_vec(),
        },
        consumed: frame_end,
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let body = b"hello local routing";
        let framed = encode(Opcode::Message, 0x1234, body);

        match decode(&framed, 1024).unwrap() {
            DecodeOutcome::Frame { frame, consumed } => {
                assert_eq!(frame.opcode, Opcode::Message);
                assert_eq!(frame.client, 0x1234);
                assert_eq!(frame.body, body);
                assert_eq!(consumed, framed.len());
            }
            DecodeOutcome::Incomplete { .. } => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn truncated_body_reports_exact_missing_capacity() {
        let framed = encode(Opcode::AssignClientId, 7, b"0123456789");
        let truncated = &framed[..framed.len() - 3];

        match decode(truncated, 1024).unwrap() {
            DecodeOutcome::Incomplete { missing_capacity } => assert_eq!(missing_capacity, 3),
            DecodeOutcome::Frame { .. } => panic!("expected incomplete"),
        }
    }

    #[test]
    fn missing_end_tag_is_a_framing_error() {
        let mut framed = encode(Opcode::Ping, 0, b"x");
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;

        let err = decode(&framed, 1024).unwrap_err();
        assert!(matches!(err, EndpointError::LocalFraming(_)));
    }

    #[test]
    fn oversize_declared_body_is_a_framing_error() {
        let framed = encode(Opcode::Message, 0, b"0123456789");
        let err = decode(&framed, 4).unwrap_err();
        assert!(matches!(err, EndpointError::LocalFraming(_)));
    }

    #[test]
    fn leading_garbage_before_start_tag_is_skipped() {
        let mut buf = vec![0xAA, 0xBB, 0xCC];
        buf.extend_from_slice(&encode(Opcode::Pong, 2, b"ok"));

        match decode(&buf, 1024).unwrap() {
            DecodeOutcome::Frame { frame, consumed } => {
                assert_eq!(frame.opcode, Opcode::Pong);
                assert_eq!(consumed, buf.len());
            }
            DecodeOutcome::Incomplete { .. } => panic!("expected a complete frame"),
        }
    }
}
