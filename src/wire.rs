//! # SOME/IP Message Framing Utilities
//!
//! Pure, allocation-free helpers over a raw SOME/IP header: byte-order
//! extraction, message-size computation, and the allow-lists that decide
//! whether a message-type or return-code byte is one this transport core
//! understands.
//!
//! All multi-byte header fields are big-endian on the wire. Nothing here
//! interprets payload bytes; that is the routing layer's job.
//!
//! ## Header layout (16 bytes)
//!
//! | Offset | Field | Width |
//! |---|---|---|
//! | 0  | service            | 2 |
//! | 2  | method             | 2 |
//! | 4  | length              | 4 |
//! | 8  | client              | 2 |
//! | 10 | session             | 2 |
//! | 12 | protocol-version    | 1 |
//! | 13 | interface-version   | 1 |
//! | 14 | message-type        | 1 |
//! | 15 | return-code         | 1 |

use std::convert::TryInto;

/// Size of the fixed SOME/IP header, in bytes.
pub const HEADER_LENGTH: usize = 16;

/// Offset of the length field; `message_size` counts all bytes after it.
const LENGTH_FIELD_OFFSET: usize = 4;
const LENGTH_FIELD_WIDTH: usize = 4;

/// Bit set in the message-type byte to mark a SOME/IP-TP segment.
pub const TP_FLAG: u8 = 0x20;

/// The two magic-cookie signatures. They differ only in the
/// message-type byte (client-originated vs. service-originated), matching
/// the distinction vsomeip's `utility::is_magic_cookie` makes on sender role.
pub const CLIENT_COOKIE: [u8; HEADER_LENGTH] = [
    0xff, 0xff, 0x80, 0x00, 0x00, 0x00, 0x00, 0x08, 0xde, 0xad, 0xbe, 0xef, 0x01, 0x01, 0x01, 0x00,
];
pub const SERVICE_COOKIE: [u8; HEADER_LENGTH] = [
    0xff, 0xff, 0x80, 0x00, 0x00, 0x00, 0x00, 0x08, 0xde, 0xad, 0xbe, 0xef, 0x01, 0x01, 0x02, 0x00,
];

/// Message-type byte values understood by this core (request/response family
/// plus their TP-flagged variants and notifications/errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Request2 = 0x03,
    RequestNoReturnTp = 0x21,
    NotificationTp = 0x22,
    Response = 0x80,
    Error = 0x81,
    ResponseTp = 0xa0,
    ErrorTp = 0xa1,
}

const VALID_MESSAGE_TYPES: &[u8] = &[
    MessageType::Request as u8,
    MessageType::RequestNoReturn as u8,
    MessageType::Notification as u8,
    MessageType::Request2 as u8,
    MessageType::RequestNoReturnTp as u8,
    MessageType::NotificationTp as u8,
    MessageType::Response as u8,
    MessageType::Error as u8,
    MessageType::ResponseTp as u8,
    MessageType::ErrorTp as u8,
];

const VALID_RETURN_CODES: &[u8] = &[
    0x00, // E_OK
    0x01, // E_NOT_OK
    0x02, // E_UNKNOWN_SERVICE
    0x03, // E_UNKNOWN_METHOD
    0x04, // E_NOT_READY
    0x05, // E_NOT_REACHABLE
    0x06, // E_TIMEOUT
    0x07, // E_WRONG_PROTOCOL_VERSION
    0x08, // E_WRONG_INTERFACE_VERSION
    0x09, // E_MALFORMED_MESSAGE
    0x0a, // E_WRONG_MESSAGE_TYPE
];

/// Message-types that carry a reply to a prior request (response
/// routing). Used to decide whether to consult the clients map.
pub fn is_reply_message_type(message_type: u8) -> bool {
    matches!(
        message_type,
        x if x == MessageType::Response as u8
            || x == MessageType::Error as u8
            || x == MessageType::ResponseTp as u8
            || x == MessageType::ErrorTp as u8
    )
}

/// Returns the total message size (header + payload) declared by the length
/// field, or `0` if fewer than 8 bytes are available (not enough data yet).
pub fn message_size(buf: &[u8]) -> u64 {
    if buf.len() < LENGTH_FIELD_OFFSET + LENGTH_FIELD_WIDTH {
        return 0;
    }
    let length_field = u32::from_be_bytes(
        buf[LENGTH_FIELD_OFFSET..LENGTH_FIELD_OFFSET + LENGTH_FIELD_WIDTH]
            .try_into()
            .expect("slice width matches u32"),
    );
    (LENGTH_FIELD_OFFSET + LENGTH_FIELD_WIDTH) as u64 + length_field as u64
}

/// Returns the payload size (message size minus the 8 header bytes that
/// precede and include the length field), or `0` if not enough header is
/// present yet.
pub fn payload_size(buf: &[u8]) -> u32 {
    let size = message_size(buf);
    if size < 8 {
        return 0;
    }
    (size - 8) as u32
}

pub fn service_id(buf: &[u8]) -> Option<u16> {
    read_u16(buf, 0)
}

pub fn method_id(buf: &[u8]) -> Option<u16> {
    read_u16(buf, 2)
}

pub fn client_id(buf: &[u8]) -> Option<u16> {
    read_u16(buf, 8)
}

pub fn session_id(buf: &[u8]) -> Option<u16> {
    read_u16(buf, 10)
}

pub fn protocol_version(buf: &[u8]) -> Option<u8> {
    buf.get(12).copied()
}

pub fn message_type_byte(buf: &[u8]) -> Option<u8> {
    buf.get(14).copied()
}

pub fn return_code_byte(buf: &[u8]) -> Option<u8> {
    buf.get(15).copied()
}

pub fn is_tp_flagged(message_type: u8) -> bool {
    message_type & TP_FLAG != 0
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let slice = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes(slice.try_into().expect("width 2")))
}

/// Allow-list check for the message-type byte.
pub fn is_valid_message_type(byte: u8) -> bool {
    VALID_MESSAGE_TYPES.contains(&byte)
}

/// Allow-list check for the return-code byte.
pub fn is_valid_return_code(byte: u8) -> bool {
    VALID_RETURN_CODES.contains(&byte)
}

/// Recognizes either magic-cookie signature at `buf[off..off + 16]`.
/// Returns `false` if fewer than 16 bytes remain from `off`.
pub fn is_magic_cookie(buf: &[u8], off: usize) -> bool {
    match buf.get(off..off + HEADER_LENGTH) {
        Some(window) => window == CLIENT_COOKIE || window == SERVICE_COOKIE,
        None => false,
    }
}

/// Scans `buf` starting at `from` for the next magic-cookie occurrence,
/// returning its offset. Used by the stream resync path.
pub fn find_magic_cookie(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < HEADER_LENGTH {
        return None;
    }
    (from..=buf.len() - HEADER_LENGTH).find(|&at| is_magic_cookie(buf, at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(length: u32, message_type: u8, return_code: u8) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LENGTH];
        buf[0..2].copy_from_slice(&0x1234u16.to_be_bytes());
        buf[2..4].copy_from_slice(&0x5678u16.to_be_bytes());
        buf[4..8].copy_from_slice(&length.to_be_bytes());
        buf[8..10].copy_from_slice(&0x0001u16.to_be_bytes());
        buf[10..12].copy_from_slice(&0x0002u16.to_be_bytes());
        buf[12] = 0x01;
        buf[13] = 0x00;
        buf[14] = message_type;
        buf[15] = return_code;
        buf
    }

    #[test]
    fn message_size_needs_eight_bytes() {
        assert_eq!(message_size(&[0u8; 3]), 0);
        assert_eq!(message_size(&[0u8; 7]), 0);
    }

    #[test]
    fn message_size_reads_length_field() {
        let buf = header(8, 0x00, 0x00); // payload-less request
        assert_eq!(message_size(&buf), 16);
        assert_eq!(payload_size(&buf), 8);
    }

    #[test]
    fn message_size_with_payload() {
        let mut buf = header(8 + 5, 0x00, 0x00);
        buf.extend_from_slice(&[1, 2, 3, 4, 5]);
        assert_eq!(message_size(&buf), 21);
        assert_eq!(payload_size(&buf), 13);
    }

    #[test]
    fn valid_message_types_allow_list() {
        assert!(is_valid_message_type(0x00));
        assert!(is_valid_message_type(0x80));
        assert!(is_valid_message_type(0xa1));
        assert!(!is_valid_message_type(0x42));
        assert!(!is_valid_message_type(0xff));
    }

    #[test]
    fn valid_return_codes_allow_list() {
        assert!(is_valid_return_code(0x00));
        assert!(is_valid_return_code(0x0a));
        assert!(!is_valid_return_code(0x0b));
    }

    #[test]
    fn recognizes_both_cookie_forms() {
        assert!(is_magic_cookie(&CLIENT_COOKIE, 0));
        assert!(is_magic_cookie(&SERVICE_COOKIE, 0));
        let mut prefixed = vec![0xaa, 0xbb];
        prefixed.extend_from_slice(&CLIENT_COOKIE);
        assert!(!is_magic_cookie(&prefixed, 0));
        assert!(is_magic_cookie(&prefixed, 2));
        assert_eq!(find_magic_cookie(&prefixed, 0), Some(2));
    }

    #[test]
    fn tp_flag_detection() {
        assert!(is_tp_flagged(MessageType::RequestNoReturnTp as u8));
        assert!(!is_tp_flagged(MessageType::Request as u8));
    }
}
