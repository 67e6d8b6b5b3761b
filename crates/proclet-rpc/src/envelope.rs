//! Request/reply correlation on top of the shared connection's frames.
//!
//! A request frame's `kind` byte is a [`proclet_wire::RequestKind`] and its
//! payload is `[u64 request_id][body]`. A reply frame uses the reserved
//! `REPLY_KIND` and a payload of `[u64 request_id][i8 wire_status][body]`,
//! so the client's reader thread can demux concurrent in-flight calls on
//! one connection without a response ever being mistaken for a request.

use proclet_common::error::WireStatus;

/// Frame kind reserved for replies; no `RequestKind` variant may use it.
pub const REPLY_KIND: u8 = 0xFF;

pub fn encode_request(request_id: u64, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(body);
    out
}

pub fn decode_request(payload: &[u8]) -> Option<(u64, &[u8])> {
    if payload.len() < 8 {
        return None;
    }
    let id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    Some((id, &payload[8..]))
}

pub fn encode_reply(request_id: u64, status: WireStatus, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + body.len());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.push(status as i8 as u8);
    out.extend_from_slice(body);
    out
}

pub fn decode_reply(payload: &[u8]) -> Option<(u64, WireStatus, &[u8])> {
    if payload.len() < 9 {
        return None;
    }
    let id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    let status = WireStatus::from_byte(payload[8] as i8)?;
    Some((id, status, &payload[9..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips() {
        let encoded = encode_request(42, b"hello");
        let (id, body) = decode_request(&encoded).unwrap();
        assert_eq!(id, 42);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn reply_roundtrips() {
        let encoded = encode_reply(7, WireStatus::Timeout, b"oops");
        let (id, status, body) = decode_reply(&encoded).unwrap();
        assert_eq!(id, 7);
        assert_eq!(status, WireStatus::Timeout);
        assert_eq!(body, b"oops");
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(decode_request(&[0u8; 4]).is_none());
        assert!(decode_reply(&[0u8; 8]).is_none());
    }
}
