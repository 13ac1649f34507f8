// Copyright 2026 Bluebridge Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! OBEX packet and header codec.
//!
//! Pure encode/decode, no I/O. All multi-byte integers are big-endian on
//! the wire. A packet is `[opcode, len_hi, len_lo, headers...]` where the
//! length covers the whole packet including the 3-byte envelope.

use anyhow::{bail, Result};

/// Size of the `[opcode, length]` packet envelope.
pub const PACKET_ENVELOPE_LEN: usize = 3;

/// OBEX protocol version 1.0.
pub const OBEX_VERSION: u8 = 0x10;

/// Final-packet bit of an opcode.
pub const FINAL_BIT: u8 = 0x80;

/// OBEX request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Connect = 0x80,
    Disconnect = 0x81,
    Put = 0x02,
    PutFinal = 0x82,
    Get = 0x03,
    GetFinal = 0x83,
    SetPath = 0x85,
    Abort = 0xFF,
}

impl Opcode {
    /// Decode a request opcode byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(Self::Connect),
            0x81 => Some(Self::Disconnect),
            0x02 => Some(Self::Put),
            0x82 => Some(Self::PutFinal),
            0x03 => Some(Self::Get),
            0x83 => Some(Self::GetFinal),
            0x85 => Some(Self::SetPath),
            0xFF => Some(Self::Abort),
            _ => None,
        }
    }
}

/// OBEX response code, grouped like HTTP status classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u8);

#[allow(dead_code)]
impl ResponseCode {
    pub const CONTINUE: ResponseCode = ResponseCode(0x90);

    pub const SUCCESS: ResponseCode = ResponseCode(0xA0);
    pub const CREATED: ResponseCode = ResponseCode(0xA1);
    pub const ACCEPTED: ResponseCode = ResponseCode(0xA2);
    pub const NON_AUTHORITATIVE_INFO: ResponseCode = ResponseCode(0xA3);
    pub const NO_CONTENT: ResponseCode = ResponseCode(0xA4);
    pub const RESET_CONTENT: ResponseCode = ResponseCode(0xA5);
    pub const PARTIAL_CONTENT: ResponseCode = ResponseCode(0xA6);

    pub const MULTIPLE_CHOICES: ResponseCode = ResponseCode(0xB0);
    pub const MOVED_PERMANENTLY: ResponseCode = ResponseCode(0xB1);
    pub const MOVED_TEMPORARILY: ResponseCode = ResponseCode(0xB2);
    pub const SEE_OTHER: ResponseCode = ResponseCode(0xB3);
    pub const NOT_MODIFIED: ResponseCode = ResponseCode(0xB4);
    pub const USE_PROXY: ResponseCode = ResponseCode(0xB5);

    pub const BAD_REQUEST: ResponseCode = ResponseCode(0xC0);
    pub const UNAUTHORIZED: ResponseCode = ResponseCode(0xC1);
    pub const PAYMENT_REQUIRED: ResponseCode = ResponseCode(0xC2);
    pub const FORBIDDEN: ResponseCode = ResponseCode(0xC3);
    pub const NOT_FOUND: ResponseCode = ResponseCode(0xC4);
    pub const METHOD_NOT_ALLOWED: ResponseCode = ResponseCode(0xC5);
    pub const NOT_ACCEPTABLE: ResponseCode = ResponseCode(0xC6);
    pub const PROXY_AUTHENTICATION_REQUIRED: ResponseCode = ResponseCode(0xC7);
    pub const REQUEST_TIMEOUT: ResponseCode = ResponseCode(0xC8);
    pub const CONFLICT: ResponseCode = ResponseCode(0xC9);
    pub const GONE: ResponseCode = ResponseCode(0xCA);
    pub const LENGTH_REQUIRED: ResponseCode = ResponseCode(0xCB);
    pub const PRECONDITION_FAILED: ResponseCode = ResponseCode(0xCC);
    pub const REQUESTED_ENTITY_TOO_LARGE: ResponseCode = ResponseCode(0xCD);
    pub const REQUEST_URL_TOO_LARGE: ResponseCode = ResponseCode(0xCE);
    pub const UNSUPPORTED_MEDIA_TYPE: ResponseCode = ResponseCode(0xCF);

    pub const INTERNAL_SERVER_ERROR: ResponseCode = ResponseCode(0xD0);
    pub const NOT_IMPLEMENTED: ResponseCode = ResponseCode(0xD1);
    pub const BAD_GATEWAY: ResponseCode = ResponseCode(0xD2);
    pub const SERVICE_UNAVAILABLE: ResponseCode = ResponseCode(0xD3);
    pub const GATEWAY_TIMEOUT: ResponseCode = ResponseCode(0xD4);
    pub const HTTP_VERSION_NOT_SUPPORTED: ResponseCode = ResponseCode(0xD5);

    pub const DATABASE_FULL: ResponseCode = ResponseCode(0xE0);
    pub const DATABASE_LOCKED: ResponseCode = ResponseCode(0xE1);

    /// More packets follow.
    pub fn is_continue(self) -> bool {
        self.0 == Self::CONTINUE.0
    }

    /// Any code in the 0xA0 success family.
    pub fn is_success(self) -> bool {
        self.0 & 0xF0 == 0xA0
    }
}

/// Header identifiers. The top two bits of the id select the wire encoding.
pub mod header_id {
    /// Object name, UTF-16BE with a NUL terminator, 2-byte length prefix.
    pub const NAME: u8 = 0x01;
    /// MIME type of the object, byte sequence.
    pub const TYPE: u8 = 0x42;
    /// A chunk of the object body, byte sequence.
    pub const BODY: u8 = 0x48;
    /// Identifies the service, byte sequence.
    pub const WHO: u8 = 0x4A;
    /// Total object length, 4-byte value.
    pub const LENGTH: u8 = 0xC3;
    /// Connection identifier, 4-byte value.
    pub const CONNECTION_ID: u8 = 0xCB;
}

/// A decoded OBEX header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Name(String),
    Type(Vec<u8>),
    Body(Vec<u8>),
    Who(Vec<u8>),
    Length(u32),
    ConnectionId(u32),
    /// A header we do not interpret; kept so callers can see what was
    /// skipped. `data` is empty for 1-byte and 4-byte encodings.
    Other { id: u8, data: Vec<u8> },
}

/// Appends a length-prefixed header (`id`, 2-byte BE length, payload).
/// Returns the number of bytes written (`payload.len() + 3`).
fn push_prefixed(buf: &mut Vec<u8>, id: u8, payload: &[u8]) -> Result<usize> {
    let header_len = payload.len() + 3;
    if header_len > u16::MAX as usize {
        bail!("OBEX header payload of {} bytes does not fit", payload.len());
    }
    buf.push(id);
    buf.extend_from_slice(&(header_len as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(header_len)
}

/// Appends a Name header carrying raw, already-encoded bytes.
pub fn push_name_raw(buf: &mut Vec<u8>, name: &[u8]) -> Result<usize> {
    push_prefixed(buf, header_id::NAME, name)
}

/// Appends a Name header. The name is encoded as UTF-16BE with a NUL
/// terminator, as required by IrOBEX 1.2.
pub fn push_name(buf: &mut Vec<u8>, name: &str) -> Result<usize> {
    push_name_raw(buf, &encode_name(name))
}

/// Appends a Body header carrying a chunk of the object.
pub fn push_body(buf: &mut Vec<u8>, data: &[u8]) -> Result<usize> {
    push_prefixed(buf, header_id::BODY, data)
}

/// Appends a Type header.
pub fn push_type(buf: &mut Vec<u8>, mime: &[u8]) -> Result<usize> {
    push_prefixed(buf, header_id::TYPE, mime)
}

/// Appends a Length header. Always writes 5 bytes.
pub fn push_length(buf: &mut Vec<u8>, object_length: u32) -> usize {
    buf.push(header_id::LENGTH);
    buf.extend_from_slice(&object_length.to_be_bytes());
    5
}

/// Appends a ConnectionId header. Always writes 5 bytes.
pub fn push_connection_id(buf: &mut Vec<u8>, connection_id: u32) -> usize {
    buf.push(header_id::CONNECTION_ID);
    buf.extend_from_slice(&connection_id.to_be_bytes());
    5
}

/// Appends any decoded header.
pub fn push_header(buf: &mut Vec<u8>, header: &Header) -> Result<usize> {
    match header {
        Header::Name(name) => push_name(buf, name),
        Header::Type(mime) => push_type(buf, mime),
        Header::Body(data) => push_body(buf, data),
        Header::Who(who) => push_prefixed(buf, header_id::WHO, who),
        Header::Length(len) => Ok(push_length(buf, *len)),
        Header::ConnectionId(id) => Ok(push_connection_id(buf, *id)),
        Header::Other { id, data } => push_prefixed(buf, *id, data),
    }
}

/// Encodes an object name as UTF-16BE with a NUL terminator.
pub fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() * 2 + 2);
    for unit in name.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// Wire size of a Name header for the given name, including the 3-byte
/// header prefix.
pub fn name_header_len(name: &str) -> usize {
    name.encode_utf16().count() * 2 + 2 + 3
}

fn decode_name(raw: &[u8]) -> String {
    let mut units: Vec<u16> =
        raw.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
    while units.last() == Some(&0) {
        units.pop();
    }
    String::from_utf16_lossy(&units)
}

/// Starts a new packet: the 3-byte envelope with a zero length placeholder.
pub fn start_packet(code: u8) -> Vec<u8> {
    vec![code, 0, 0]
}

/// Writes the final packet length into the envelope.
pub fn finish_packet(packet: &mut [u8]) -> Result<()> {
    if packet.len() < PACKET_ENVELOPE_LEN || packet.len() > u16::MAX as usize {
        bail!("OBEX packet length {} out of range", packet.len());
    }
    let len = (packet.len() as u16).to_be_bytes();
    packet[1] = len[0];
    packet[2] = len[1];
    Ok(())
}

/// The version/flags/max-packet-length block carried by Connect requests
/// and responses, directly after the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo {
    pub version: u8,
    pub flags: u8,
    pub max_packet_len: u16,
}

impl ConnectInfo {
    pub const WIRE_LEN: usize = 4;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.version);
        buf.push(self.flags);
        buf.extend_from_slice(&self.max_packet_len.to_be_bytes());
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::WIRE_LEN {
            bail!("Connect payload of {} bytes is too short", payload.len());
        }
        Ok(Self {
            version: payload[0],
            flags: payload[1],
            max_packet_len: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }
}

/// The decoded headers of one packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    pub headers: Vec<Header>,
}

impl HeaderSet {
    pub fn name(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            Header::Name(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn mime_type(&self) -> Option<&[u8]> {
        self.headers.iter().find_map(|h| match h {
            Header::Type(mime) => Some(mime.as_slice()),
            _ => None,
        })
    }

    pub fn length(&self) -> Option<u32> {
        self.headers.iter().find_map(|h| match h {
            Header::Length(len) => Some(*len),
            _ => None,
        })
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.headers.iter().find_map(|h| match h {
            Header::ConnectionId(id) => Some(*id),
            _ => None,
        })
    }

    pub fn bodies(&self) -> impl Iterator<Item = &[u8]> {
        self.headers.iter().filter_map(|h| match h {
            Header::Body(data) => Some(data.as_slice()),
            _ => None,
        })
    }
}

/// Parses the header region of a packet.
///
/// Walks the buffer one header at a time, selecting the encoding from the
/// top two bits of the id. Unknown ids are skipped by their encoded length
/// and surfaced as [`Header::Other`]. Truncated headers are an error; this
/// region comes straight off the radio and is treated as hostile.
pub fn parse_headers(mut buf: &[u8]) -> Result<HeaderSet> {
    let mut set = HeaderSet::default();

    while !buf.is_empty() {
        let id = buf[0];
        buf = &buf[1..];

        // IrOBEX 1.2 - 2.1 OBEX Headers: 0 = unicode text, 1 = byte
        // sequence (both 2-byte length prefixed), 2 = 1-byte, 3 = 4-byte.
        let header = match id >> 6 {
            0x00 | 0x01 => {
                if buf.len() < 2 {
                    bail!("truncated OBEX header 0x{id:02x}: missing length");
                }
                let total = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                if total < 3 {
                    bail!("OBEX header 0x{id:02x} declares impossible length {total}");
                }
                let payload_len = total - 3;
                if buf.len() < 2 + payload_len {
                    bail!(
                        "truncated OBEX header 0x{:02x}: want {} bytes, have {}",
                        id,
                        payload_len,
                        buf.len() - 2
                    );
                }
                let payload = &buf[2..2 + payload_len];
                buf = &buf[2 + payload_len..];
                match id {
                    header_id::NAME => Header::Name(decode_name(payload)),
                    header_id::TYPE => Header::Type(payload.to_vec()),
                    header_id::BODY => Header::Body(payload.to_vec()),
                    header_id::WHO => Header::Who(payload.to_vec()),
                    _ => Header::Other { id, data: payload.to_vec() },
                }
            }
            0x02 => {
                if buf.is_empty() {
                    bail!("truncated OBEX header 0x{id:02x}: missing value byte");
                }
                let data = vec![buf[0]];
                buf = &buf[1..];
                Header::Other { id, data }
            }
            _ => {
                if buf.len() < 4 {
                    bail!("truncated OBEX header 0x{id:02x}: missing 4-byte value");
                }
                let value = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                buf = &buf[4..];
                match id {
                    header_id::LENGTH => Header::Length(value),
                    header_id::CONNECTION_ID => Header::ConnectionId(value),
                    _ => Header::Other { id, data: value.to_be_bytes().to_vec() },
                }
            }
        };

        set.headers.push(header);
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_name_round_trip() {
        let raw = b"test.txt\x00";
        let mut buf = Vec::new();
        let written = push_name_raw(&mut buf, raw).unwrap();

        assert_eq!(written, raw.len() + 3);
        assert_eq!(buf.len(), written);
        assert_eq!(buf[0], header_id::NAME);
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]) as usize, written);
        assert_eq!(&buf[3..], raw);
    }

    #[test]
    fn test_body_round_trip() {
        let data = vec![0x42u8; 300];
        let mut buf = Vec::new();
        let written = push_body(&mut buf, &data).unwrap();
        assert_eq!(written, data.len() + 3);

        let set = parse_headers(&buf).unwrap();
        assert_eq!(set.bodies().next().unwrap(), data.as_slice());
    }

    #[test]
    fn test_name_utf16_round_trip() {
        let mut buf = Vec::new();
        push_name(&mut buf, "bericht.txt").unwrap();
        let set = parse_headers(&buf).unwrap();
        assert_eq!(set.name(), Some("bericht.txt"));

        // Non-ASCII names survive the UTF-16 trip too.
        let mut buf = Vec::new();
        push_name(&mut buf, "übergabe.vcf").unwrap();
        let set = parse_headers(&buf).unwrap();
        assert_eq!(set.name(), Some("übergabe.vcf"));
    }

    #[test]
    fn test_fixed_width_headers() {
        let mut buf = Vec::new();
        assert_eq!(push_connection_id(&mut buf, 7), 5);
        assert_eq!(push_length(&mut buf, 0x0102_0304), 5);

        let set = parse_headers(&buf).unwrap();
        assert_eq!(set.connection_id(), Some(7));
        assert_eq!(set.length(), Some(0x0102_0304));
    }

    #[test]
    fn test_packet_framing_invariant() {
        let mut packet = start_packet(Opcode::PutFinal as u8);
        push_connection_id(&mut packet, 1);
        push_name(&mut packet, "test.txt").unwrap();
        push_length(&mut packet, 11);
        push_body(&mut packet, b"Eric Test.\n").unwrap();
        finish_packet(&mut packet).unwrap();

        assert_eq!(packet[0], 0x82);
        let declared = u16::from_be_bytes([packet[1], packet[2]]) as usize;
        assert_eq!(declared, packet.len());
        // "test.txt" as UTF-16BE plus NUL is 18 bytes, so the Name header
        // declares 21 = 0x15.
        assert_eq!(&packet[8..11], &[header_id::NAME, 0x00, 0x15]);
    }

    #[test]
    fn test_unknown_header_skipped() {
        let mut buf = Vec::new();
        // Who (byte sequence), an unknown 4-byte header, then Body.
        push_header(&mut buf, &Header::Who(vec![0xF9, 0xEC])).unwrap();
        buf.push(0xCF);
        buf.extend_from_slice(&[0, 0, 0, 9]);
        push_body(&mut buf, b"payload").unwrap();

        let set = parse_headers(&buf).unwrap();
        assert_eq!(set.headers.len(), 3);
        assert_eq!(set.bodies().next().unwrap(), b"payload");
        assert!(matches!(set.headers[1], Header::Other { id: 0xCF, .. }));
    }

    #[test]
    fn test_truncated_header_rejected() {
        // Body header declaring 100 bytes with only 4 present.
        let buf = [header_id::BODY, 0x00, 0x64, 1, 2, 3, 4];
        assert!(parse_headers(&buf).is_err());

        // Length header cut short.
        let buf = [header_id::LENGTH, 0x00, 0x00];
        assert!(parse_headers(&buf).is_err());

        // A length-prefixed header may never declare less than its own
        // 3-byte prefix.
        let buf = [header_id::BODY, 0x00, 0x02];
        assert!(parse_headers(&buf).is_err());
    }

    #[test]
    fn test_connect_info_round_trip() {
        let info = ConnectInfo { version: OBEX_VERSION, flags: 0, max_packet_len: 0x2000 };
        let mut buf = Vec::new();
        info.encode(&mut buf);
        assert_eq!(buf, [0x10, 0x00, 0x20, 0x00]);
        assert_eq!(ConnectInfo::decode(&buf).unwrap(), info);
        assert!(ConnectInfo::decode(&buf[..3]).is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut buf = Vec::new();
        let too_big = vec![0u8; u16::MAX as usize];
        assert!(push_body(&mut buf, &too_big).is_err());
    }

    #[test]
    fn test_response_code_classes() {
        assert!(ResponseCode::CONTINUE.is_continue());
        assert!(ResponseCode::SUCCESS.is_success());
        assert!(ResponseCode::PARTIAL_CONTENT.is_success());
        assert!(!ResponseCode::BAD_REQUEST.is_success());
        assert!(!ResponseCode::DATABASE_FULL.is_success());
    }
}
