//! Packet encoding and decoding for the supported MQTT subset.
//!
//! Every packet is framed by a two-byte fixed header:
//!
//! | byte | bits | meaning |
//! |------|------|---------|
//! | 0 | 7-4 | packet type |
//! | 0 | 3-0 | flags (ignored on decode) |
//! | 1 | 7-0 | remaining length, 0..=127 |
//!
//! The remaining length is never continued into a second byte. A length byte
//! with the continuation bit set is rejected with
//! [`Error::RemainingLengthOutOfRange`] instead of being truncated, so an
//! oversized packet can never desynchronise the framing of the next one.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Length of the fixed header.
pub const HEADER_LEN: usize = 2;

/// Largest body a packet can carry.
pub const MAX_REMAINING_LENGTH: usize = 127;

/// CONNACK return code for an accepted connection.
pub const CONNECT_ACCEPTED: u8 = 0x00;

/// Protocol level sent by [`create_connect`] (MQTT 3.1.1).
pub const PROTOCOL_LEVEL: u8 = 4;

/// Control packet types understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    Subscribe = 8,
    SubAck = 9,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// 4-bit packet type code.
    pub packet_type: u8,
    /// 4-bit flags.
    pub flags: u8,
    /// Body length in bytes.
    pub remaining_length: usize,
}

impl FixedHeader {
    /// Parse the fixed header at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Incomplete { needed: HEADER_LEN - buf.len() });
        }

        let length = buf[1];
        if length & 0x80 != 0 {
            return Err(Error::RemainingLengthOutOfRange(length));
        }

        Ok(FixedHeader {
            packet_type: buf[0] >> 4,
            flags: buf[0] & 0x0F,
            remaining_length: length as usize,
        })
    }

    /// Total frame length (header + body).
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.remaining_length
    }
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: u8,
}

/// PUBLISH packet (QoS 0, no packet identifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
}

/// SUBSCRIBE packet, first filter only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filter: String,
}

/// SUBACK packet, first return code only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_code: u8,
}

/// Decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// CONNECT with its body carried uninterpreted.
    Connect(Bytes),
    ConnAck(ConnAck),
    Publish(Publish),
    Subscribe(Subscribe),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect,
    /// Any other packet type; kept so the stream stays framed.
    Unsupported {
        packet_type: u8,
        flags: u8,
        body: Bytes,
    },
}

// ============================================================================
// Decoding
// ============================================================================

impl Packet {
    /// Parse one packet from the start of `buf`.
    ///
    /// Returns the packet and the number of bytes consumed, or
    /// [`Error::Incomplete`] when the buffer holds only part of a frame.
    pub fn read(buf: &[u8]) -> Result<(Packet, usize)> {
        let header = FixedHeader::parse(buf)?;
        let total = header.frame_len();
        if buf.len() < total {
            return Err(Error::Incomplete { needed: total - buf.len() });
        }

        let body = Bytes::copy_from_slice(&buf[HEADER_LEN..total]);
        Ok((Packet::decode(&header, body)?, total))
    }

    /// Decode a packet body according to its fixed header.
    pub fn decode(header: &FixedHeader, body: Bytes) -> Result<Packet> {
        let packet = match PacketType::from_u8(header.packet_type) {
            Some(PacketType::Connect) => Packet::Connect(body),
            Some(PacketType::ConnAck) => Packet::ConnAck(ConnAck::decode(&body)?),
            Some(PacketType::Publish) => Packet::Publish(Publish::decode(body)?),
            Some(PacketType::Subscribe) => Packet::Subscribe(Subscribe::decode(&body)?),
            Some(PacketType::SubAck) => Packet::SubAck(SubAck::decode(&body)?),
            Some(PacketType::PingReq) => Packet::PingReq,
            Some(PacketType::PingResp) => Packet::PingResp,
            Some(PacketType::Disconnect) => Packet::Disconnect,
            None => Packet::Unsupported {
                packet_type: header.packet_type,
                flags: header.flags,
                body,
            },
        };
        Ok(packet)
    }

    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
            Packet::Unsupported { .. } => "UNSUPPORTED",
        }
    }
}

impl ConnAck {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(malformed("CONNACK shorter than 2 bytes"));
        }
        Ok(ConnAck {
            session_present: buf[0] & 0x01 != 0,
            code: buf[1],
        })
    }
}

impl Publish {
    fn decode(body: Bytes) -> Result<Self> {
        let (topic, pos) = read_string(&body)?;
        let payload = body.slice(pos..);
        Ok(Publish { topic, payload })
    }

    fn body_len(&self) -> usize {
        2 + self.topic.len() + self.payload.len()
    }
}

impl Subscribe {
    fn decode(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf).ok_or_else(|| malformed("SUBSCRIBE without packet identifier"))?;
        // Only the first filter is decoded; its QoS byte and any further
        // filters are left in the body.
        let (filter, _) = read_string(&buf[2..])?;
        Ok(Subscribe { pkid, filter })
    }
}

impl SubAck {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 3 {
            return Err(malformed("SUBACK shorter than 3 bytes"));
        }
        let pkid = u16::from_be_bytes([buf[0], buf[1]]);
        Ok(SubAck { pkid, return_code: buf[2] })
    }
}

fn read_u16(buf: &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Read a length-prefixed UTF-8 string, returning it and the bytes consumed.
fn read_string(buf: &[u8]) -> Result<(String, usize)> {
    let len = read_u16(buf).ok_or_else(|| malformed("missing string length"))? as usize;
    if buf.len() < 2 + len {
        return Err(malformed(format!(
            "string length {} exceeds remaining {} bytes",
            len,
            buf.len() - 2
        )));
    }

    let s = std::str::from_utf8(&buf[2..2 + len]).map_err(|_| Error::InvalidUtf8)?;
    Ok((s.to_string(), 2 + len))
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedPacket(reason.into())
}

// ============================================================================
// Encoding
// ============================================================================

impl Packet {
    fn first_byte(&self) -> u8 {
        match self {
            Packet::Connect(_) => (PacketType::Connect as u8) << 4,
            Packet::ConnAck(_) => (PacketType::ConnAck as u8) << 4,
            Packet::Publish(_) => (PacketType::Publish as u8) << 4,
            // SUBSCRIBE carries fixed flags 0b0010.
            Packet::Subscribe(_) => ((PacketType::Subscribe as u8) << 4) | 0x02,
            Packet::SubAck(_) => (PacketType::SubAck as u8) << 4,
            Packet::PingReq => (PacketType::PingReq as u8) << 4,
            Packet::PingResp => (PacketType::PingResp as u8) << 4,
            Packet::Disconnect => (PacketType::Disconnect as u8) << 4,
            Packet::Unsupported { packet_type, flags, .. } => (packet_type << 4) | (flags & 0x0F),
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Packet::Connect(body) => body.len(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(p) => p.body_len(),
            Packet::Subscribe(s) => 2 + 2 + s.filter.len() + 1,
            Packet::SubAck(_) => 3,
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
            Packet::Unsupported { body, .. } => body.len(),
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        HEADER_LEN + self.body_len()
    }

    /// Check that the body fits the single-byte remaining length.
    pub fn check_size(&self) -> Result<()> {
        let size = self.body_len();
        if size > MAX_REMAINING_LENGTH {
            return Err(Error::PacketTooLarge { size, max: MAX_REMAINING_LENGTH });
        }
        Ok(())
    }

    /// Append the encoded packet to `buf`, returning the bytes written.
    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        self.check_size()?;

        let body_len = self.body_len();
        buf.reserve(HEADER_LEN + body_len);
        buf.put_u8(self.first_byte());
        buf.put_u8(body_len as u8);

        match self {
            Packet::Connect(body) => buf.put_slice(body),
            Packet::ConnAck(ack) => {
                buf.put_u8(ack.session_present as u8);
                buf.put_u8(ack.code);
            }
            Packet::Publish(p) => {
                write_string(buf, &p.topic);
                buf.put_slice(&p.payload);
            }
            Packet::Subscribe(s) => {
                buf.put_u16(s.pkid);
                write_string(buf, &s.filter);
                // Requested QoS 0.
                buf.put_u8(0);
            }
            Packet::SubAck(ack) => {
                buf.put_u16(ack.pkid);
                buf.put_u8(ack.return_code);
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
            Packet::Unsupported { body, .. } => buf.put_slice(body),
        }

        Ok(HEADER_LEN + body_len)
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }
}

// Callers check the total body size first, so the string always fits a u16.
fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

// ============================================================================
// Async I/O
// ============================================================================

/// Read a single packet from an async reader.
///
/// Bytes that arrive beyond the returned packet stay in `buf` for the next
/// call. Cancel-safe: dropping the future loses no data, so it can be used
/// as a `tokio::select!` branch.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match FixedHeader::parse(buf) {
                Ok(header) if buf.len() >= header.frame_len() => {
                    let mut frame = buf.split_to(header.frame_len()).freeze();
                    frame.advance(HEADER_LEN);
                    return Packet::decode(&header, frame);
                }
                Ok(_) | Err(Error::Incomplete { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(Error::ConnectionClosed);
            }
            return Err(Error::Truncated { buffered: buf.len() });
        }
    }
}

/// Write a single packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let buf = packet.to_bytes()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Helper functions for creating packets
// ============================================================================

/// Create a CONNECT packet in MQTT 3.1.1 layout with a clean session.
pub fn create_connect(client_id: &str, keep_alive: u16) -> Packet {
    let mut body = BytesMut::with_capacity(10 + 2 + client_id.len());
    write_string(&mut body, "MQTT");
    body.put_u8(PROTOCOL_LEVEL);
    // Connect flags: clean session.
    body.put_u8(0x02);
    body.put_u16(keep_alive);
    write_string(&mut body, client_id);
    Packet::Connect(body.freeze())
}

/// Create a CONNACK packet (session not present, accepted).
pub fn create_connack() -> Packet {
    Packet::ConnAck(ConnAck {
        session_present: false,
        code: CONNECT_ACCEPTED,
    })
}

/// Create a PUBLISH packet.
pub fn create_publish(topic: &str, payload: impl Into<Bytes>) -> Packet {
    Packet::Publish(Publish {
        topic: topic.to_string(),
        payload: payload.into(),
    })
}

/// Create a SUBSCRIBE packet for a single filter.
pub fn create_subscribe(pkid: u16, filter: &str) -> Packet {
    Packet::Subscribe(Subscribe {
        pkid,
        filter: filter.to_string(),
    })
}

/// Create a SUBACK packet granting QoS 0.
pub fn create_suback(pkid: u16) -> Packet {
    Packet::SubAck(SubAck { pkid, return_code: 0x00 })
}

/// Create a PINGREQ packet.
pub fn create_pingreq() -> Packet {
    Packet::PingReq
}

/// Create a PINGRESP packet.
pub fn create_pingresp() -> Packet {
    Packet::PingResp
}

/// Create a DISCONNECT packet.
pub fn create_disconnect() -> Packet {
    Packet::Disconnect
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_header() {
        let header = FixedHeader::parse(&[0x32, 0x05]).unwrap();
        assert_eq!(header.packet_type, 3);
        assert_eq!(header.flags, 0x02);
        assert_eq!(header.remaining_length, 5);
        assert_eq!(header.frame_len(), 7);

        assert!(matches!(FixedHeader::parse(&[0x30]), Err(Error::Incomplete { needed: 1 })));
    }

    #[test]
    fn test_remaining_length_limit() {
        let header = FixedHeader::parse(&[0x30, 0x7F]).unwrap();
        assert_eq!(header.remaining_length, 127);

        // 130 encodes as 0x82 0x01 and must be rejected outright.
        let err = Packet::read(&[0x30, 0x82, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, Error::RemainingLengthOutOfRange(0x82)));
    }

    #[test]
    fn test_fixed_encodings() {
        assert_eq!(create_connack().to_bytes().unwrap().as_ref(), &[0x20, 0x02, 0x00, 0x00]);
        assert_eq!(create_suback(7).to_bytes().unwrap().as_ref(), &[0x90, 0x03, 0x00, 0x07, 0x00]);
        assert_eq!(create_pingresp().to_bytes().unwrap().as_ref(), &[0xD0, 0x00]);
        assert_eq!(create_pingreq().to_bytes().unwrap().as_ref(), &[0xC0, 0x00]);
        assert_eq!(create_disconnect().to_bytes().unwrap().as_ref(), &[0xE0, 0x00]);
    }

    #[test]
    fn test_publish_encoding() {
        let bytes = create_publish("a/b", &b"hi"[..]).to_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']);
    }

    #[test]
    fn test_publish_decode() {
        let wire = [0x30, 0x14, 0x00, 0x0B, b's', b'e', b'n', b's', b'o', b'r', b'/', b'd', b'a', b't', b'a', b'{', b'"', b'v', b'"', b':', b'1', b'}'];
        let (packet, consumed) = Packet::read(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        match packet {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "sensor/data");
                assert_eq!(p.payload.as_ref(), b"{\"v\":1}");
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_topic_overruns_body() {
        // Topic length says 9 but only 3 bytes follow.
        let err = Packet::read(&[0x30, 0x05, 0x00, 0x09, b'a', b'/', b'b']).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
    }

    #[test]
    fn test_publish_invalid_utf8_topic() {
        let err = Packet::read(&[0x30, 0x04, 0x00, 0x02, 0xC3, 0x28]).unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8));
    }

    #[test]
    fn test_subscribe_first_filter_only() {
        let wire = [
            0x82, 0x0E, // header
            0x00, 0x07, // pkid
            0x00, 0x03, b'a', b'/', b'b', 0x00, // first filter + qos
            0x00, 0x03, b'c', b'/', b'd', 0x00, // second filter, ignored
        ];
        let (packet, _) = Packet::read(&wire).unwrap();
        assert_eq!(
            packet,
            Packet::Subscribe(Subscribe { pkid: 7, filter: "a/b".to_string() })
        );
    }

    #[test]
    fn test_subscribe_truncated() {
        let err = Packet::read(&[0x82, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
    }

    #[test]
    fn test_connect_body_uninterpreted() {
        let (packet, _) = Packet::read(&[0x10, 0x03, 0xDE, 0xAD, 0xBE]).unwrap();
        assert_eq!(packet, Packet::Connect(Bytes::from_static(&[0xDE, 0xAD, 0xBE])));

        let (packet, _) = Packet::read(&[0x10, 0x00]).unwrap();
        assert_eq!(packet, Packet::Connect(Bytes::new()));
    }

    #[test]
    fn test_create_connect_layout() {
        let bytes = create_connect("c1", 60).to_bytes().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x02, b'c', b'1']
        );
    }

    #[test]
    fn test_unsupported_type_keeps_framing() {
        // UNSUBSCRIBE followed by PINGREQ.
        let wire = [0xA2, 0x03, 0x00, 0x01, 0xFF, 0xC0, 0x00];
        let (packet, consumed) = Packet::read(&wire).unwrap();
        assert_eq!(consumed, 5);
        assert!(matches!(packet, Packet::Unsupported { packet_type: 10, flags: 2, .. }));

        let (packet, _) = Packet::read(&wire[consumed..]).unwrap();
        assert_eq!(packet, Packet::PingReq);
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let packet = create_publish("t", vec![0u8; 126]);
        let err = packet.to_bytes().unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge { size: 129, max: 127 }));

        // 2 + 1 + 124 = 127 fits exactly.
        let packet = create_publish("t", vec![0u8; 124]);
        assert_eq!(packet.to_bytes().unwrap().len(), 129);
    }

    #[test]
    fn test_suback_decode() {
        let (packet, _) = Packet::read(&[0x90, 0x03, 0x12, 0x34, 0x00]).unwrap();
        assert_eq!(packet, Packet::SubAck(SubAck { pkid: 0x1234, return_code: 0 }));
    }

    #[tokio::test]
    async fn test_read_packet_split_reads() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[0x30])
            .read(&[0x05, 0x00, 0x01])
            .read(&[b'x', b'o', b'k', 0xC0, 0x00])
            .build();
        let mut buf = BytesMut::new();

        let packet = read_packet(&mut reader, &mut buf).await.unwrap();
        assert_eq!(packet, create_publish("x", &b"ok"[..]));

        let packet = read_packet(&mut reader, &mut buf).await.unwrap();
        assert_eq!(packet, Packet::PingReq);

        let err = read_packet(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_packet_truncated_body() {
        let mut reader = tokio_test::io::Builder::new().read(&[0x30, 0x0A, 0x00]).build();
        let mut buf = BytesMut::new();

        let err = read_packet(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Truncated { buffered: 3 }));
    }

    #[tokio::test]
    async fn test_read_packet_rejects_long_length_without_body() {
        // The body never arrives; the header alone is enough to reject.
        let mut reader = tokio_test::io::Builder::new().read(&[0x30, 0x82]).build();
        let mut buf = BytesMut::new();

        let err = read_packet(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, Error::RemainingLengthOutOfRange(0x82)));
    }

    #[tokio::test]
    async fn test_write_packet() {
        let mut writer = tokio_test::io::Builder::new().write(&[0xD0, 0x00]).build();
        write_packet(&mut writer, &create_pingresp()).await.unwrap();
    }
}
