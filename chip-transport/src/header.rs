//! Packet and payload header framing.
//!
//! Packet header (always cleartext, authenticated as AAD when encrypted):
//!
//! ```text
//! message_flags:u8   version << 4 | 0x04 source present | 0x01 dest present
//! session_id:u16
//! security_flags:u8  0x80 encrypted | 0x40 session control message
//! counter:u32
//! source_node_id:u64 (optional)
//! dest_node_id:u64   (optional)
//! ```
//!
//! Payload header (encrypted together with the payload on secure sessions):
//!
//! ```text
//! exchange_flags:u8  0x01 initiator | 0x02 ack | 0x04 needs ack | 0x10 vendor
//! message_type:u8
//! exchange_id:u16
//! vendor_id:u16      (if vendor)
//! protocol_id:u16
//! ack_counter:u32    (if ack)
//! ```
//!
//! All integers are little-endian.

use crate::buffer::PacketBuffer;
use crate::error::Error;
use crate::session::NodeId;

/// The only packet header version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 0;

const FLAG_DEST_NODE_PRESENT:   u8 = 0x01;
const FLAG_SOURCE_NODE_PRESENT: u8 = 0x04;

const SEC_FLAG_ENCRYPTED: u8 = 0x80;
const SEC_FLAG_CONTROL:   u8 = 0x40;

const EX_FLAG_INITIATOR: u8 = 0x01;
const EX_FLAG_ACK:       u8 = 0x02;
const EX_FLAG_NEEDS_ACK: u8 = 0x04;
const EX_FLAG_VENDOR:    u8 = 0x10;

/// Secure channel protocol constants.
pub mod secure_channel {
    /// Protocol id of the secure channel protocol.
    pub const PROTOCOL_ID: u16 = 0x0000;
    /// Message counter synchronization request.
    pub const MSG_COUNTER_SYNC_REQ: u8 = 0x00;
    /// Message counter synchronization response.
    pub const MSG_COUNTER_SYNC_RSP: u8 = 0x01;
}

fn read_u16(b: &[u8], at: usize) -> u16 { u16::from_le_bytes([b[at], b[at + 1]]) }
fn read_u32(b: &[u8], at: usize) -> u32 { u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]) }
fn read_u64(b: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(raw)
}

// ─── PacketHeader ─────────────────────────────────────────────────────────────

/// The outer, never-encrypted message header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Receiver's local session id (0 for unauthenticated traffic).
    pub session_id:          u16,
    /// Raw security flags byte.
    pub security_flags:      u8,
    /// Sender's message counter for this message.
    pub counter:             u32,
    /// Sender node id, if carried.
    pub source_node_id:      Option<NodeId>,
    /// Destination node id, if carried.
    pub destination_node_id: Option<NodeId>,
}

impl PacketHeader {
    /// Size of the fixed part of the header.
    pub const MIN_SIZE: usize = 8;

    /// True if the payload that follows is encrypted.
    pub fn is_encrypted(&self) -> bool { self.security_flags & SEC_FLAG_ENCRYPTED != 0 }

    /// Set or clear the encrypted flag.
    pub fn set_encrypted(&mut self, on: bool) { self.set_sec_flag(SEC_FLAG_ENCRYPTED, on) }

    /// True if this carries a secure session control message.
    pub fn is_secure_session_control_msg(&self) -> bool { self.security_flags & SEC_FLAG_CONTROL != 0 }

    /// Set or clear the session control flag.
    pub fn set_secure_session_control_msg(&mut self, on: bool) { self.set_sec_flag(SEC_FLAG_CONTROL, on) }

    fn set_sec_flag(&mut self, bit: u8, on: bool) {
        if on { self.security_flags |= bit } else { self.security_flags &= !bit }
    }

    /// Encoded length in bytes.
    pub fn encoded_size(&self) -> usize {
        Self::MIN_SIZE
            + if self.source_node_id.is_some() { 8 } else { 0 }
            + if self.destination_node_id.is_some() { 8 } else { 0 }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = PROTOCOL_VERSION << 4;
        if self.source_node_id.is_some() { flags |= FLAG_SOURCE_NODE_PRESENT; }
        if self.destination_node_id.is_some() { flags |= FLAG_DEST_NODE_PRESENT; }

        let mut out = Vec::with_capacity(self.encoded_size());
        out.push(flags);
        out.extend(self.session_id.to_le_bytes());
        out.push(self.security_flags);
        out.extend(self.counter.to_le_bytes());
        if let Some(id) = self.source_node_id { out.extend(id.to_le_bytes()); }
        if let Some(id) = self.destination_node_id { out.extend(id.to_le_bytes()); }
        out
    }

    /// Prepend the encoded header to `buf`.
    pub fn encode_before_data(&self, buf: &mut PacketBuffer) {
        buf.extend_front(&self.to_bytes());
    }

    /// Decode from the start of `bytes`, returning the header and its length.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < Self::MIN_SIZE {
            return Err(Error::BufferTooSmall);
        }
        let flags = bytes[0];
        if flags >> 4 != PROTOCOL_VERSION {
            return Err(Error::InvalidHeader("version"));
        }
        let mut header = Self {
            session_id:     read_u16(bytes, 1),
            security_flags: bytes[3],
            counter:        read_u32(bytes, 4),
            ..Self::default()
        };
        let mut at = Self::MIN_SIZE;
        if flags & FLAG_SOURCE_NODE_PRESENT != 0 {
            if bytes.len() < at + 8 { return Err(Error::BufferTooSmall); }
            header.source_node_id = Some(read_u64(bytes, at));
            at += 8;
        }
        if flags & FLAG_DEST_NODE_PRESENT != 0 {
            if bytes.len() < at + 8 { return Err(Error::BufferTooSmall); }
            header.destination_node_id = Some(read_u64(bytes, at));
            at += 8;
        }
        Ok((header, at))
    }

    /// Decode from the front of `buf` and consume the header bytes.
    pub fn decode_and_consume(buf: &mut PacketBuffer) -> Result<Self, Error> {
        let (header, size) = Self::decode(buf.as_ref())?;
        buf.consume_front(size);
        Ok(header)
    }
}

// ─── PayloadHeader ────────────────────────────────────────────────────────────

/// The exchange-level header that precedes the application payload.
///
/// Built with chained setters:
///
/// ```rust
/// use chip_transport::PayloadHeader;
///
/// let header = PayloadHeader::new(0x0001, 0x05)
///     .with_exchange_id(42)
///     .with_initiator(true)
///     .with_needs_ack(true);
/// assert!(header.needs_ack());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Protocol-specific message type.
    pub message_type: u8,
    /// Exchange this message belongs to.
    pub exchange_id:  u16,
    /// Vendor id qualifying `protocol_id`; `None` for the standard vendor.
    pub vendor_id:    Option<u16>,
    /// Protocol id.
    pub protocol_id:  u16,
    /// Sent by the exchange initiator.
    pub initiator:    bool,
    /// The receiver must acknowledge this message.
    pub needs_ack:    bool,
    /// Counter of the message this one acknowledges.
    pub ack_counter:  Option<u32>,
}

impl PayloadHeader {
    /// A header for `protocol_id` / `message_type` with everything else unset.
    pub fn new(protocol_id: u16, message_type: u8) -> Self {
        Self { protocol_id, message_type, ..Self::default() }
    }

    /// Set the exchange id.
    pub fn with_exchange_id(mut self, id: u16) -> Self { self.exchange_id = id; self }

    /// Set the vendor id.
    pub fn with_vendor_id(mut self, vendor: u16) -> Self { self.vendor_id = Some(vendor); self }

    /// Mark as sent by the exchange initiator.
    pub fn with_initiator(mut self, on: bool) -> Self { self.initiator = on; self }

    /// Request an acknowledgement.
    pub fn with_needs_ack(mut self, on: bool) -> Self { self.needs_ack = on; self }

    /// Piggy-back an acknowledgement for `counter`.
    pub fn with_ack(mut self, counter: u32) -> Self { self.ack_counter = Some(counter); self }

    /// True if the receiver must acknowledge this message.
    pub fn needs_ack(&self) -> bool { self.needs_ack }

    /// True for secure channel message counter synchronization messages.
    pub fn is_control_message(&self) -> bool {
        self.vendor_id.is_none()
            && self.protocol_id == secure_channel::PROTOCOL_ID
            && matches!(
                self.message_type,
                secure_channel::MSG_COUNTER_SYNC_REQ | secure_channel::MSG_COUNTER_SYNC_RSP
            )
    }

    /// Encoded length in bytes.
    pub fn encoded_size(&self) -> usize {
        6 + if self.vendor_id.is_some() { 2 } else { 0 }
          + if self.ack_counter.is_some() { 4 } else { 0 }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.initiator { flags |= EX_FLAG_INITIATOR; }
        if self.ack_counter.is_some() { flags |= EX_FLAG_ACK; }
        if self.needs_ack { flags |= EX_FLAG_NEEDS_ACK; }
        if self.vendor_id.is_some() { flags |= EX_FLAG_VENDOR; }

        let mut out = Vec::with_capacity(self.encoded_size());
        out.push(flags);
        out.push(self.message_type);
        out.extend(self.exchange_id.to_le_bytes());
        if let Some(v) = self.vendor_id { out.extend(v.to_le_bytes()); }
        out.extend(self.protocol_id.to_le_bytes());
        if let Some(c) = self.ack_counter { out.extend(c.to_le_bytes()); }
        out
    }

    /// Prepend the encoded header to `buf`.
    pub fn encode_before_data(&self, buf: &mut PacketBuffer) {
        buf.extend_front(&self.to_bytes());
    }

    /// Decode from the start of `bytes`, returning the header and its length.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < 6 {
            return Err(Error::BufferTooSmall);
        }
        let flags = bytes[0];
        let mut header = Self {
            message_type: bytes[1],
            exchange_id:  read_u16(bytes, 2),
            initiator:    flags & EX_FLAG_INITIATOR != 0,
            needs_ack:    flags & EX_FLAG_NEEDS_ACK != 0,
            ..Self::default()
        };
        let mut at = 4;
        if flags & EX_FLAG_VENDOR != 0 {
            if bytes.len() < at + 4 { return Err(Error::BufferTooSmall); }
            header.vendor_id = Some(read_u16(bytes, at));
            at += 2;
        }
        header.protocol_id = read_u16(bytes, at);
        at += 2;
        if flags & EX_FLAG_ACK != 0 {
            if bytes.len() < at + 4 { return Err(Error::BufferTooSmall); }
            header.ack_counter = Some(read_u32(bytes, at));
            at += 4;
        }
        Ok((header, at))
    }

    /// Decode from the front of `buf` and consume the header bytes.
    pub fn decode_and_consume(buf: &mut PacketBuffer) -> Result<Self, Error> {
        let (header, size) = Self::decode(buf.as_ref())?;
        buf.consume_front(size);
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_header_fixed_layout() {
        let mut h = PacketHeader { session_id: 0x0102, counter: 0x0a0b0c0d, ..Default::default() };
        h.set_encrypted(true);
        let wire = h.to_bytes();
        assert_eq!(wire, vec![0x00, 0x02, 0x01, 0x80, 0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(wire.len(), h.encoded_size());
    }

    #[test]
    fn packet_header_optional_node_ids() {
        let h = PacketHeader { source_node_id: Some(42), destination_node_id: Some(7), ..Default::default() };
        let wire = h.to_bytes();
        assert_eq!(wire[0], FLAG_SOURCE_NODE_PRESENT | FLAG_DEST_NODE_PRESENT);
        assert_eq!(wire.len(), 24);
        let (back, used) = PacketHeader::decode(&wire).unwrap();
        assert_eq!(used, 24);
        assert_eq!(back, h);
    }

    #[test]
    fn packet_header_rejects_short_and_bad_version() {
        assert!(matches!(PacketHeader::decode(&[0u8; 7]), Err(Error::BufferTooSmall)));
        assert!(matches!(PacketHeader::decode(&[0x10, 0, 0, 0, 0, 0, 0, 0]), Err(Error::InvalidHeader("version"))));
        // source flag set but node id missing
        assert!(matches!(PacketHeader::decode(&[0x04, 0, 0, 0, 0, 0, 0, 0, 1]), Err(Error::BufferTooSmall)));
    }

    #[test]
    fn security_flags_toggle_independently() {
        let mut h = PacketHeader::default();
        h.set_secure_session_control_msg(true);
        h.set_encrypted(true);
        h.set_encrypted(false);
        assert!(h.is_secure_session_control_msg());
        assert!(!h.is_encrypted());
    }

    #[test]
    fn payload_header_with_vendor_and_ack() {
        let h = PayloadHeader::new(0x0005, 0x22)
            .with_exchange_id(0x1234)
            .with_vendor_id(0xfff1)
            .with_ack(99)
            .with_needs_ack(true);
        let wire = h.to_bytes();
        assert_eq!(wire.len(), 12);
        assert_eq!(wire[0], EX_FLAG_ACK | EX_FLAG_NEEDS_ACK | EX_FLAG_VENDOR);
        let (back, used) = PayloadHeader::decode(&wire).unwrap();
        assert_eq!(used, 12);
        assert_eq!(back, h);
    }

    #[test]
    fn payload_header_decode_consumes() {
        let mut buf = PacketBuffer::from_payload(b"body");
        PayloadHeader::new(1, 2).with_initiator(true).encode_before_data(&mut buf);
        let h = PayloadHeader::decode_and_consume(&mut buf).unwrap();
        assert!(h.initiator);
        assert_eq!(buf.as_ref(), b"body");
    }

    #[test]
    fn control_message_detection() {
        assert!(PayloadHeader::new(secure_channel::PROTOCOL_ID, secure_channel::MSG_COUNTER_SYNC_REQ).is_control_message());
        assert!(PayloadHeader::new(secure_channel::PROTOCOL_ID, secure_channel::MSG_COUNTER_SYNC_RSP).is_control_message());
        assert!(!PayloadHeader::new(secure_channel::PROTOCOL_ID, 0x20).is_control_message());
        assert!(!PayloadHeader::new(0x0001, secure_channel::MSG_COUNTER_SYNC_REQ).is_control_message());
        assert!(!PayloadHeader::new(secure_channel::PROTOCOL_ID, 0x00).with_vendor_id(5).is_control_message());
    }
}
