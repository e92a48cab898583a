//! Wire-format definitions for protocol segments.
//!
//! Every PDU exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire bit layout (header fields, flags, payload).
//! - Serialising a [`Packet`] into a [`BitBuffer`] ready for the network layer.
//! - Deserialising a [`BitBuffer`] back into a [`Packet`], returning errors
//!   for truncated or ragged input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! Fields are packed MSB-first with no padding between them:
//!
//! ```text
//!  0       4       8   9   10  11  12  13
//! +-------+-------+---+---+---+---+---+---------------------------+
//! |  src  |  dst  |SYN|ACK|FIN|SEQ|ACK|     payload (8·n bits)    |
//! | port  | port  |   |   |   |bit|bit|                           |
//! +-------+-------+---+---+---+---+---+---------------------------+
//! ```
//!
//! Total header size: [`HEADER_BITS`] = 13 bits.  There is no length or
//! checksum field; framing relies on the network layer delivering one PDU
//! per call.  Port values wider than [`PORT_BITS`] wrap modulo 2^PORT_BITS.

use thiserror::Error;

use crate::bits::BitBuffer;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Synchronise (connect request / connect reply).
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0010;
    /// Finish (close request / close reply).
    pub const FIN: u8 = 0b0000_0100;
}

/// Width of each port field.
pub const PORT_BITS: usize = 4;

/// Bit length of the fixed-size header on the wire.
pub const HEADER_BITS: usize = 2 * PORT_BITS + 5;

// Bit offsets of each field within the serialised header.
const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = PORT_BITS;
const OFF_SYN: usize = 2 * PORT_BITS;
const OFF_ACK_FLAG: usize = OFF_SYN + 1;
const OFF_FIN: usize = OFF_SYN + 2;
const OFF_SEQ: usize = OFF_SYN + 3;
const OFF_ACK_NUM: usize = OFF_SYN + 4;

/// Largest port number representable in a header.
pub const MAX_PORT: u16 = (1 << PORT_BITS) - 1;

/// Fixed-size protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Header {
    /// Port of the sending endpoint.
    pub src_port: u16,
    /// Port of the receiving endpoint.
    pub dst_port: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Alternating sequence bit (0 or 1).
    pub seq: u8,
    /// Acknowledged sequence bit (0 or 1).
    pub ack: u8,
}

impl Header {
    pub fn new(src_port: u16, dst_port: u16, flags: u8) -> Self {
        Self {
            src_port,
            dst_port,
            flags,
            seq: 0,
            ack: 0,
        }
    }

    pub fn is_syn(&self) -> bool {
        self.flags & flags::SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }
}

/// A complete protocol PDU: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// A header-only packet.
    pub fn control(header: Header) -> Self {
        Self {
            header,
            payload: Vec::new(),
        }
    }

    /// Number of bits this packet occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_BITS + self.payload.len() * 8
    }

    /// Serialise this packet into a newly allocated bit buffer.
    ///
    /// Ports wrap modulo 2^[`PORT_BITS`]; seq/ack keep only their low bit.
    pub fn encode(&self) -> BitBuffer {
        let h = &self.header;
        let mut buf = BitBuffer::new(self.wire_len());

        buf.put(OFF_SRC_PORT, PORT_BITS, u64::from(h.src_port));
        buf.put(OFF_DST_PORT, PORT_BITS, u64::from(h.dst_port));
        buf.set(OFF_SYN, h.is_syn());
        buf.set(OFF_ACK_FLAG, h.is_ack());
        buf.set(OFF_FIN, h.is_fin());
        buf.put(OFF_SEQ, 1, u64::from(h.seq));
        buf.put(OFF_ACK_NUM, 1, u64::from(h.ack));

        for (i, byte) in self.payload.iter().enumerate() {
            buf.put(HEADER_BITS + i * 8, 8, u64::from(*byte));
        }

        buf
    }

    /// Parse a [`Packet`] from a raw bit buffer.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_BITS`], or
    /// - the bits after the header are not a whole number of bytes.
    pub fn decode(buf: &BitBuffer) -> Result<Self, PacketError> {
        if buf.len() < HEADER_BITS {
            return Err(PacketError::TooShort(buf.len()));
        }
        let payload_bits = buf.len() - HEADER_BITS;
        if payload_bits % 8 != 0 {
            return Err(PacketError::RaggedPayload(payload_bits));
        }

        let mut flags = 0;
        if buf.get(OFF_SYN) {
            flags |= flags::SYN;
        }
        if buf.get(OFF_ACK_FLAG) {
            flags |= flags::ACK;
        }
        if buf.get(OFF_FIN) {
            flags |= flags::FIN;
        }

        let header = Header {
            src_port: buf.read(OFF_SRC_PORT, PORT_BITS) as u16,
            dst_port: buf.read(OFF_DST_PORT, PORT_BITS) as u16,
            flags,
            seq: buf.read(OFF_SEQ, 1) as u8,
            ack: buf.read(OFF_ACK_NUM, 1) as u8,
        };

        let payload = (0..payload_bits / 8)
            .map(|i| buf.read(HEADER_BITS + i * 8, 8) as u8)
            .collect();

        Ok(Packet { header, payload })
    }
}

/// Errors that can arise when parsing a raw PDU.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("PDU of {0} bits is shorter than the {HEADER_BITS}-bit header")]
    TooShort(usize),
    /// Payload does not end on a byte boundary.
    #[error("payload of {0} bits is not a whole number of bytes")]
    RaggedPayload(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(src: u16, dst: u16, flags: u8, seq: u8, ack: u8, payload: &[u8]) -> Packet {
        Packet {
            header: Header {
                src_port: src,
                dst_port: dst,
                flags,
                seq,
                ack,
            },
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let pkt = make_packet(8, 10, 0, 1, 0, b"AB");
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let pkt = make_packet(15, 0, flags::SYN | flags::ACK, 0, 1, b"");
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn header_len_constant_is_correct() {
        // src(4) + dst(4) + SYN + ACK + FIN + seq + ack = 13
        assert_eq!(HEADER_BITS, 13);
    }

    #[test]
    fn encoded_length_equals_header_plus_payload() {
        let bits = make_packet(0, 0, 0, 0, 0, b"xyz").encode();
        assert_eq!(bits.len(), HEADER_BITS + 24);
    }

    #[test]
    fn oversized_ports_wrap_instead_of_failing() {
        let pkt = make_packet(MAX_PORT + 3, 2 * (MAX_PORT + 1) + 9, 0, 0, 0, b"");
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.header.src_port, 2);
        assert_eq!(decoded.header.dst_port, 9);
    }

    #[test]
    fn seq_and_ack_keep_only_the_low_bit() {
        let pkt = make_packet(1, 2, flags::ACK, 3, 2, b"");
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.header.seq, 1);
        assert_eq!(decoded.header.ack, 0);
    }

    #[test]
    fn flag_bits_land_at_their_offsets() {
        let bits = make_packet(0, 0, flags::SYN | flags::FIN, 1, 1, b"").encode();
        assert_eq!(bits.to_string(), "0000000010111");
    }

    #[test]
    fn payload_is_msb_first_after_header() {
        let bits = make_packet(0, 0, 0, 0, 0, &[0x41]).encode();
        assert_eq!(bits.read(HEADER_BITS, 8), 0x41);
        assert!(bits.get(HEADER_BITS + 1));
        assert!(!bits.get(HEADER_BITS));
    }

    #[test]
    fn decode_short_buffer_returns_error() {
        assert_eq!(
            Packet::decode(&BitBuffer::new(HEADER_BITS - 1)),
            Err(PacketError::TooShort(HEADER_BITS - 1))
        );
    }

    #[test]
    fn decode_ragged_payload_returns_error() {
        assert_eq!(
            Packet::decode(&BitBuffer::new(HEADER_BITS + 5)),
            Err(PacketError::RaggedPayload(5))
        );
    }

    #[test]
    fn header_helpers_reflect_flags() {
        let h = Header::new(1, 2, flags::ACK | flags::FIN);
        assert!(h.is_ack());
        assert!(h.is_fin());
        assert!(!h.is_syn());
    }
}
