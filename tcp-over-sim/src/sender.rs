//! Outbound segment state for stop-and-wait reliability.
//!
//! [`PendingAck`] tracks the single in-flight data segment of a connection.
//! It does **not** touch the network; [`crate::transport::Transport::send`]
//! owns the send/wait/retransmit loop and the dispatcher clears the slot
//! when the matching ACK arrives.
//!
//! # Stop-and-Wait contract
//! - At most **one** segment is in flight per connection.
//! - Every new segment flips the connection's sequence bit.
//! - An ACK matches when its ack bit equals the in-flight segment's seq bit.
//! - On timeout: increment `tx_count`; resend the identical PDU.

use crate::bits::BitBuffer;
use crate::connection::Connection;
use crate::packet::{Header, Packet};

/// A data segment that has been sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    /// Per-connection number of this segment, counting from 1.  Tells one
    /// `send` call's segment from the next even when their bits agree.
    pub number: u64,
    /// The segment on the wire.
    pub packet: Packet,
    /// Its serialised form, resent unchanged on every retransmission.
    pub pdu: BitBuffer,
    /// How many times this segment has been transmitted (1 = first send).
    pub tx_count: u32,
}

impl PendingAck {
    pub fn new(number: u64, packet: Packet) -> Self {
        let pdu = packet.encode();
        Self {
            number,
            packet,
            pdu,
            tx_count: 1,
        }
    }

    /// Sequence bit of the in-flight segment.
    pub fn seq(&self) -> u8 {
        self.packet.header.seq
    }

    /// `true` if an ACK carrying `ack_bit` acknowledges this segment.
    pub fn matches(&self, ack_bit: u8) -> bool {
        ack_bit & 1 == self.seq()
    }

    /// Record a retransmission.
    pub fn on_retransmit(&mut self) {
        self.tx_count += 1;
    }
}

/// The alternating bit that follows `bit`.
pub fn next_seq(bit: u8) -> u8 {
    (bit ^ 1) & 1
}

/// Build a data segment from `conn`'s local port to its remote port.
///
/// Data segments carry no flags.
pub fn build_data_packet(conn: &Connection, seq: u8, payload: Vec<u8>) -> Packet {
    let mut header = Header::new(conn.local_port, conn.remote_port.unwrap_or_default(), 0);
    header.seq = seq & 1;
    Packet { header, payload }
}
