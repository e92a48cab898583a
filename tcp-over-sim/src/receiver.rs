//! Inbound data acceptance.
//!
//! A data segment is delivered upward only when it differs from the last
//! packet the connection processed.  The comparison is over the whole
//! packet (header and payload), not the sequence bit alone, so a
//! retransmission of the segment just delivered is suppressed while any
//! other segment goes through.
//!
//! Whatever the outcome, the caller answers with [`build_ack`].

use crate::connection::Connection;
use crate::packet::{flags, Header, Packet};

/// Outcome of offering a data segment to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// New data; the payload must be delivered upward.
    Fresh,
    /// Identical to the last packet; payload already delivered.
    Duplicate,
}

/// Classify `packet` against the connection's `last_packet`, recording it
/// as the new last packet when it is fresh.
pub fn accept(last_packet: &mut Option<Packet>, packet: &Packet) -> Delivery {
    if last_packet.as_ref() == Some(packet) {
        return Delivery::Duplicate;
    }
    *last_packet = Some(packet.clone());
    Delivery::Fresh
}

/// ACK for a received data segment: acknowledges its sequence bit.
pub fn build_ack(conn: &Connection, data: &Packet) -> Packet {
    let mut header = Header::new(conn.local_port, conn.remote_port.unwrap_or_default(), flags::ACK);
    header.ack = data.header.seq;
    Packet::control(header)
}
