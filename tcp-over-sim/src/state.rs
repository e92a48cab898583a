//! Connection finite-state machine (FSM) types.
//!
//! [`Phase`] enumerates every state a connection can occupy and
//! [`ConnectionState`] is the mutable record the connection table keeps per
//! identity.  Transitions are not implemented here; they live in
//! [`crate::dispatcher`] (inbound side) and [`crate::transport`] (calls made
//! by the application).
//!
//! ```text
//!            connect                         listen
//!               │                              │
//!               ▼                              ▼
//!          CONNECT_1 ──SYN+ACK──┐           LISTEN ──SYN──▶ CONNECT_2
//!                               ▼                               │ ACK
//!                           CONNECTED ◀────────────────────────┘
//!                  send  │    ▲   │  FIN rcvd
//!                        ▼    │   ▼
//!                  WAIT_ACK ─ACK  CLOSE_2 ──▶ CLOSED
//!                           close │
//!                                 ▼
//!                              CLOSE_1 ──FIN+ACK──▶ CLOSE_3 ──▶ CLOSED
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::connection::Connection;
use crate::handshake::{CloseHandshake, OpenHandshake};
use crate::packet::Packet;
use crate::sender::PendingAck;

/// All possible phases of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Passive open; waiting for a connect request.
    Listen,
    /// SYN sent; waiting for the connect reply.
    Connect1,
    /// Connect request answered; waiting for the final ACK.
    Connect2,
    /// Handshake complete; idle and ready to send.
    Connected,
    /// One data segment in flight.
    WaitAck,
    /// FIN sent; waiting for the close reply.
    Close1,
    /// FIN received; replying.
    Close2,
    /// Close reply received.
    Close3,
    /// Terminal.  A closed connection is removed from the table.
    Closed,
}

impl Phase {
    /// Phases in which the connection can carry data.
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Connected | Phase::WaitAck)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Listen => "LISTEN",
            Phase::Connect1 => "CONNECT_1",
            Phase::Connect2 => "CONNECT_2",
            Phase::Connected => "CONNECTED",
            Phase::WaitAck => "WAIT_ACK",
            Phase::Close1 => "CLOSE_1",
            Phase::Close2 => "CLOSE_2",
            Phase::Close3 => "CLOSE_3",
            Phase::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Live state of one connection.
#[derive(Debug)]
pub struct ConnectionState {
    pub conn: Connection,
    pub phase: Phase,
    /// Most recently processed packet; used for duplicate suppression.
    pub last_packet: Option<Packet>,
    /// Alternating sequence bit of the last segment this side sent.
    pub seq_bit: u8,
    /// In-flight data segment.  `Some` exactly while `phase == WaitAck`.
    pub pending_ack: Option<PendingAck>,
    /// Data segments built on this connection so far.
    pub segments: u64,
    pub handshake: Option<OpenHandshake>,
    pub close_handshake: Option<CloseHandshake>,
    /// For a promoted LISTEN state: the identity that replaced it.
    pub promoted_to: Option<Connection>,
    /// Bytes queued by `put`, drained by the next `send`.
    pub outbound: VecDeque<u8>,
    /// Whether `conn.local_port` came from the port pool.
    pub owns_port: bool,
    /// Woken on every transition of this connection.
    pub wakeup: Arc<Notify>,
}

impl ConnectionState {
    pub fn new(conn: Connection, phase: Phase) -> Self {
        Self {
            conn,
            phase,
            last_packet: None,
            seq_bit: 0,
            pending_ack: None,
            segments: 0,
            handshake: None,
            close_handshake: None,
            promoted_to: None,
            outbound: VecDeque::new(),
            owns_port: false,
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Mark the local port as drawn from the pool.
    pub fn owning_port(mut self) -> Self {
        self.owns_port = true;
        self
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Address;

    #[test]
    fn only_connected_and_wait_ack_are_active() {
        let active: Vec<Phase> = [
            Phase::Listen,
            Phase::Connect1,
            Phase::Connect2,
            Phase::Connected,
            Phase::WaitAck,
            Phase::Close1,
            Phase::Close2,
            Phase::Close3,
            Phase::Closed,
        ]
        .into_iter()
        .filter(|p| p.is_active())
        .collect();
        assert_eq!(active, vec![Phase::Connected, Phase::WaitAck]);
    }

    #[test]
    fn new_state_starts_clean() {
        let conn = Connection::new(8, 10, Address(2), Address(1));
        let state = ConnectionState::new(conn, Phase::Connect1).owning_port();
        assert!(state.owns_port);
        assert_eq!(state.seq_bit, 0);
        assert!(state.pending_ack.is_none());
        assert!(state.outbound.is_empty());
        assert!(!state.is_active());
    }

    #[test]
    fn phase_display_uses_protocol_names() {
        assert_eq!(Phase::WaitAck.to_string(), "WAIT_ACK");
        assert_eq!(Phase::Connect2.to_string(), "CONNECT_2");
    }
}
