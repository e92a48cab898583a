//! Message builders for the opening and closing handshakes.
//!
//! ```text
//!  active                      passive
//!    │ ── SYN ───────────────▶   │   OpenHandshake::first_way
//!    │ ◀──────────── SYN+ACK ─   │   OpenHandshake::second_way
//!    │ ── ACK ───────────────▶   │   OpenHandshake::third_way
//!
//!    │ ── FIN ───────────────▶   │   CloseHandshake::first_way
//!    │ ◀──────────── FIN+ACK ─   │   CloseHandshake::second_way
//! ```
//!
//! The builders only produce packets; sending them and moving the
//! connection between phases is the caller's job.  Each builder remembers
//! the last step it produced so a connection's handshake progress shows up
//! in its debug output.

use crate::packet::{flags, Header, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    First,
    Second,
    Third,
}

/// Three-step open: SYN, SYN+ACK, ACK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenHandshake {
    last: Option<Step>,
}

impl OpenHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last step built, if any.
    pub fn last_step(&self) -> Option<Step> {
        self.last
    }

    /// Connect request sent by the active opener.
    pub fn first_way(&mut self, local_port: u16, remote_port: u16) -> Packet {
        self.last = Some(Step::First);
        Packet::control(Header::new(local_port, remote_port, flags::SYN))
    }

    /// Connect reply sent by the listener in answer to `request`.
    pub fn second_way(&mut self, local_port: u16, remote_port: u16, request: &Packet) -> Packet {
        self.last = Some(Step::Second);
        let mut header = Header::new(local_port, remote_port, flags::SYN | flags::ACK);
        header.ack = request.header.seq;
        Packet::control(header)
    }

    /// Final ACK sent by the active opener on receiving the connect reply.
    pub fn third_way(&mut self, local_port: u16, remote_port: u16) -> Packet {
        self.last = Some(Step::Third);
        Packet::control(Header::new(local_port, remote_port, flags::ACK))
    }
}

/// Close: FIN, then FIN+ACK.  The passive side considers the connection
/// gone as soon as it has replied, so there is no third message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseHandshake {
    last: Option<Step>,
}

impl CloseHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_step(&self) -> Option<Step> {
        self.last
    }

    /// Close request sent by the active closer.
    pub fn first_way(&mut self, local_port: u16, remote_port: u16) -> Packet {
        self.last = Some(Step::First);
        Packet::control(Header::new(local_port, remote_port, flags::FIN))
    }

    /// Close reply sent by the passive closer in answer to `request`.
    pub fn second_way(&mut self, local_port: u16, remote_port: u16, request: &Packet) -> Packet {
        self.last = Some(Step::Second);
        let mut header = Header::new(local_port, remote_port, flags::FIN | flags::ACK);
        header.ack = request.header.seq;
        Packet::control(header)
    }
}
