//! Boundaries between the transport entity and its neighbours.
//!
//! The transport sits between two collaborators:
//!
//! ```text
//!            Upper::deliver(conn, byte)
//!   ┌───────────────────▲───────────────────┐
//!   │             Transport                 │
//!   └───────────────────┬───────────────────┘
//!            Network::send(pdu, dest)
//! ```
//!
//! Inbound PDUs travel the other way through
//! [`crate::transport::Transport::received`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bits::BitBuffer;
use crate::connection::Connection;

/// A network-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u32);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0.to_be_bytes();
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl From<u32> for Address {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// The packet-oriented layer beneath the transport.
///
/// `send` must not block for long: it is called from the dispatcher task
/// and from application tasks alike.
pub trait Network: Send + Sync {
    /// Hand one PDU to the network for delivery to `dest`.
    fn send(&self, pdu: BitBuffer, dest: Address);

    /// Address of this host.
    fn local_address(&self) -> Address;

    /// Largest PDU, in bits, the network carries in one piece.
    fn max_segment_size(&self) -> usize;
}

/// The consumer of delivered payload bytes.
pub trait Upper: Send + Sync {
    /// Called once per payload byte, in order, from the dispatcher task.
    fn deliver(&self, conn: Connection, byte: u8);
}

/// [`Upper`] implementation that forwards every byte into a channel.
#[derive(Debug, Clone)]
pub struct Inbox {
    tx: mpsc::UnboundedSender<(Connection, u8)>,
}

impl Inbox {
    /// Create an inbox and the receiver its bytes come out of.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<(Connection, u8)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Upper for Inbox {
    fn deliver(&self, conn: Connection, byte: u8) {
        if self.tx.send((conn, byte)).is_err() {
            log::debug!("[inbox] reader gone; dropping byte for {conn}");
        }
    }
}
