//! `tcp-over-sim`: a simplified, stop-and-wait TCP over a packet network.
//!
//! # Architecture
//!
//! ```text
//!          Upper::deliver(conn, byte)           connect / listen / send / close
//!                    ▲                                      │
//!  ┌─────────────────┴──────────────────────────────────────▼───────┐
//!  │                         Transport                              │
//!  │   ┌────────────┐   transitions   ┌─────────────────────────┐   │
//!  │   │ Dispatcher │────────────────▶│ ConnectionTable (mutex) │   │
//!  │   └─────▲──────┘                 └─────────────────────────┘   │
//!  │         │ bounded inbound queue                                │
//!  └─────────┼──────────────────────────────────────┬───────────────┘
//!            │ received(pdu, source)               │ Network::send(pdu, dest)
//!  ┌─────────┴──────────────────────────────────────▼───────────────┐
//!  │            Network layer (e.g. the in-process Simulator)       │
//!  └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`bits`]        packed bit buffer, the PDU representation
//! - [`packet`]      wire format (serialise / deserialise)
//! - [`connection`]  connection identity 4-tuple
//! - [`state`]       finite-state-machine types
//! - [`table`]       identity → state map and LISTEN hand-off slots
//! - [`ports`]       local port pool
//! - [`handshake`]   open and close handshake builders
//! - [`sender`]      stop-and-wait outbound segment state
//! - [`receiver`]    stop-and-wait inbound duplicate suppression
//! - [`dispatcher`]  inbound PDU classification and transitions
//! - [`transport`]   the public transport entity
//! - [`network`]     boundaries to the layers above and below
//! - [`config`]      timeouts, queue size and port range
//! - [`simulator`]   lossy in-process network for demos and tests

pub mod bits;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod handshake;
pub mod network;
pub mod packet;
pub mod ports;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod state;
pub mod table;
pub mod transport;

pub use bits::BitBuffer;
pub use config::{ConfigError, TransportConfig};
pub use connection::Connection;
pub use network::{Address, Inbox, Network, Upper};
pub use packet::{Header, Packet, PacketError};
pub use simulator::{Frame, SimLink, Simulator, SimulatorConfig};
pub use state::Phase;
pub use transport::{CloseOutcome, ConnectFailure, EntityState, Transport, TransportError};
