//! Inbound PDU dispatcher.
//!
//! One task per transport drains the bounded inbound queue and runs every
//! PDU to completion before taking the next, so all receive-side state
//! changes are serialised.
//!
//! For each PDU the dispatcher:
//! 1. decodes it ([`Packet::decode`]); undecodable PDUs are dropped,
//! 2. classifies it by flag combination ([`Kind::classify`]),
//! 3. looks up the connection it belongs to and applies the transition for
//!    that kind, producing [`Effects`] while the table lock is held,
//! 4. releases the lock and applies the effects: bytes upward, PDUs
//!    downward, then wake-ups.
//!
//! Packets for unknown identities or for connections in the wrong phase are
//! logged and dropped.  They are normal on a lossy network and never stop
//! the dispatcher.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::bits::BitBuffer;
use crate::connection::Connection;
use crate::handshake::{CloseHandshake, OpenHandshake};
use crate::network::{Address, Network, Upper};
use crate::packet::{Header, Packet};
use crate::ports::PortPool;
use crate::receiver::{self, Delivery};
use crate::state::{ConnectionState, Phase};
use crate::table::ConnectionTable;
use crate::transport::Shared;

/// One PDU handed over by the network layer.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub pdu: BitBuffer,
    pub source: Address,
}

/// What a packet means, derived purely from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// SYN+ACK.
    ConnectReply,
    /// SYN without ACK.
    ConnectRequest,
    /// FIN without ACK.
    CloseRequest,
    /// FIN+ACK.
    CloseReply,
    /// Bare ACK: completes a handshake or acknowledges data.
    Ack,
    /// No flags.
    Data,
}

impl Kind {
    /// Classify `header`.  SYN takes precedence over FIN, so every flag
    /// combination maps to exactly one kind.
    pub fn classify(header: &Header) -> Self {
        match (header.is_syn(), header.is_ack(), header.is_fin()) {
            (true, true, _) => Kind::ConnectReply,
            (true, false, _) => Kind::ConnectRequest,
            (false, false, true) => Kind::CloseRequest,
            (false, true, true) => Kind::CloseReply,
            (false, true, false) => Kind::Ack,
            (false, false, false) => Kind::Data,
        }
    }
}

/// Side effects of one dispatched packet, applied after the table lock is
/// released.
#[derive(Debug, Default)]
pub struct Effects {
    /// Payload bytes for the upper layer, in order.
    pub upward: Vec<(Connection, u8)>,
    /// PDUs for the network layer.
    pub outbound: Vec<(BitBuffer, Address)>,
    /// Connections whose waiters must re-check their condition.
    pub wake: Vec<Arc<Notify>>,
}

impl Effects {
    fn send(&mut self, packet: &Packet, dest: Address) {
        self.outbound.push((packet.encode(), dest));
    }

    fn wake(&mut self, state: &ConnectionState) {
        self.wake.push(Arc::clone(&state.wakeup));
    }

    /// Deliver bytes upward, send PDUs downward, then wake waiters.
    pub fn apply(self, network: &dyn Network, upper: &dyn Upper) {
        for (conn, byte) in self.upward {
            log::trace!("[dispatch] ↑ {byte:#04x} to {conn}");
            upper.deliver(conn, byte);
        }
        for (pdu, dest) in self.outbound {
            network.send(pdu, dest);
        }
        for wakeup in self.wake {
            wakeup.notify_waiters();
        }
    }
}

/// Dispatcher task body: drain `rx` until every sender is gone.
pub(crate) async fn run(shared: Arc<Shared>, mut rx: mpsc::Receiver<Inbound>) {
    let local = shared.network.local_address();
    while let Some(Inbound { pdu, source }) = rx.recv().await {
        let packet = match Packet::decode(&pdu) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("[dispatch] dropping PDU from {source}: {e}");
                continue;
            }
        };
        let effects = {
            let mut table = shared.table();
            dispatch(&mut table, &shared.ports, local, packet, source)
        };
        effects.apply(shared.network.as_ref(), shared.upper.as_ref());
    }
    log::debug!("[dispatch] inbound queue closed; dispatcher for {local} exiting");
}

/// Apply the transition `packet` (received from `source`) triggers on
/// `table`.  `local` is this host's address.
pub fn dispatch(
    table: &mut ConnectionTable,
    ports: &PortPool,
    local: Address,
    packet: Packet,
    source: Address,
) -> Effects {
    let kind = Kind::classify(&packet.header);
    // The peer's source port is our remote port and vice versa.
    let key = Connection::new(packet.header.dst_port, packet.header.src_port, source, local);
    log::debug!("[dispatch] ← {kind:?} for {key}");

    let mut fx = Effects::default();
    match kind {
        Kind::ConnectReply => on_connect_reply(table, &key, packet, &mut fx),
        Kind::ConnectRequest => on_connect_request(table, key, packet, &mut fx),
        Kind::CloseRequest => on_close_request(table, ports, &key, packet, &mut fx),
        Kind::CloseReply => on_close_reply(table, ports, &key, packet, &mut fx),
        Kind::Ack => on_ack(table, &key, packet, &mut fx),
        Kind::Data => on_data(table, &key, packet, &mut fx),
    }
    fx
}

fn on_connect_reply(table: &mut ConnectionTable, key: &Connection, packet: Packet, fx: &mut Effects) {
    let Some(state) = table.get_mut(key) else {
        log::debug!("[dispatch] connect reply for unknown connection {key}");
        return;
    };
    if state.phase != Phase::Connect1 {
        log::debug!("[dispatch] connect reply ignored: {key} is in {}", state.phase);
        return;
    }
    let remote_port = key.remote_port.unwrap_or_default();
    let ack = state
        .handshake
        .get_or_insert_with(OpenHandshake::new)
        .third_way(key.local_port, remote_port);
    fx.send(&ack, source_of(key));
    state.phase = Phase::Connected;
    state.last_packet = Some(packet);
    fx.wake(state);
    log::debug!("[dispatch] {key} established");
}

fn on_connect_request(table: &mut ConnectionTable, key: Connection, packet: Packet, fx: &mut Effects) {
    let listening = Connection::listening(key.local_port, key.local_addr);
    match table.phase(&listening) {
        Some(Phase::Listen) => {}
        Some(phase) => {
            log::debug!("[dispatch] connect request ignored: {listening} is in {phase}");
            return;
        }
        None => {
            log::debug!("[dispatch] connect request for port {} with no listener", key.local_port);
            return;
        }
    }
    if table.contains(&key) {
        log::debug!("[dispatch] connect request for existing connection {key}");
        return;
    }

    let mut promoted = ConnectionState::new(key, Phase::Connect2);
    promoted.last_packet = Some(packet.clone());
    let Some(listener) = table.promote(&listening, promoted) else {
        return;
    };
    let Some(state) = table.get_mut(&key) else {
        return;
    };
    let reply = state.handshake.get_or_insert_with(OpenHandshake::new).second_way(
        key.local_port,
        key.remote_port.unwrap_or_default(),
        &packet,
    );
    fx.send(&reply, source_of(&key));
    fx.wake(state);
    fx.wake.push(listener);
    log::debug!("[dispatch] → connect reply; {listening} promoted to {key}");
}

fn on_close_request(
    table: &mut ConnectionTable,
    ports: &PortPool,
    key: &Connection,
    packet: Packet,
    fx: &mut Effects,
) {
    let Some(state) = table.get_mut(key) else {
        log::debug!("[dispatch] close request for unknown connection {key}");
        return;
    };
    if state.phase != Phase::Connected {
        log::debug!("[dispatch] close request ignored: {key} is in {}", state.phase);
        return;
    }
    state.phase = Phase::Close2;
    let mut handshake = CloseHandshake::new();
    let reply = handshake.second_way(key.local_port, key.remote_port.unwrap_or_default(), &packet);
    state.close_handshake = Some(handshake);
    state.last_packet = Some(packet);
    fx.send(&reply, source_of(key));

    if let Some(closed) = table.terminate(key, ports) {
        fx.wake(&closed);
    }
    log::debug!("[dispatch] → close reply; {key} closed");
}

fn on_close_reply(
    table: &mut ConnectionTable,
    ports: &PortPool,
    key: &Connection,
    packet: Packet,
    fx: &mut Effects,
) {
    let Some(state) = table.get_mut(key) else {
        log::debug!("[dispatch] close reply for unknown connection {key}");
        return;
    };
    if state.phase != Phase::Close1 {
        log::debug!("[dispatch] close reply ignored: {key} is in {}", state.phase);
        return;
    }
    state.phase = Phase::Close3;
    state.last_packet = Some(packet);
    if let Some(closed) = table.terminate(key, ports) {
        fx.wake(&closed);
    }
    log::debug!("[dispatch] {key} closed by peer reply");
}

fn on_ack(table: &mut ConnectionTable, key: &Connection, packet: Packet, fx: &mut Effects) {
    let Some(state) = table.get_mut(key) else {
        log::debug!("[dispatch] ack for unknown connection {key}");
        return;
    };
    match state.phase {
        Phase::Connect2 => {
            state.phase = Phase::Connected;
            state.last_packet = Some(packet);
            fx.wake(state);
            log::debug!("[dispatch] handshake ack; {key} established");
        }
        Phase::WaitAck => {
            let matched = state
                .pending_ack
                .as_ref()
                .is_some_and(|pending| pending.matches(packet.header.ack));
            if !matched {
                log::debug!("[dispatch] stale ack (bit {}) for {key}; discarded", packet.header.ack);
                return;
            }
            if let Some(pending) = state.pending_ack.take() {
                log::debug!(
                    "[dispatch] ack for seq {} on {key} after {} transmission(s)",
                    pending.seq(),
                    pending.tx_count
                );
            }
            state.phase = Phase::Connected;
            state.last_packet = Some(packet);
            fx.wake(state);
        }
        phase => {
            log::debug!("[dispatch] ack ignored: {key} is in {phase}");
        }
    }
}

fn on_data(table: &mut ConnectionTable, key: &Connection, packet: Packet, fx: &mut Effects) {
    let Some(state) = table.get_mut(key) else {
        log::debug!("[dispatch] data for unknown connection {key}");
        return;
    };
    if !state.is_active() {
        log::debug!("[dispatch] data ignored: {key} is in {}", state.phase);
        return;
    }
    match receiver::accept(&mut state.last_packet, &packet) {
        Delivery::Fresh => {
            fx.upward.extend(packet.payload.iter().map(|b| (state.conn, *b)));
        }
        Delivery::Duplicate => {
            log::debug!("[dispatch] duplicate data on {key}; re-acking only");
        }
    }
    let ack = receiver::build_ack(&state.conn, &packet);
    fx.send(&ack, source_of(key));
}

/// Address replies for `key` go to.
fn source_of(key: &Connection) -> Address {
    key.remote_addr.unwrap_or(key.local_addr)
}
