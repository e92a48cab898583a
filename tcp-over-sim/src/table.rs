//! Identity → state map for one transport entity.
//!
//! The table is the single point of mutation for connection state.  The
//! transport wraps it in one mutex shared by every connection; nothing in
//! here locks on its own.
//!
//! Besides the live entries the table keeps *hand-off* slots: when a
//! connect request promotes a LISTEN state, that state leaves the live map
//! (its identity is no longer reachable from the wire) and waits in a
//! hand-off slot until the blocked `listen` call picks it up and follows
//! its `promoted_to` link.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::connection::Connection;
use crate::ports::PortPool;
use crate::state::{ConnectionState, Phase};

#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: HashMap<Connection, ConnectionState>,
    handoffs: HashMap<Connection, ConnectionState>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conn: &Connection) -> Option<&ConnectionState> {
        self.entries.get(conn)
    }

    pub fn get_mut(&mut self, conn: &Connection) -> Option<&mut ConnectionState> {
        self.entries.get_mut(conn)
    }

    /// Current phase; `None` means CLOSED.
    pub fn phase(&self, conn: &Connection) -> Option<Phase> {
        self.entries.get(conn).map(|s| s.phase)
    }

    pub fn contains(&self, conn: &Connection) -> bool {
        self.entries.contains_key(conn)
    }

    /// `true` if `conn` is live or parked in a hand-off slot.
    pub fn is_bound(&self, conn: &Connection) -> bool {
        self.entries.contains_key(conn) || self.handoffs.contains_key(conn)
    }

    /// Insert a new state under its own identity, returning any state it
    /// replaced.
    pub fn insert(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        self.entries.insert(state.conn, state)
    }

    pub fn remove(&mut self, conn: &Connection) -> Option<ConnectionState> {
        self.entries.remove(conn)
    }

    /// Wake-up handle of a live connection.
    pub fn wakeup(&self, conn: &Connection) -> Option<Arc<Notify>> {
        self.entries.get(conn).map(|s| Arc::clone(&s.wakeup))
    }

    /// Move the LISTEN state under `listening` into a hand-off slot and
    /// install `promoted` as its live replacement.
    ///
    /// Returns the parked LISTEN state's wake-up handle, or `None` (leaving
    /// the table untouched) when there is no LISTEN state under `listening`.
    pub fn promote(
        &mut self,
        listening: &Connection,
        mut promoted: ConnectionState,
    ) -> Option<Arc<Notify>> {
        if self.phase(listening) != Some(Phase::Listen) {
            return None;
        }
        let mut parked = self.entries.remove(listening)?;
        promoted.handshake = parked.handshake.take();
        parked.promoted_to = Some(promoted.conn);
        parked.phase = Phase::Connect2;
        let wakeup = Arc::clone(&parked.wakeup);
        self.entries.insert(promoted.conn, promoted);
        self.handoffs.insert(*listening, parked);
        Some(wakeup)
    }

    /// `true` once the LISTEN state under `listening` has been promoted.
    pub fn is_promoted(&self, listening: &Connection) -> bool {
        self.handoffs.contains_key(listening)
    }

    /// Take the promoted LISTEN state out of its hand-off slot.
    pub fn take_handoff(&mut self, listening: &Connection) -> Option<ConnectionState> {
        self.handoffs.remove(listening)
    }

    /// Move `conn` to CLOSED: remove it and return its port to `ports` if
    /// the port was drawn from the pool.  Returns the removed state.
    pub fn terminate(&mut self, conn: &Connection, ports: &PortPool) -> Option<ConnectionState> {
        let mut state = self.entries.remove(conn)?;
        state.phase = Phase::Closed;
        if state.owns_port {
            ports.release(conn.local_port);
        }
        Some(state)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identities of all live entries.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::OpenHandshake;
    use crate::network::Address;

    const LOCAL: Address = Address(1);
    const PEER: Address = Address(2);

    #[test]
    fn terminate_returns_owned_port() {
        let ports = PortPool::new(8..=9);
        let port = ports.allocate().unwrap();
        let conn = Connection::new(port, 10, PEER, LOCAL);
        let mut table = ConnectionTable::new();
        table.insert(ConnectionState::new(conn, Phase::Connected).owning_port());

        let removed = table.terminate(&conn, &ports).unwrap();
        assert_eq!(removed.phase, Phase::Closed);
        assert!(!table.contains(&conn));
        assert!(ports.is_free(port));
    }

    #[test]
    fn terminate_keeps_unowned_port_out_of_pool() {
        let ports = PortPool::new(8..=15);
        let taken = ports.allocate().unwrap();
        let conn = Connection::new(taken, 9, PEER, LOCAL);
        let mut table = ConnectionTable::new();
        table.insert(ConnectionState::new(conn, Phase::Connected));

        table.terminate(&conn, &ports);
        assert!(!ports.is_free(taken));
    }

    #[test]
    fn promote_parks_listen_state_and_moves_handshake() {
        let listening = Connection::listening(10, LOCAL);
        let mut listen_state = ConnectionState::new(listening, Phase::Listen);
        listen_state.handshake = Some(OpenHandshake::new());
        let mut table = ConnectionTable::new();
        table.insert(listen_state);

        let bound = Connection::new(10, 8, PEER, LOCAL);
        let wakeup = table.promote(&listening, ConnectionState::new(bound, Phase::Connect2));
        assert!(wakeup.is_some());
        assert!(!table.contains(&listening));
        assert!(table.is_promoted(&listening));
        assert!(table.is_bound(&listening));
        assert!(table.get(&bound).unwrap().handshake.is_some());

        let parked = table.take_handoff(&listening).unwrap();
        assert_eq!(parked.promoted_to, Some(bound));
        assert_eq!(parked.phase, Phase::Connect2);
        assert!(!table.is_bound(&listening));
    }

    #[test]
    fn promote_without_listener_is_a_no_op() {
        let listening = Connection::listening(10, LOCAL);
        let bound = Connection::new(10, 8, PEER, LOCAL);
        let mut table = ConnectionTable::new();
        assert!(table
            .promote(&listening, ConnectionState::new(bound, Phase::Connect2))
            .is_none());
        assert!(table.is_empty());
    }
}
