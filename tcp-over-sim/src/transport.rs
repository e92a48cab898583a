//! The transport entity: public face of the protocol.
//!
//! A [`Transport`] owns the connection table, the port pool and the inbound
//! dispatcher task.  Application calls (`connect`, `listen`, `close`,
//! `send`) run on the caller's task and block it on the per-connection
//! wake-up handle until the dispatcher moves the connection into the phase
//! they are waiting for.
//!
//! # Waiting
//!
//! Every wait follows the same shape: take a `Notified` future from the
//! connection's [`Notify`], *then* check the condition under the table lock,
//! and only if it does not hold yet, await the future.  Creating the future
//! first means a transition that lands between the check and the await
//! still wakes the waiter.  Any waiter may be woken by a transition it does
//! not care about; it simply re-checks.
//!
//! # Lifecycle
//!
//! ```ignore
//! let transport = Arc::new(Transport::new(network, inbox, TransportConfig::default())?);
//! transport.start();
//! let conn = transport.connect(Address(1), 10).await?;
//! transport.send(conn, b"AB").await?;
//! transport.close(conn).await;
//! transport.shutdown();
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bits::BitBuffer;
use crate::config::{ConfigError, TransportConfig};
use crate::connection::Connection;
use crate::dispatcher::{self, Inbound};
use crate::handshake::{CloseHandshake, OpenHandshake};
use crate::network::{Address, Network, Upper};
use crate::packet::{HEADER_BITS, MAX_PORT};
use crate::ports::PortPool;
use crate::sender::{self, PendingAck};
use crate::state::{ConnectionState, Phase};
use crate::table::ConnectionTable;

/// Smallest payload unit, in bits.
pub const MIN_PACKET_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by [`Transport`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport entity is not running (state: {0})")]
    NotRunning(EntityState),
    #[error("unable to connect: {0}")]
    UnableToConnect(#[from] ConnectFailure),
    #[error("local port {0} is already bound")]
    PortInUse(u16),
    #[error("port {0} does not fit in the header (max {max})", max = MAX_PORT)]
    PortOutOfRange(u16),
    #[error("unknown connection {0}")]
    UnknownConnection(Connection),
    #[error("connection {0} went away while waiting")]
    ConnectionLost(Connection),
    #[error("payload of {len} bytes exceeds the {max}-byte segment limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Why an active open failed.  The caller may retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error("local port range exhausted")]
    PortsExhausted,
    #[error("connection already exists")]
    AlreadyExists,
    #[error("no connect reply within {0:?}")]
    Timeout(Duration),
}

/// How a call to [`Transport::close`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The peer's close reply arrived.
    Closed,
    /// No close reply within the connection timeout; the entry was dropped.
    TimedOut,
    /// The connection was not in CONNECTED; nothing was sent.
    NotConnected,
}

/// Lifecycle of the entity as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the application-facing handle and the dispatcher.
pub(crate) struct Shared {
    pub config: TransportConfig,
    pub network: Arc<dyn Network>,
    pub upper: Arc<dyn Upper>,
    pub ports: PortPool,
    table: Mutex<ConnectionTable>,
}

impl Shared {
    /// Lock the connection table.  The guard must not be held across an
    /// `.await`.
    pub fn table(&self) -> MutexGuard<'_, ConnectionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A stop-and-wait transport entity bound to one network interface.
pub struct Transport {
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    entity: Mutex<EntityState>,
}

impl Transport {
    /// Build an idle entity.  Call [`start`](Self::start) before feeding it
    /// PDUs.
    pub fn new(
        network: Arc<dyn Network>,
        upper: Arc<dyn Upper>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let shared = Shared {
            ports: PortPool::new(config.ports.clone()),
            config,
            network,
            upper,
            table: Mutex::new(ConnectionTable::new()),
        };
        Ok(Self {
            shared: Arc::new(shared),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            dispatcher: Mutex::new(None),
            entity: Mutex::new(EntityState::Idle),
        })
    }

    /// Spawn the dispatcher task.  Must be called from within a tokio
    /// runtime.  Calling it again is a no-op.
    pub fn start(&self) {
        let mut entity = lock(&self.entity);
        if *entity != EntityState::Idle {
            log::warn!("[tcp] start called in state {entity}; ignoring");
            return;
        }
        let Some(rx) = lock(&self.inbound_rx).take() else {
            return;
        };
        log::info!("[tcp] starting transport at {}", self.local_address());
        let handle = tokio::spawn(dispatcher::run(Arc::clone(&self.shared), rx));
        *lock(&self.dispatcher) = Some(handle);
        *entity = EntityState::Running;
    }

    /// Stop the dispatcher.  Connection state is left as it is; PDUs still
    /// queued are discarded and later ones are refused.
    pub fn shutdown(&self) {
        let mut entity = lock(&self.entity);
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        if *entity != EntityState::Stopped {
            log::info!("[tcp] transport at {} stopped", self.local_address());
        }
        *entity = EntityState::Stopped;
    }

    pub fn entity_state(&self) -> EntityState {
        *lock(&self.entity)
    }

    pub fn local_address(&self) -> Address {
        self.shared.network.local_address()
    }

    // -----------------------------------------------------------------------
    // Inbound boundary
    // -----------------------------------------------------------------------

    /// Queue a PDU from the network layer for dispatch.
    ///
    /// Waits for room when the inbound queue is full.  Fails with
    /// [`TransportError::NotRunning`] unless the entity is running.
    pub async fn received(&self, pdu: BitBuffer, source: Address) -> Result<(), TransportError> {
        let state = self.entity_state();
        if state != EntityState::Running {
            log::warn!("[tcp] PDU from {source} received in state {state}");
            return Err(TransportError::NotRunning(state));
        }
        log::trace!("[tcp] queueing {} bits from {source}", pdu.len());
        self.inbound_tx
            .send(Inbound { pdu, source })
            .await
            .map_err(|_| TransportError::NotRunning(EntityState::Stopped))
    }

    // -----------------------------------------------------------------------
    // Connection management
    // -----------------------------------------------------------------------

    /// Active open towards `remote_port` at `dest`.
    ///
    /// Draws a local port from the pool, sends a connect request and waits
    /// up to the connection timeout for the reply.  On failure, or when the
    /// future is dropped before the reply, the entry is removed and the port
    /// returned.
    pub async fn connect(&self, dest: Address, remote_port: u16) -> Result<Connection, TransportError> {
        self.ensure_running()?;
        check_port(remote_port)?;
        let local_port = self
            .shared
            .ports
            .allocate()
            .ok_or(ConnectFailure::PortsExhausted)?;
        let conn = Connection::new(local_port, remote_port, dest, self.local_address());

        let (wakeup, syn) = {
            let mut table = self.shared.table();
            if table.contains(&conn) {
                self.shared.ports.release(local_port);
                return Err(ConnectFailure::AlreadyExists.into());
            }
            let mut state = ConnectionState::new(conn, Phase::Connect1).owning_port();
            let mut handshake = OpenHandshake::new();
            let syn = handshake.first_way(local_port, remote_port);
            state.handshake = Some(handshake);
            let wakeup = Arc::clone(&state.wakeup);
            table.insert(state);
            (wakeup, syn)
        };

        let pending = Reclaim::new(&self.shared, conn, Phase::Connect1);

        log::debug!("[tcp] → connect request {conn}");
        self.shared.network.send(syn.encode(), dest);

        let timeout = self.shared.config.connection_timeout;
        let deadline = Instant::now() + timeout;
        let connected = self
            .wait_until(&wakeup, Some(deadline), |t| t.phase(&conn) == Some(Phase::Connected))
            .await;
        if connected {
            pending.disarm();
            log::info!("[tcp] connected {conn}");
            return Ok(conn);
        }

        drop(pending);
        log::warn!("[tcp] connect to {dest}:{remote_port} timed out after {timeout:?}");
        Err(ConnectFailure::Timeout(timeout).into())
    }

    /// Passive open on `local_port`.
    ///
    /// Blocks, without timeout, until a peer's connect request arrives and
    /// the handshake completes, then returns the bound connection.  The port
    /// is not drawn from the pool.  Dropping the future unbinds the port and
    /// abandons a half-open connection.
    pub async fn listen(&self, local_port: u16) -> Result<Connection, TransportError> {
        self.ensure_running()?;
        check_port(local_port)?;
        let listening = Connection::listening(local_port, self.local_address());

        let wakeup = {
            let mut table = self.shared.table();
            if table.is_bound(&listening) {
                return Err(TransportError::PortInUse(local_port));
            }
            let mut state = ConnectionState::new(listening, Phase::Listen);
            state.handshake = Some(OpenHandshake::new());
            let wakeup = Arc::clone(&state.wakeup);
            table.insert(state);
            wakeup
        };
        let mut pending = Unlisten::new(&self.shared, listening);
        log::debug!("[tcp] listening on port {local_port}");

        self.wait_until(&wakeup, None, |t| t.is_promoted(&listening)).await;

        let (conn, wakeup) = {
            let mut table = self.shared.table();
            let promoted = table
                .take_handoff(&listening)
                .and_then(|parked| parked.promoted_to);
            let Some(conn) = promoted else {
                return Err(TransportError::ConnectionLost(listening));
            };
            pending.accepted = Some(conn);
            let Some(wakeup) = table.wakeup(&conn) else {
                return Err(TransportError::ConnectionLost(conn));
            };
            (conn, wakeup)
        };

        self.wait_until(&wakeup, None, |t| t.phase(&conn) != Some(Phase::Connect2))
            .await;

        if self.shared.table().contains(&conn) {
            pending.disarm();
            log::info!("[tcp] accepted {conn}");
            Ok(conn)
        } else {
            Err(TransportError::ConnectionLost(conn))
        }
    }

    /// Active close.
    ///
    /// Does nothing unless `conn` is CONNECTED.  Sends one close request and
    /// waits up to the connection timeout for the reply; the request is not
    /// repeated.  If no reply arrives, or the future is dropped while
    /// waiting, the entry is dropped anyway.
    pub async fn close(&self, conn: Connection) -> CloseOutcome {
        let (wakeup, fin, dest) = {
            let mut table = self.shared.table();
            let Some(state) = table.get_mut(&conn) else {
                return CloseOutcome::NotConnected;
            };
            if state.phase != Phase::Connected {
                log::debug!("[tcp] close ignored: {conn} is in {}", state.phase);
                return CloseOutcome::NotConnected;
            }
            state.phase = Phase::Close1;
            let mut handshake = CloseHandshake::new();
            let fin = handshake.first_way(conn.local_port, conn.remote_port.unwrap_or_default());
            state.close_handshake = Some(handshake);
            (Arc::clone(&state.wakeup), fin, conn.remote_addr.unwrap_or(conn.local_addr))
        };

        let pending = Reclaim::new(&self.shared, conn, Phase::Close1);

        log::debug!("[tcp] → close request {conn}");
        self.shared.network.send(fin.encode(), dest);

        let timeout = self.shared.config.connection_timeout;
        let deadline = Instant::now() + timeout;
        if self
            .wait_until(&wakeup, Some(deadline), |t| !t.contains(&conn))
            .await
        {
            pending.disarm();
            log::info!("[tcp] closed {conn}");
            return CloseOutcome::Closed;
        }

        drop(pending);
        log::warn!("[tcp] no close reply for {conn} within {timeout:?}; dropping it");
        CloseOutcome::TimedOut
    }

    /// `true` while `conn` is CONNECTED or WAIT_ACK.
    pub fn is_active(&self, conn: &Connection) -> bool {
        self.phase(conn).is_some_and(Phase::is_active)
    }

    /// Current phase of `conn`; `None` once it is closed.
    pub fn phase(&self, conn: &Connection) -> Option<Phase> {
        self.shared.table().phase(conn)
    }

    /// Identities of every live connection.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.table().connections().copied().collect()
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Queue one byte on `conn` for the next [`send`](Self::send).
    pub fn put(&self, conn: &Connection, byte: u8) -> Result<(), TransportError> {
        let mut table = self.shared.table();
        let state = table
            .get_mut(conn)
            .ok_or(TransportError::UnknownConnection(*conn))?;
        state.outbound.push_back(byte);
        Ok(())
    }

    /// Send the bytes queued by [`put`](Self::put), if any.
    pub async fn flush(&self, conn: Connection) -> Result<(), TransportError> {
        self.send(conn, &[]).await
    }

    /// Send one segment carrying the queued bytes followed by `bytes`, and
    /// wait until the peer acknowledges it.
    ///
    /// Does nothing if `conn` is not active or there is nothing to send.
    /// Waits for any segment already in flight on `conn` to be acknowledged
    /// first.  Retransmits every `send_timeout` with no limit; drop the
    /// future to give up.
    pub async fn send(&self, conn: Connection, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(wakeup) = self.shared.table().wakeup(&conn) else {
            log::debug!("[send] {conn} is closed; nothing sent");
            return Ok(());
        };
        if !self.is_active(&conn) {
            log::debug!("[send] {conn} is not active; nothing sent");
            return Ok(());
        }
        let max = self.max_packet_size() / 8;

        // Claim the connection: wait for CONNECTED, then flip to WAIT_ACK.
        let (number, pdu, dest) = loop {
            let notified = wakeup.notified();
            let claimed = {
                let mut table = self.shared.table();
                match table.get_mut(&conn) {
                    None => return Err(TransportError::ConnectionLost(conn)),
                    Some(state) if state.phase == Phase::Connected => {
                        let len = state.outbound.len() + bytes.len();
                        if len == 0 {
                            return Ok(());
                        }
                        if len > max {
                            return Err(TransportError::PayloadTooLarge { len, max });
                        }
                        let mut payload: Vec<u8> = state.outbound.drain(..).collect();
                        payload.extend_from_slice(bytes);
                        state.seq_bit = sender::next_seq(state.seq_bit);
                        let packet = sender::build_data_packet(&conn, state.seq_bit, payload);
                        state.segments += 1;
                        let pending = PendingAck::new(state.segments, packet);
                        let claim = (pending.number, pending.pdu.clone());
                        state.pending_ack = Some(pending);
                        state.phase = Phase::WaitAck;
                        Some(claim)
                    }
                    Some(state) if state.phase == Phase::WaitAck => None,
                    Some(state) => {
                        log::debug!("[send] {conn} left the active phases ({}); nothing sent", state.phase);
                        return Ok(());
                    }
                }
            };
            match claimed {
                Some((number, pdu)) => {
                    break (number, pdu, conn.remote_addr.unwrap_or(conn.local_addr))
                }
                None => notified.await,
            }
        };

        let send_timeout = self.shared.config.send_timeout;
        loop {
            self.shared.network.send(pdu.clone(), dest);
            log::debug!("[send] → data on {conn}; waiting for ack");

            // Settled once the slot no longer holds this segment, which
            // includes the next sender having claimed it already.
            let deadline = Instant::now() + send_timeout;
            let settled = self
                .wait_until(&wakeup, Some(deadline), |t| in_flight(t, &conn) != Some(number))
                .await;
            if settled {
                return if self.shared.table().contains(&conn) {
                    Ok(())
                } else {
                    Err(TransportError::ConnectionLost(conn))
                };
            }

            {
                let mut table = self.shared.table();
                let pending = table.get_mut(&conn).and_then(|s| s.pending_ack.as_mut());
                if let Some(pending) = pending.filter(|p| p.number == number) {
                    pending.on_retransmit();
                    log::debug!(
                        "[send] timeout on {conn}; retransmitting (attempt {})",
                        pending.tx_count
                    );
                }
            }
        }
    }

    /// Largest payload a segment can carry, in bits.
    pub fn max_packet_size(&self) -> usize {
        self.shared.network.max_segment_size().saturating_sub(HEADER_BITS)
    }

    /// Smallest payload unit, in bits.
    pub fn min_packet_size(&self) -> usize {
        MIN_PACKET_SIZE
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_running(&self) -> Result<(), TransportError> {
        match self.entity_state() {
            EntityState::Running => Ok(()),
            state => Err(TransportError::NotRunning(state)),
        }
    }

    /// Wait until `done` holds for the table, re-checking after every
    /// wake-up on `wakeup`.  Returns `false` if `deadline` passes first.
    async fn wait_until<F>(&self, wakeup: &Notify, deadline: Option<Instant>, mut done: F) -> bool
    where
        F: FnMut(&ConnectionTable) -> bool,
    {
        loop {
            let notified = wakeup.notified();
            if done(&*self.shared.table()) {
                return true;
            }
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return done(&*self.shared.table());
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("local_address", &self.local_address())
            .field("state", &self.entity_state())
            .field("connections", &self.shared.table().len())
            .finish()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Terminates `conn` if it is still in `phase` when dropped armed.
///
/// Held by `connect` and `close` while they wait, so a dropped future does
/// not strand the entry (and its pool port) in a transient phase.
struct Reclaim<'a> {
    shared: &'a Shared,
    conn: Connection,
    phase: Phase,
    armed: bool,
}

impl<'a> Reclaim<'a> {
    fn new(shared: &'a Shared, conn: Connection, phase: Phase) -> Self {
        Self {
            shared,
            conn,
            phase,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reclaim<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut table = self.shared.table();
        if table.phase(&self.conn) == Some(self.phase) {
            log::debug!("[tcp] reclaiming {} left in {}", self.conn, self.phase);
            table.terminate(&self.conn, &self.shared.ports);
        }
    }
}

/// Undoes a `listen` that did not return a connection.
///
/// Removes the LISTEN entry or its hand-off slot, and terminates the
/// connection it was promoted to while that is still half-open.
struct Unlisten<'a> {
    shared: &'a Shared,
    listening: Connection,
    accepted: Option<Connection>,
    armed: bool,
}

impl<'a> Unlisten<'a> {
    fn new(shared: &'a Shared, listening: Connection) -> Self {
        Self {
            shared,
            listening,
            accepted: None,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Unlisten<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut table = self.shared.table();
        if table.phase(&self.listening) == Some(Phase::Listen) {
            table.remove(&self.listening);
            log::debug!("[tcp] stopped listening on port {}", self.listening.local_port);
        }
        let parked = table
            .take_handoff(&self.listening)
            .and_then(|state| state.promoted_to);
        if let Some(conn) = self.accepted.or(parked) {
            if table.phase(&conn) == Some(Phase::Connect2) {
                log::debug!("[tcp] abandoning half-open {conn}");
                table.terminate(&conn, &self.shared.ports);
            }
        }
    }
}

/// Number of the segment waiting for its ACK on `conn`, if any.
fn in_flight(table: &ConnectionTable, conn: &Connection) -> Option<u64> {
    table
        .get(conn)
        .filter(|state| state.phase == Phase::WaitAck)
        .and_then(|state| state.pending_ack.as_ref())
        .map(|pending| pending.number)
}

fn check_port(port: u16) -> Result<(), TransportError> {
    if port > MAX_PORT {
        return Err(TransportError::PortOutOfRange(port));
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
