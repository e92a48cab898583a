//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use tcp_over_sim::packet::flags;
use tcp_over_sim::{
    Address, Connection, Frame, Inbox, Packet, Simulator, SimulatorConfig, Transport,
    TransportConfig,
};

pub const SERVER: Address = Address(1);
pub const CLIENT: Address = Address(2);

/// Upper bound on any single test step.
pub const STEP: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        connection_timeout: Duration::from_millis(300),
        send_timeout: Duration::from_millis(50),
        ..TransportConfig::default()
    }
}

pub struct Host {
    pub address: Address,
    pub transport: Arc<Transport>,
    pub inbox: UnboundedReceiver<(Connection, u8)>,
}

impl Host {
    /// Read exactly `n` delivered bytes.
    pub async fn read(&mut self, n: usize) -> Vec<(Connection, u8)> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let item = tokio::time::timeout(STEP, self.inbox.recv())
                .await
                .expect("timed out waiting for delivered bytes")
                .expect("inbox closed");
            out.push(item);
        }
        out
    }
}

/// A running transport at `address`, attached to `sim`.
pub fn host(sim: &Arc<Simulator>, address: Address, config: TransportConfig) -> Host {
    let (inbox, rx) = Inbox::channel();
    let transport = Arc::new(Transport::new(sim.link(address), inbox, config).unwrap());
    sim.attach(address, &transport);
    transport.start();
    Host {
        address,
        transport,
        inbox: rx,
    }
}

pub fn network(config: SimulatorConfig) -> (Arc<Simulator>, Host, Host) {
    let sim = Simulator::new(config);
    let server = host(&sim, SERVER, fast_config());
    let client = host(&sim, CLIENT, fast_config());
    (sim, server, client)
}

/// Wait until `transport` has a LISTEN entry on `port`.
pub async fn wait_for_listener(transport: &Transport, port: u16) {
    let listening = Connection::listening(port, transport.local_address());
    tokio::time::timeout(STEP, async {
        while !transport.connections().contains(&listening) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("listener never appeared");
}

/// Open a connection from `client` to `server` on `port`.  Returns the
/// client's and the server's view of it.
pub async fn establish(server: &Host, client: &Host, port: u16) -> (Connection, Connection) {
    let listener = {
        let transport = Arc::clone(&server.transport);
        tokio::spawn(async move { transport.listen(port).await })
    };
    wait_for_listener(&server.transport, port).await;

    let conn = tokio::time::timeout(STEP, client.transport.connect(server.address, port))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let accepted = tokio::time::timeout(STEP, listener)
        .await
        .expect("listen timed out")
        .expect("listener panicked")
        .expect("listen failed");
    (conn, accepted)
}

/// Frames sent by `source`, decoded, starting at trace index `from`.
pub fn sent_by(sim: &Simulator, source: Address, from: usize) -> Vec<Packet> {
    sim.trace()
        .into_iter()
        .skip(from)
        .filter(|f: &Frame| f.source == source)
        .map(|f| Packet::decode(&f.pdu).unwrap())
        .collect()
}

pub fn is_data(p: &Packet) -> bool {
    p.header.flags == 0
}

pub fn is_bare_ack(p: &Packet) -> bool {
    p.header.flags == flags::ACK
}
