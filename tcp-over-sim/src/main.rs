//! Entry point for `tcp-over-sim`.
//!
//! Runs a server and a client transport over the in-process simulator and
//! transfers a message between them.  All protocol work is delegated to the
//! library; `main.rs` owns only process setup (logging, argument parsing).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use tcp_over_sim::{
    Address, CloseOutcome, Inbox, Simulator, SimulatorConfig, Transport, TransportConfig,
};

/// Stop-and-wait TCP over a simulated lossy network.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Probability that the network drops a PDU.
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    /// Probability that the network delivers a PDU twice.
    #[arg(long, default_value_t = 0.0)]
    duplicate: f64,
    /// Seed for the fault model.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Port the server listens on.
    #[arg(short, long, default_value_t = 10)]
    port: u16,
    /// Message the client sends.
    #[arg(short, long, default_value = "hello, stop-and-wait")]
    message: String,
    /// Connect and close timeout in milliseconds.
    #[arg(long, default_value_t = 3000)]
    connect_timeout_ms: u64,
    /// Retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 250)]
    send_timeout_ms: u64,
}

const SERVER: Address = Address(0x0A00_0001);
const CLIENT: Address = Address(0x0A00_0002);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = TransportConfig {
        connection_timeout: Duration::from_millis(cli.connect_timeout_ms),
        send_timeout: Duration::from_millis(cli.send_timeout_ms),
        ..TransportConfig::default()
    };
    let sim = Simulator::new(SimulatorConfig {
        loss_rate: cli.loss,
        duplicate_rate: cli.duplicate,
        seed: cli.seed,
        ..SimulatorConfig::default()
    });

    let (server_inbox, mut server_rx) = Inbox::channel();
    let server = Arc::new(Transport::new(sim.link(SERVER), server_inbox, config.clone())?);
    sim.attach(SERVER, &server);
    server.start();

    let (client_inbox, _client_rx) = Inbox::channel();
    let client = Arc::new(Transport::new(sim.link(CLIENT), client_inbox, config)?);
    sim.attach(CLIENT, &client);
    client.start();

    let max = client.max_packet_size() / 8;
    if cli.message.is_empty() {
        bail!("nothing to send");
    }

    let listener = {
        let server = Arc::clone(&server);
        let port = cli.port;
        tokio::spawn(async move { server.listen(port).await })
    };
    // Give the listener a moment to bind before the connect request goes out.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let conn = client
        .connect(SERVER, cli.port)
        .await
        .context("client connect")?;
    let accepted = listener.await.context("listener task")??;
    log::info!("client {conn} ↔ server {accepted}");

    let bytes = cli.message.as_bytes();
    for chunk in bytes.chunks(max.max(1)) {
        client.send(conn, chunk).await?;
    }

    let mut received = Vec::with_capacity(bytes.len());
    while received.len() < bytes.len() {
        let (_, byte) = server_rx
            .recv()
            .await
            .context("server inbox closed early")?;
        received.push(byte);
    }
    println!("server received: {}", String::from_utf8_lossy(&received));

    match client.close(conn).await {
        CloseOutcome::Closed => log::info!("connection closed"),
        outcome => log::warn!("close ended with {outcome:?}"),
    }

    let frames = sim.frames_offered();
    println!("{frames} PDUs crossed the network");

    client.shutdown();
    server.shutdown();
    Ok(())
}
