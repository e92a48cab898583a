//! Integration tests for connection teardown and port reuse.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tcp_over_sim::packet::flags;
use tcp_over_sim::{CloseOutcome, Connection, Phase, SimulatorConfig};

use common::*;

#[tokio::test]
async fn active_close_frees_both_ends() {
    init_logging();
    let (sim, mut server, client) = network(SimulatorConfig::default());
    let (conn, accepted) = establish(&server, &client, 10).await;
    client.transport.send(conn, &[0x41, 0x42]).await.unwrap();
    server.read(2).await;
    let mark = sim.trace().len();

    assert_eq!(client.transport.close(conn).await, CloseOutcome::Closed);

    assert_eq!(client.transport.phase(&conn), None);
    assert!(!client.transport.is_active(&conn));
    assert_eq!(server.transport.phase(&accepted), None);
    assert!(server.transport.connections().is_empty());

    let fin: Vec<u8> = sent_by(&sim, CLIENT, mark).iter().map(|p| p.header.flags).collect();
    let reply: Vec<u8> = sent_by(&sim, SERVER, mark).iter().map(|p| p.header.flags).collect();
    assert_eq!(fin, vec![flags::FIN]);
    assert_eq!(reply, vec![flags::FIN | flags::ACK]);
}

/// The listening side may close too.
#[tokio::test]
async fn passive_side_can_initiate_close() {
    init_logging();
    let (_sim, server, client) = network(SimulatorConfig::default());
    let (conn, accepted) = establish(&server, &client, 10).await;

    assert_eq!(server.transport.close(accepted).await, CloseOutcome::Closed);
    assert!(client.transport.connections().is_empty());
    assert!(!client.transport.is_active(&conn));
}

/// A port freed by a completed close is handed out again straight away.
#[tokio::test]
async fn closed_port_is_reused() {
    init_logging();
    let (_sim, server, client) = network(SimulatorConfig::default());

    let (first, _) = establish(&server, &client, 10).await;
    assert_eq!(client.transport.close(first).await, CloseOutcome::Closed);

    let (second, _) = establish(&server, &client, 10).await;
    assert_eq!(second.local_port, first.local_port);
    assert_eq!(second, first);
}

#[tokio::test]
async fn close_without_connection_does_nothing() {
    init_logging();
    let (sim, _server, client) = network(SimulatorConfig::default());
    let ghost = Connection::new(8, 10, SERVER, CLIENT);

    assert_eq!(client.transport.close(ghost).await, CloseOutcome::NotConnected);
    assert!(sim.trace().is_empty());
}

/// Close is refused while a segment is in flight.
#[tokio::test]
async fn close_during_wait_ack_is_refused() {
    init_logging();
    let (sim, server, client) = network(SimulatorConfig::default());
    let (conn, _) = establish(&server, &client, 10).await;

    sim.drop_next_from(CLIENT, 1_000);
    let sender = {
        let transport = Arc::clone(&client.transport);
        tokio::spawn(async move { transport.send(conn, &[1]).await })
    };
    tokio::time::timeout(STEP, async {
        while client.transport.phase(&conn) != Some(Phase::WaitAck) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(client.transport.close(conn).await, CloseOutcome::NotConnected);
    assert_eq!(client.transport.phase(&conn), Some(Phase::WaitAck));
    sender.abort();
}

/// A lost close reply is not retried: the closer gives up after the
/// connection timeout and reclaims the entry and its port.
#[tokio::test]
async fn lost_close_reply_times_out() {
    init_logging();
    let (sim, server, client) = network(SimulatorConfig::default());
    let (conn, _) = establish(&server, &client, 10).await;
    let mark = sim.trace().len();

    sim.drop_next_from(SERVER, 1);
    let started = tokio::time::Instant::now();
    assert_eq!(client.transport.close(conn).await, CloseOutcome::TimedOut);
    assert!(started.elapsed() >= fast_config().connection_timeout);

    assert_eq!(sent_by(&sim, CLIENT, mark).len(), 1, "close request is sent once");
    assert!(client.transport.connections().is_empty());

    let (again, _) = establish(&server, &client, 10).await;
    assert_eq!(again.local_port, conn.local_port);
}

/// A close whose caller gives up while waiting for the reply still drops
/// the entry and frees the port.
#[tokio::test]
async fn abandoned_close_reclaims_the_entry() {
    init_logging();
    let (sim, server, client) = network(SimulatorConfig::default());
    let (conn, _) = establish(&server, &client, 10).await;

    sim.drop_next_from(SERVER, 1);
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), client.transport.close(conn)).await;
    assert!(abandoned.is_err());
    assert_eq!(client.transport.phase(&conn), None);

    let (again, _) = establish(&server, &client, 10).await;
    assert_eq!(again.local_port, conn.local_port);
}

/// Data sent after close is silently discarded.
#[tokio::test]
async fn send_after_close_is_a_no_op() {
    init_logging();
    let (sim, server, client) = network(SimulatorConfig::default());
    let (conn, _) = establish(&server, &client, 10).await;
    client.transport.close(conn).await;
    let mark = sim.trace().len();

    client.transport.send(conn, b"late").await.unwrap();
    assert_eq!(sim.trace().len(), mark);
}
