//! Integration tests for the three-way handshake.
//!
//! Each test builds a simulated network, runs the listening half in a
//! background task, and checks that both sides agree on the connection.

mod common;

use std::time::Duration;

use tcp_over_sim::packet::flags;
use tcp_over_sim::{
    Address, ConnectFailure, Connection, Phase, SimulatorConfig, TransportConfig,
    TransportError,
};

use common::*;

/// Both sides should reach CONNECTED after a clean handshake and hold
/// mirrored identities.
#[tokio::test]
async fn handshake_both_sides_reach_connected() {
    init_logging();
    let (sim, server, client) = network(SimulatorConfig::default());

    let (conn, accepted) = establish(&server, &client, 10).await;

    assert_eq!(conn.local_port, 8, "first free pool port");
    assert_eq!(conn.remote_port, Some(10));
    assert_eq!(conn.mirrored(), Some(accepted));
    assert_eq!(client.transport.phase(&conn), Some(Phase::Connected));
    assert_eq!(server.transport.phase(&accepted), Some(Phase::Connected));
    assert!(client.transport.is_active(&conn));
    assert!(server.transport.is_active(&accepted));

    let client_flags: Vec<u8> = sent_by(&sim, CLIENT, 0).iter().map(|p| p.header.flags).collect();
    let server_flags: Vec<u8> = sent_by(&sim, SERVER, 0).iter().map(|p| p.header.flags).collect();
    assert_eq!(client_flags, vec![flags::SYN, flags::ACK]);
    assert_eq!(server_flags, vec![flags::SYN | flags::ACK]);
}

/// The listening identity is gone once the listener has been promoted.
#[tokio::test]
async fn listener_entry_is_replaced_by_bound_connection() {
    init_logging();
    let (_sim, server, client) = network(SimulatorConfig::default());

    let (_, accepted) = establish(&server, &client, 12).await;
    assert_eq!(server.transport.connections(), vec![accepted]);
}

/// Connecting to an address nobody answers at fails after the connection
/// timeout and leaves no trace behind.
#[tokio::test]
async fn connect_to_silent_address_times_out() {
    init_logging();
    let (_sim, _server, client) = network(SimulatorConfig::default());

    let started = tokio::time::Instant::now();
    let err = tokio::time::timeout(STEP, client.transport.connect(Address(99), 10))
        .await
        .expect("connect hung")
        .unwrap_err();

    assert_eq!(
        err,
        TransportError::UnableToConnect(ConnectFailure::Timeout(Duration::from_millis(300)))
    );
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(client.transport.connections().is_empty());
}

/// A timed-out connect returns its port, so the next connect gets it again.
#[tokio::test]
async fn failed_connect_returns_its_port() {
    init_logging();
    let (_sim, server, client) = network(SimulatorConfig::default());

    let _ = client.transport.connect(Address(99), 10).await;
    let (conn, _) = establish(&server, &client, 10).await;
    assert_eq!(conn.local_port, 8);
}

/// A connect whose caller gives up before the reply must not keep its
/// entry or its port.  More abandoned connects than the pool holds still
/// leave the next connect a port.
#[tokio::test]
async fn abandoned_connects_give_back_their_ports() {
    init_logging();
    let (_sim, server, client) = network(SimulatorConfig::default());

    for _ in 0..9 {
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            client.transport.connect(Address(99), 10),
        )
        .await;
        assert!(abandoned.is_err(), "silent address must not answer");
    }
    assert!(client.transport.connections().is_empty());

    let (conn, _) = establish(&server, &client, 10).await;
    assert_eq!(conn.local_port, 8);
}

/// A listen whose caller gives up unbinds the port again.
#[tokio::test]
async fn abandoned_listen_frees_the_port() {
    init_logging();
    let (_sim, server, client) = network(SimulatorConfig::default());
    let listening = Connection::listening(10, SERVER);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), server.transport.listen(10)).await;
    assert!(abandoned.is_err());
    assert!(!server.transport.connections().contains(&listening));

    let (conn, accepted) = establish(&server, &client, 10).await;
    assert_eq!(conn.mirrored(), Some(accepted));
}

/// Lost connect request: connect reports a timeout rather than hanging.
#[tokio::test]
async fn lost_connect_request_times_out() {
    init_logging();
    let (sim, server, client) = network(SimulatorConfig::default());
    let _listener = {
        let transport = server.transport.clone();
        tokio::spawn(async move { transport.listen(10).await })
    };
    wait_for_listener(&server.transport, 10).await;

    sim.drop_next_from(CLIENT, 1);
    let err = client.transport.connect(SERVER, 10).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::UnableToConnect(ConnectFailure::Timeout(_))
    ));
}

#[tokio::test]
async fn connect_fails_when_ports_are_exhausted() {
    init_logging();
    let sim = tcp_over_sim::Simulator::new(SimulatorConfig::default());
    let server = host(&sim, SERVER, fast_config());
    let client = host(
        &sim,
        CLIENT,
        TransportConfig {
            ports: 8..=8,
            ..fast_config()
        },
    );

    establish(&server, &client, 10).await;
    let err = client.transport.connect(SERVER, 11).await.unwrap_err();
    assert_eq!(err, TransportError::UnableToConnect(ConnectFailure::PortsExhausted));
}

#[tokio::test]
async fn second_listen_on_same_port_is_rejected() {
    init_logging();
    let (_sim, server, _client) = network(SimulatorConfig::default());
    let _listener = {
        let transport = server.transport.clone();
        tokio::spawn(async move { transport.listen(10).await })
    };
    wait_for_listener(&server.transport, 10).await;

    assert_eq!(
        server.transport.listen(10).await.unwrap_err(),
        TransportError::PortInUse(10)
    );
}

#[tokio::test]
async fn ports_beyond_the_header_field_are_rejected() {
    init_logging();
    let (_sim, server, client) = network(SimulatorConfig::default());

    assert_eq!(
        server.transport.listen(16).await.unwrap_err(),
        TransportError::PortOutOfRange(16)
    );
    assert_eq!(
        client.transport.connect(SERVER, 99).await.unwrap_err(),
        TransportError::PortOutOfRange(99)
    );
}

/// Two clients on different hosts may talk to the same server port, each
/// through its own listen call.
#[tokio::test]
async fn two_clients_same_server_port() {
    init_logging();
    let (sim, server, client) = network(SimulatorConfig::default());
    let other = host(&sim, Address(3), fast_config());

    let (a, a_srv) = establish(&server, &client, 10).await;
    let (b, b_srv) = establish(&server, &other, 10).await;

    assert_eq!(a.local_port, b.local_port);
    assert_ne!(a_srv, b_srv);
    assert_eq!(server.transport.connections().len(), 2);
}
