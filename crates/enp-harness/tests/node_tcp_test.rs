//! End-to-end node tests over real localhost TCP.

use std::time::Duration;

use enp_core::node::{Node, NodeConfig};
use enp_core::peer::{PeerConfig, PeerConnectionState};
use enp_core::transport::tcp_transport;
use enp_harness::{Event, Recorder};
use enp_proto::message::{Message, SessionParameters};
use enp_proto::registry::ParseMode;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_state(node: &Node, peer_id: &str, state: PeerConnectionState) {
    timeout(WAIT, async {
        loop {
            if node.peers().get(peer_id).map(|p| p.connection_state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("peer {peer_id} never reached {state:?}"));
}

#[tokio::test]
async fn inbound_tcp_session_binds_peer() {
    let recorder = Recorder::shared();
    let node = Node::new(
        NodeConfig::new(SessionParameters::new("router-1").with_device_type("router"))
            .with_listen_port(0),
    );
    node.set_listener(recorder.clone());
    node.add_peer(PeerConfig::inbound("dev-9")).unwrap();
    node.start().await.unwrap();
    let addr = node.local_addr().unwrap();

    let stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    let (mut tx, mut rx) = tcp_transport(stream, ParseMode::Lenient);
    tx.send(&Message::SessionParameters(
        SessionParameters::new("dev-9").with_device_type("charger"),
    ))
    .await
    .unwrap();

    let reply = timeout(WAIT, rx.recv()).await.unwrap().unwrap().into_value().unwrap();
    match reply {
        Message::SessionParameters(params) => assert_eq!(params.identity, "router-1"),
        other => panic!("expected SessionParameters, got {other:?}"),
    }

    wait_for_state(&node, "dev-9", PeerConnectionState::Connected).await;
    assert_eq!(recorder.count(|e| matches!(e, Event::PeerConnected(p) if p == "dev-9")), 1);

    node.close().await;

    // the node announces the shutdown before EOF
    let next = timeout(WAIT, rx.recv()).await.unwrap().unwrap().into_value().unwrap();
    assert!(matches!(next, Message::SoftDisconnect(_)));
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn outbound_dial_prebinds_peer() {
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = remote.local_addr().unwrap().port();

    let recorder = Recorder::shared();
    let node = Node::new(NodeConfig::new(SessionParameters::new("router-1")));
    node.set_listener(recorder.clone());
    node.add_peer(PeerConfig::outbound("remote-1", "127.0.0.1", port)).unwrap();

    // the test plays the dialed endpoint
    let (stream, _) = timeout(WAIT, remote.accept()).await.unwrap().unwrap();
    let (mut tx, mut rx) = tcp_transport(stream, ParseMode::Lenient);

    // pre-binding: the peer leaves Disconnected before any handshake
    wait_for_state(&node, "remote-1", PeerConnectionState::Connecting).await;

    tx.send(&Message::SessionParameters(SessionParameters::new("remote-1"))).await.unwrap();
    let reply = timeout(WAIT, rx.recv()).await.unwrap().unwrap().into_value().unwrap();
    assert!(matches!(reply, Message::SessionParameters(p) if p.identity == "router-1"));

    wait_for_state(&node, "remote-1", PeerConnectionState::Connected).await;
    assert_eq!(recorder.count(|e| matches!(e, Event::PeerConnected(p) if p == "remote-1")), 1);

    node.close().await;
}

#[tokio::test]
async fn failed_dial_leaves_peer_disconnected() {
    // grab a port nobody is listening on
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let recorder = Recorder::shared();
    let node = Node::new(NodeConfig::new(SessionParameters::new("router-1")));
    node.set_listener(recorder.clone());
    node.add_peer(PeerConfig::outbound("gone", "127.0.0.1", port)).unwrap();

    timeout(WAIT, async {
        while recorder.count(|e| matches!(e, Event::NodeErrored(_))) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dial failure reported");

    assert_eq!(
        node.peers()["gone"].connection_state,
        PeerConnectionState::Disconnected
    );
    // no retry at this layer
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(|e| matches!(e, Event::NodeErrored(_))), 1);

    node.close().await;
}
