//! Peer table, identity binding, and table/index invariants.

use std::sync::Arc;

use enp_core::error::PeerError;
use enp_core::node::{Node, NodeConfig};
use enp_core::peer::{PeerConfig, PeerConnectionState, PeerDirection};
use enp_core::session::SessionState;
use enp_harness::{pipe, settle, Event, Recorder, RemoteDevice};
use enp_proto::message::SessionParameters;
use enp_proto::registry::ParseMode;

fn node_with_recorder() -> (Node, Arc<Recorder>) {
    let recorder = Recorder::shared();
    let node = Node::new(NodeConfig::new(SessionParameters::new("router-1")));
    node.set_listener(recorder.clone());
    node.set_server_listener(recorder.clone());
    (node, recorder)
}

async fn connect_device(node: &Node, identity: &str) -> RemoteDevice {
    let (local, remote) = pipe(ParseMode::Lenient);
    node.accept_transport(local.tx, local.rx);
    let mut device = RemoteDevice::new(remote);
    device.handshake(identity).await;
    settle().await;
    device
}

#[tokio::test]
async fn inbound_identity_binds_peer() {
    let (node, recorder) = node_with_recorder();
    node.add_peer(PeerConfig::inbound("device-1")).unwrap();
    assert_eq!(node.peers()["device-1"].connection_state, PeerConnectionState::Disconnected);

    let _device = connect_device(&node, "device-1").await;

    let snapshot = &node.peers()["device-1"];
    assert_eq!(snapshot.connection_state, PeerConnectionState::Connected);
    assert!(snapshot.session_id.is_some());
    assert_eq!(recorder.count(|e| matches!(e, Event::PeerConnected(p) if p == "device-1")), 1);

    node.close().await;
}

#[tokio::test]
async fn mismatched_identity_leaves_peer_disconnected() {
    let (node, recorder) = node_with_recorder();
    node.add_peer(PeerConfig::inbound("device-1").with_expected_identity("other")).unwrap();

    let _device = connect_device(&node, "device-1").await;

    let snapshot = &node.peers()["device-1"];
    assert_eq!(snapshot.connection_state, PeerConnectionState::Disconnected);
    assert!(snapshot.session_id.is_none());
    assert_eq!(recorder.count(|e| matches!(e, Event::PeerConnected(_))), 0);
    // the session itself stays up, just unbound
    assert_eq!(node.sessions().session_count(), 1);

    node.close().await;
}

#[tokio::test]
async fn duplicate_peer_id_is_rejected() {
    let (node, _recorder) = node_with_recorder();
    node.add_peer(PeerConfig::inbound("X")).unwrap();
    let err = node.add_peer(PeerConfig::inbound("X")).unwrap_err();
    assert_eq!(err, PeerError::DuplicatePeer("X".to_owned()));

    // first peer unaffected
    assert_eq!(node.peers().len(), 1);
    let _device = connect_device(&node, "X").await;
    assert_eq!(node.peers()["X"].connection_state, PeerConnectionState::Connected);

    node.close().await;
}

#[tokio::test]
async fn dialing_direction_requires_host() {
    let (node, _recorder) = node_with_recorder();
    let config = PeerConfig {
        peer_id: "out-1".to_owned(),
        host: None,
        port: None,
        direction: PeerDirection::Outbound,
        expected_identity: None,
    };
    assert_eq!(node.add_peer(config).unwrap_err(), PeerError::MissingHost("out-1".to_owned()));

    let bidi = PeerConfig {
        peer_id: "bidi-1".to_owned(),
        host: None,
        port: None,
        direction: PeerDirection::Bidirectional,
        expected_identity: None,
    };
    assert_eq!(node.add_peer(bidi).unwrap_err(), PeerError::MissingHost("bidi-1".to_owned()));

    node.close().await;
}

#[tokio::test]
async fn tie_break_binds_in_insertion_order() {
    let (node, _recorder) = node_with_recorder();
    node.add_peer(PeerConfig::inbound("first").with_expected_identity("shared-id")).unwrap();
    node.add_peer(PeerConfig::inbound("second").with_expected_identity("shared-id")).unwrap();

    let _one = connect_device(&node, "shared-id").await;
    assert_eq!(node.peers()["first"].connection_state, PeerConnectionState::Connected);
    assert_eq!(node.peers()["second"].connection_state, PeerConnectionState::Disconnected);

    let _two = connect_device(&node, "shared-id").await;
    assert_eq!(node.peers()["second"].connection_state, PeerConnectionState::Connected);

    node.close().await;
}

#[tokio::test]
async fn remove_peer_closes_bound_session() {
    let (node, recorder) = node_with_recorder();
    node.add_peer(PeerConfig::inbound("device-1")).unwrap();
    let _device = connect_device(&node, "device-1").await;
    assert_eq!(node.sessions().session_count(), 1);

    node.remove_peer("device-1").await.unwrap();
    settle().await;

    assert!(node.peers().is_empty());
    assert_eq!(node.sessions().session_count(), 0);
    assert_eq!(recorder.count(|e| matches!(e, Event::PeerDisconnected(p) if p == "device-1")), 1);

    assert_eq!(
        node.remove_peer("device-1").await.unwrap_err(),
        PeerError::UnknownPeer("device-1".to_owned())
    );

    node.close().await;
}

#[tokio::test]
async fn unbound_sessions_do_not_fire_peer_callbacks() {
    let (node, recorder) = node_with_recorder();
    let mut device = connect_device(&node, "stranger").await;

    assert_eq!(node.sessions().session_count(), 1);
    assert_eq!(recorder.count(|e| matches!(e, Event::PeerConnected(_))), 0);

    device.close().await;
    settle().await;
    assert_eq!(recorder.count(|e| matches!(e, Event::PeerDisconnected(_))), 0);

    node.close().await;
}

#[tokio::test]
async fn disconnecting_session_reads_as_disconnected_peer() {
    let (node, _recorder) = node_with_recorder();
    node.add_peer(PeerConfig::inbound("device-1")).unwrap();
    let mut device = connect_device(&node, "device-1").await;

    device
        .send(&enp_proto::message::Message::SoftDisconnect(
            enp_proto::message::SoftDisconnect::final_with_reason("leaving"),
        ))
        .await;
    settle().await;

    // the session drains in Disconnecting; the derived peer state already
    // reads disconnected
    assert_eq!(node.peers()["device-1"].connection_state, PeerConnectionState::Disconnected);

    node.close().await;
}

/// Table/index consistency after a whole accept/bind/close/remove cycle.
#[tokio::test]
async fn tables_stay_consistent_across_lifecycles() {
    let (node, _recorder) = node_with_recorder();
    node.add_peer(PeerConfig::inbound("a")).unwrap();
    node.add_peer(PeerConfig::inbound("b")).unwrap();

    let mut device_a = connect_device(&node, "a").await;
    let _device_b = connect_device(&node, "b").await;
    let _stranger = connect_device(&node, "nobody").await;

    assert_eq!(node.sessions().session_count(), 3);
    for (peer_id, snapshot) in node.peers() {
        if let Some(session_id) = &snapshot.session_id {
            // every linked peer's session is present in the session table
            let session = node.sessions().session(session_id).unwrap_or_else(|| {
                panic!("peer {peer_id} holds session {session_id} missing from the table")
            });
            assert_eq!(session.state(), SessionState::Active);
        }
    }

    // close one bound session: its peer must unbind, others untouched
    device_a.close().await;
    settle().await;
    assert_eq!(node.peers()["a"].session_id, None);
    assert!(node.peers()["b"].session_id.is_some());
    assert_eq!(node.sessions().session_count(), 2);

    // a fresh connection can rebind the freed peer
    let _device_a2 = connect_device(&node, "a").await;
    assert_eq!(node.peers()["a"].connection_state, PeerConnectionState::Connected);

    // removing b closes its session, leaving the stranger and a's new one
    node.remove_peer("b").await.unwrap();
    assert_eq!(node.sessions().session_count(), 2);

    node.close().await;
    assert_eq!(node.sessions().session_count(), 0);
}
