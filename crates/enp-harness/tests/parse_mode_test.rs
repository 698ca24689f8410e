//! Parse-mode behavior observed through a whole node.

use enp_core::node::{Node, NodeConfig};
use enp_core::session::SessionState;
use enp_harness::{pipe, settle, Event, Recorder, RemoteDevice};
use enp_proto::message::{Message, SessionParameters};
use enp_proto::registry::ParseMode;

fn node_in(mode: ParseMode) -> (Node, std::sync::Arc<Recorder>) {
    let recorder = Recorder::shared();
    let node = Node::new(NodeConfig {
        identity: SessionParameters::new("router-1"),
        listen_port: None,
        parse_mode: mode,
    });
    node.set_server_listener(recorder.clone());
    (node, recorder)
}

#[tokio::test]
async fn lenient_node_passes_unknown_messages_to_the_generic_callback() {
    let (node, recorder) = node_in(ParseMode::Lenient);
    let (local, remote) = pipe(ParseMode::Lenient);
    let session = node.accept_transport(local.tx, local.rx);
    let mut device = RemoteDevice::new(remote);

    device.handshake("dev-1").await;
    device
        .send(&Message::Unknown {
            type_id: 0x7777_0001,
            payload: bytes::Bytes::from_static(&[0xA0]),
        })
        .await;
    settle().await;

    // the unknown message is dispatched, not fatal
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(recorder.count(|e| matches!(e, Event::SessionErrored(_))), 0);

    node.close().await;
}

#[tokio::test]
async fn strict_node_rejects_unknown_messages() {
    let (node, recorder) = node_in(ParseMode::Strict);
    let (local, remote) = pipe(ParseMode::Lenient);
    let session = node.accept_transport(local.tx, local.rx);
    let mut device = RemoteDevice::new(remote);

    device.handshake("dev-1").await;
    settle().await;
    assert_eq!(session.state(), SessionState::Active);

    device
        .send(&Message::Unknown {
            type_id: 0x7777_0001,
            payload: bytes::Bytes::from_static(&[0xA0]),
        })
        .await;
    settle().await;

    // strict mode promotes the unknown-type warning to a failure, which
    // errors and closes the session
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(recorder.count(|e| matches!(e, Event::SessionErrored(_))), 1);

    node.close().await;
}

#[tokio::test]
async fn ping_is_a_no_op_beyond_the_generic_callback() {
    let (node, recorder) = node_in(ParseMode::Lenient);
    let (local, remote) = pipe(ParseMode::Lenient);
    let session = node.accept_transport(local.tx, local.rx);
    let mut device = RemoteDevice::new(remote);

    device.handshake("dev-1").await;
    device.send(&Message::Ping).await;
    settle().await;

    assert_eq!(session.state(), SessionState::Active);
    // no pong, no state change, no error — nothing comes back
    device.close().await;
    settle().await;
    assert_eq!(device.recv().await, None);
    assert_eq!(recorder.count(|e| matches!(e, Event::SessionErrored(_))), 0);

    node.close().await;
}

#[tokio::test]
async fn received_parameters_update_session_and_peer_snapshots() {
    use enp_core::peer::PeerConfig;
    use enp_proto::message::SupplyParameters;
    use enp_proto::values::Voltage;

    let (node, _recorder) = node_in(ParseMode::Lenient);
    let recorder = Recorder::shared();
    node.set_listener(recorder.clone());
    node.add_peer(PeerConfig::inbound("dev-1")).unwrap();

    let (local, remote) = pipe(ParseMode::Lenient);
    let session = node.accept_transport(local.tx, local.rx);
    let mut device = RemoteDevice::new(remote);
    device.handshake("dev-1").await;
    settle().await;

    device
        .send(&Message::SupplyParameters(SupplyParameters {
            voltage: Some(Voltage(241.5)),
            ..Default::default()
        }))
        .await;
    settle().await;

    assert_eq!(session.latest_supply().unwrap().voltage, Some(Voltage(241.5)));
    let peer = &node.peers()["dev-1"];
    assert_eq!(peer.latest_supply.as_ref().unwrap().voltage, Some(Voltage(241.5)));
    assert_eq!(
        recorder.count(|e| matches!(e, Event::PeerParametersUpdated(p) if p == "dev-1")),
        1
    );

    node.close().await;
}
