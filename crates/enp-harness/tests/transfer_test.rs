//! Transfer engine scenarios under paused virtual time.
//!
//! `start_paused` keeps the clock frozen except for explicit
//! `tokio::time::advance` calls, so tick counts are exact: the first tick
//! fires immediately, the next at one tick period, and so on.

use std::sync::Arc;
use std::time::Duration;

use enp_core::node::{Node, NodeConfig};
use enp_core::peer::{PeerConfig, PeerConnectionState};
use enp_core::transfer::{StartTransferResult, TransferParams, TransferState};
use enp_harness::{pipe, settle, Event, Recorder, RemoteDevice};
use enp_proto::message::{
    DemandParameters, Message, SessionParameters, StorageParameters, SupplyParameters,
};
use enp_proto::registry::ParseMode;
use enp_proto::values::{Current, Percentage, Voltage};
use parking_lot::Mutex;

type Log = Arc<Mutex<Vec<Message>>>;

fn supply(volts: f64) -> SupplyParameters {
    SupplyParameters { voltage: Some(Voltage(volts)), ..Default::default() }
}

fn demand(amperes: f64) -> DemandParameters {
    DemandParameters { current: Some(Current(amperes)), ..Default::default() }
}

/// Node with one bound peer; the remote side's messages land in the log.
/// Returns the sender half so tests can close the transport.
async fn connected_node(peer_id: &str) -> (Node, Arc<Recorder>, Log, enp_core::MessageSender) {
    let recorder = Recorder::shared();
    let node = Node::new(NodeConfig::new(SessionParameters::new("router-1")));
    node.set_listener(recorder.clone());
    node.add_peer(PeerConfig::inbound(peer_id)).unwrap();

    let (local, remote) = pipe(ParseMode::Lenient);
    node.accept_transport(local.tx, local.rx);
    let mut device = RemoteDevice::new(remote);
    device.handshake(peer_id).await;
    settle().await;
    assert_eq!(node.peers()[peer_id].connection_state, PeerConnectionState::Connected);

    let (tx, mut rx) = device.split();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let task_log = log.clone();
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if let Some(message) = item.into_value() {
                task_log.lock().push(message);
            }
        }
    });
    (node, recorder, log, tx)
}

fn count(log: &Log, name: &str) -> usize {
    log.lock().iter().filter(|m| m.name() == name).count()
}

#[tokio::test(start_paused = true)]
async fn tick_timing_is_exact() {
    let (node, recorder, log, _tx) = connected_node("device-1").await;

    let params = TransferParams {
        supply: Some(supply(230.0)),
        demand: Some(demand(16.0)),
        storage: None,
    };
    let result = node.start_transfer("device-1", params, Some(Duration::from_millis(100)));
    assert!(matches!(result, StartTransferResult::Success(_)));

    // first tick fires immediately
    tokio::time::advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(count(&log, "SupplyParameters"), 1);
    assert_eq!(count(&log, "DemandParameters"), 1);

    // second tick at one period
    tokio::time::advance(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(count(&log, "SupplyParameters"), 2);
    assert_eq!(count(&log, "DemandParameters"), 2);

    // stop: counts freeze and exactly one stop callback fires
    node.stop_transfer("device-1");
    settle().await;
    tokio::time::advance(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(count(&log, "SupplyParameters"), 2);
    assert_eq!(count(&log, "DemandParameters"), 2);
    assert_eq!(recorder.count(|e| matches!(e, Event::TransferStopped(_))), 1);

    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn within_a_tick_supply_precedes_demand_precedes_storage() {
    let (node, _recorder, log, _tx) = connected_node("device-1").await;

    let params = TransferParams {
        supply: Some(supply(230.0)),
        demand: Some(demand(10.0)),
        storage: Some(StorageParameters {
            soc: Some(Percentage(42.0)),
            ..Default::default()
        }),
    };
    node.start_transfer("device-1", params, Some(Duration::from_millis(100)));
    settle().await;

    let names: Vec<&'static str> = log.lock().iter().map(Message::name).collect();
    assert_eq!(names, ["SupplyParameters", "DemandParameters", "StorageParameters"]);

    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn updates_swap_atomically_between_ticks() {
    let (node, _recorder, log, _tx) = connected_node("device-1").await;

    node.start_transfer(
        "device-1",
        TransferParams { supply: Some(supply(200.0)), ..Default::default() },
        Some(Duration::from_millis(50)),
    );
    settle().await;
    assert_eq!(count(&log, "SupplyParameters"), 1);

    for (tick, volts) in [(2usize, 210.0), (3, 220.0), (4, 230.0)] {
        node.update_transfer(
            "device-1",
            TransferParams { supply: Some(supply(volts)), ..Default::default() },
        )
        .unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(count(&log, "SupplyParameters"), tick);

        // once update_transfer returned, no later tick uses older params
        let last_volts = log
            .lock()
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::SupplyParameters(p) => p.voltage,
                _ => None,
            })
            .unwrap();
        assert_eq!(last_volts, Voltage(volts));
    }

    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn peer_disconnect_stops_transfer() {
    let (node, recorder, log, mut tx) = connected_node("device-1").await;

    node.start_transfer(
        "device-1",
        TransferParams { supply: Some(supply(230.0)), ..Default::default() },
        Some(Duration::from_millis(100)),
    );
    settle().await;
    assert_eq!(count(&log, "SupplyParameters"), 1);

    // remote hangs up; the session close must force-stop the transfer
    tx.close().await;
    settle().await;

    assert_eq!(recorder.count(|e| matches!(e, Event::TransferStopped(_))), 1);
    assert_eq!(recorder.count(|e| matches!(e, Event::PeerDisconnected(_))), 1);

    let frozen = count(&log, "SupplyParameters");
    tokio::time::advance(Duration::from_millis(250)).await;
    settle().await;
    assert_eq!(count(&log, "SupplyParameters"), frozen);

    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn start_transfer_validation_order() {
    let (node, _recorder, _log, _tx) = connected_node("device-1").await;

    match node.start_transfer("ghost", TransferParams::default(), None) {
        StartTransferResult::PeerNotFound(id) => assert_eq!(id, "ghost"),
        _ => panic!("expected PeerNotFound"),
    }

    node.add_peer(PeerConfig::inbound("idle")).unwrap();
    match node.start_transfer("idle", TransferParams::default(), None) {
        StartTransferResult::PeerNotConnected(id, state) => {
            assert_eq!(id, "idle");
            assert_eq!(state, PeerConnectionState::Disconnected);
        },
        _ => panic!("expected PeerNotConnected"),
    }

    let first = node.start_transfer("device-1", TransferParams::default(), None);
    assert!(matches!(first, StartTransferResult::Success(_)));
    match node.start_transfer("device-1", TransferParams::default(), None) {
        StartTransferResult::TransferAlreadyActive(id) => assert_eq!(id, "device-1"),
        _ => panic!("expected TransferAlreadyActive"),
    }

    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn update_and_stop_without_transfer() {
    let (node, recorder, _log, _tx) = connected_node("device-1").await;

    let err = node
        .update_transfer("device-1", TransferParams::default())
        .unwrap_err();
    assert_eq!(err, enp_core::TransferError::NotActive("device-1".to_owned()));

    // stop with no transfer registered is a no-op
    node.stop_transfer("device-1");
    settle().await;
    assert_eq!(recorder.count(|e| matches!(e, Event::TransferStopped(_))), 0);

    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn node_close_stops_transfers_before_sessions() {
    let (node, recorder, _log, _tx) = connected_node("device-1").await;

    let result = node.start_transfer(
        "device-1",
        TransferParams { supply: Some(supply(230.0)), ..Default::default() },
        Some(Duration::from_millis(100)),
    );
    let transfer = match result {
        StartTransferResult::Success(transfer) => transfer,
        _ => panic!("expected Success"),
    };
    settle().await;

    node.close().await;

    assert_eq!(transfer.state(), TransferState::Stopped);
    assert_eq!(recorder.count(|e| matches!(e, Event::TransferStopped(_))), 1);

    // the stop callback preceded the peer-disconnect callback
    let events = recorder.events();
    let stop_at = events
        .iter()
        .position(|e| matches!(e, Event::TransferStopped(_)))
        .unwrap();
    let disconnect_at = events
        .iter()
        .position(|e| matches!(e, Event::PeerDisconnected(_)))
        .unwrap_or(usize::MAX);
    assert!(stop_at < disconnect_at);
}
