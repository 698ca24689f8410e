//! Scenario harness for EnergyNet Protocol nodes.
//!
//! Provides what the integration tests need and production code does not:
//! in-memory duplex transports running the real frame codec, a driver for
//! playing the remote endpoint by hand, and recording listeners that
//! capture every callback for ordering assertions.

#![forbid(unsafe_code)]

use std::sync::Arc;

use enp_core::error::NodeError;
use enp_core::listener::{DeviceSessionSnapshot, NodeListener, PeerSnapshot, ServerListener};
use enp_core::transport::{split_transport, MessageReceiver, MessageSender};
use enp_core::SessionError;
use enp_proto::message::{Message, SessionParameters, SoftDisconnect};
use enp_proto::registry::ParseMode;
use parking_lot::Mutex;

/// One side of an in-memory connection.
pub struct Endpoint {
    /// Sending half
    pub tx: MessageSender,
    /// Receiving half
    pub rx: MessageReceiver,
}

/// A linked pair of message transports over an in-memory duplex pipe,
/// running the real frame codec on both sides.
#[must_use]
pub fn pipe(mode: ParseMode) -> (Endpoint, Endpoint) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (ltx, lrx) = split_transport(left, mode);
    let (rtx, rrx) = split_transport(right, mode);
    (Endpoint { tx: ltx, rx: lrx }, Endpoint { tx: rtx, rx: rrx })
}

/// Drives the remote side of a session by hand.
pub struct RemoteDevice {
    endpoint: Endpoint,
}

impl RemoteDevice {
    /// Wrap the remote end of a [`pipe`].
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Send one message.
    pub async fn send(&mut self, message: &Message) {
        self.endpoint.tx.send(message).await.expect("harness send failed");
    }

    /// Open the handshake with an identity and return the node's reply.
    pub async fn handshake(&mut self, identity: &str) -> SessionParameters {
        self.send(&Message::SessionParameters(SessionParameters::new(identity))).await;
        match self.recv().await {
            Some(Message::SessionParameters(reply)) => reply,
            other => panic!("expected SessionParameters reply, got {other:?}"),
        }
    }

    /// Next successfully parsed message, or `None` on EOF.
    pub async fn recv(&mut self) -> Option<Message> {
        let item = self.endpoint.rx.recv().await?;
        Some(item.into_value().expect("harness received a parse failure"))
    }

    /// Close the remote transport's write side (the node observes EOF).
    pub async fn close(&mut self) {
        self.endpoint.tx.close().await;
    }

    /// Take the raw halves, e.g. to spawn a collector task.
    #[must_use]
    pub fn split(self) -> (MessageSender, MessageReceiver) {
        (self.endpoint.tx, self.endpoint.rx)
    }
}

/// Yield to the runtime until spawned tasks have had a chance to run.
///
/// Only yields — never sleeps — so it composes with paused virtual time.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Every observable callback, flattened for ordering assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `ServerListener::on_session_created`
    SessionCreated(String),
    /// `ServerListener::on_session_active`
    SessionActive(String),
    /// `ServerListener::on_session_handshake_failed` with its reason
    HandshakeFailed(String),
    /// `ServerListener::on_session_disconnecting`
    SessionDisconnecting(String),
    /// `ServerListener::on_session_closed`
    SessionClosed(String),
    /// `ServerListener::on_session_error` with the error text
    SessionErrored(String),
    /// `NodeListener::on_peer_connected`
    PeerConnected(String),
    /// `NodeListener::on_peer_disconnected`
    PeerDisconnected(String),
    /// `NodeListener::on_peer_parameters_updated`
    PeerParametersUpdated(String),
    /// `NodeListener::on_transfer_started`
    TransferStarted(String),
    /// `NodeListener::on_transfer_stopped`
    TransferStopped(String),
    /// `NodeListener::on_message_sent` with the message name
    MessageSent(String, &'static str),
    /// `NodeListener::on_error` with the error text
    NodeErrored(String),
}

/// Records every callback from both listener interfaces.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    /// Fresh recorder behind an `Arc`, ready to install on a node.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    /// Everything recorded so far, in callback order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Recorded events matching a predicate.
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Count of `MessageSent` events with the given message name.
    #[must_use]
    pub fn sent_count(&self, name: &str) -> usize {
        self.count(|e| matches!(e, Event::MessageSent(_, n) if *n == name))
    }
}

impl ServerListener for Recorder {
    fn on_session_created(&self, session: &DeviceSessionSnapshot) {
        self.push(Event::SessionCreated(session.id.clone()));
    }

    fn on_session_active(&self, session: &DeviceSessionSnapshot) {
        self.push(Event::SessionActive(session.id.clone()));
    }

    fn on_session_handshake_failed(&self, _session: &DeviceSessionSnapshot, reason: &str) {
        self.push(Event::HandshakeFailed(reason.to_owned()));
    }

    fn on_session_disconnecting(
        &self,
        session: &DeviceSessionSnapshot,
        _message: Option<&SoftDisconnect>,
    ) {
        self.push(Event::SessionDisconnecting(session.id.clone()));
    }

    fn on_session_closed(&self, session: &DeviceSessionSnapshot) {
        self.push(Event::SessionClosed(session.id.clone()));
    }

    fn on_session_error(&self, session: &DeviceSessionSnapshot, error: &SessionError) {
        self.push(Event::SessionErrored(format!("{}: {error}", session.id)));
    }
}

impl NodeListener for Recorder {
    fn on_peer_connected(&self, peer: &PeerSnapshot) {
        self.push(Event::PeerConnected(peer.peer_id.clone()));
    }

    fn on_peer_disconnected(&self, peer: &PeerSnapshot) {
        self.push(Event::PeerDisconnected(peer.peer_id.clone()));
    }

    fn on_peer_parameters_updated(&self, peer: &PeerSnapshot) {
        self.push(Event::PeerParametersUpdated(peer.peer_id.clone()));
    }

    fn on_transfer_started(&self, peer_id: &str) {
        self.push(Event::TransferStarted(peer_id.to_owned()));
    }

    fn on_transfer_stopped(&self, peer_id: &str) {
        self.push(Event::TransferStopped(peer_id.to_owned()));
    }

    fn on_message_sent(&self, peer_id: &str, message: &Message) {
        self.push(Event::MessageSent(peer_id.to_owned(), message.name()));
    }

    fn on_error(&self, error: &NodeError) {
        self.push(Event::NodeErrored(error.to_string()));
    }
}
