//! Listener interfaces and the snapshot model.
//!
//! Callbacks never receive live handles: they get immutable snapshots
//! captured at call time, so user code cannot observe a field mutating
//! mid-method and cannot reach back into engine state.
//!
//! Every listener invocation is isolated — a panicking listener is logged
//! and swallowed, and never affects session progress. Callbacks run
//! synchronously on the calling task; listeners that need slow work must
//! dispatch it to their own tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use enp_proto::message::{
    DemandParameters, Message, SessionParameters, SoftDisconnect, StorageParameters,
    SupplyParameters,
};
use parking_lot::RwLock;

use crate::error::{NodeError, SessionError};
use crate::peer::{PeerConnectionState, PeerDirection};
use crate::session::SessionState;

/// Immutable view of a session at a point in time.
#[derive(Debug, Clone)]
pub struct DeviceSessionSnapshot {
    /// Opaque session id
    pub id: String,
    /// Lifecycle state at capture time
    pub state: SessionState,
    /// Remote identity, present once the handshake succeeded
    pub remote: Option<SessionParameters>,
    /// Most recent supply parameters received
    pub latest_supply: Option<SupplyParameters>,
    /// Most recent demand parameters received
    pub latest_demand: Option<DemandParameters>,
    /// Most recent storage parameters received
    pub latest_storage: Option<StorageParameters>,
    /// When this snapshot was captured
    pub captured_at: DateTime<Utc>,
}

/// Immutable view of a configured peer at a point in time.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// Peer id (the table key)
    pub peer_id: String,
    /// Configured connection direction
    pub direction: PeerDirection,
    /// Dial host, when configured
    pub host: Option<String>,
    /// Dial port, when configured
    pub port: Option<u16>,
    /// The identity this peer binds to (explicit or defaulted to the id)
    pub expected_identity: String,
    /// Connection state derived from the bound session
    pub connection_state: PeerConnectionState,
    /// Id of the bound session, if any
    pub session_id: Option<String>,
    /// Most recent supply parameters from the bound session
    pub latest_supply: Option<SupplyParameters>,
    /// Most recent demand parameters from the bound session
    pub latest_demand: Option<DemandParameters>,
    /// Most recent storage parameters from the bound session
    pub latest_storage: Option<StorageParameters>,
    /// When this snapshot was captured
    pub captured_at: DateTime<Utc>,
}

/// Low-level session lifecycle callbacks.
///
/// All methods default to no-ops; implement what you need.
#[allow(unused_variables)]
pub trait ServerListener: Send + Sync {
    /// A session was accepted and registered.
    fn on_session_created(&self, session: &DeviceSessionSnapshot) {}

    /// The handshake succeeded and the session is active.
    fn on_session_active(&self, session: &DeviceSessionSnapshot) {}

    /// The first received message was not `SessionParameters`.
    fn on_session_handshake_failed(&self, session: &DeviceSessionSnapshot, reason: &str) {}

    /// The session entered the disconnecting state. `message` carries the
    /// `SoftDisconnect` that was received or sent, when available.
    fn on_session_disconnecting(
        &self,
        session: &DeviceSessionSnapshot,
        message: Option<&SoftDisconnect>,
    ) {
    }

    /// The session reached its terminal state.
    fn on_session_closed(&self, session: &DeviceSessionSnapshot) {}

    /// The session task observed an error; close follows.
    fn on_session_error(&self, session: &DeviceSessionSnapshot, error: &SessionError) {}

    /// Any message was received, in any state.
    fn on_message_received(&self, session: &DeviceSessionSnapshot, message: &Message) {}
}

/// High-level peer-focused callbacks.
///
/// All methods default to no-ops; implement what you need.
#[allow(unused_variables)]
pub trait NodeListener: Send + Sync {
    /// A session handshake bound a session to this peer.
    fn on_peer_connected(&self, peer: &PeerSnapshot) {}

    /// The peer's session closed.
    fn on_peer_disconnected(&self, peer: &PeerSnapshot) {}

    /// The peer's session received new supply/demand/storage parameters.
    fn on_peer_parameters_updated(&self, peer: &PeerSnapshot) {}

    /// A transfer started publishing for this peer.
    fn on_transfer_started(&self, peer_id: &str) {}

    /// A transfer stopped; fires exactly once per transfer.
    fn on_transfer_stopped(&self, peer_id: &str) {}

    /// A parameter message was sent to this peer.
    fn on_message_sent(&self, peer_id: &str, message: &Message) {}

    /// A node-level failure (accept, dial) occurred.
    fn on_error(&self, error: &NodeError) {}
}

struct NoopListener;

impl ServerListener for NoopListener {}
impl NodeListener for NoopListener {}

/// Shared listener registry handed to every engine.
///
/// Engines fire callbacks through the typed helpers, which clone the
/// current listener out of the lock first (so a slow listener never holds
/// it) and isolate panics.
#[derive(Clone)]
pub(crate) struct Listeners {
    server: Arc<RwLock<Arc<dyn ServerListener>>>,
    node: Arc<RwLock<Arc<dyn NodeListener>>>,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self {
            server: Arc::new(RwLock::new(Arc::new(NoopListener))),
            node: Arc::new(RwLock::new(Arc::new(NoopListener))),
        }
    }

    pub(crate) fn set_server(&self, listener: Arc<dyn ServerListener>) {
        *self.server.write() = listener;
    }

    pub(crate) fn set_node(&self, listener: Arc<dyn NodeListener>) {
        *self.node.write() = listener;
    }

    pub(crate) fn server(&self, callback: &'static str, f: impl FnOnce(&dyn ServerListener)) {
        let listener = self.server.read().clone();
        isolate(callback, || f(&*listener));
    }

    pub(crate) fn node(&self, callback: &'static str, f: impl FnOnce(&dyn NodeListener)) {
        let listener = self.node.read().clone();
        isolate(callback, || f(&*listener));
    }
}

/// Run a listener callback, swallowing panics.
fn isolate(callback: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(callback, "listener panicked; ignoring");
    }
}
