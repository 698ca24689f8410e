//! The node façade.
//!
//! Composes the session engine, the peer manager, the transfer engine,
//! and an optional TCP acceptor behind one API. Cross-engine effects
//! (binding a peer on handshake, stopping a transfer on disconnect) flow
//! through the [`SessionHooks`] implementation here, so each engine stays
//! ignorant of the others.
//!
//! Shutdown order matters: `close` cancels the transfer scope first and
//! waits for the `Stopped` callbacks (so tick tasks observe their cleanup
//! while sessions are still alive), then stops the acceptor and dials,
//! then disconnects and closes every session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use enp_proto::message::SessionParameters;
use enp_proto::registry::ParseMode;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::{NodeError, PeerError, TransferError};
use crate::listener::{Listeners, NodeListener, PeerSnapshot, ServerListener};
use crate::peer::{PeerConfig, PeerManager};
use crate::session::{DeviceSession, SessionEngine, SessionHooks};
use crate::transfer::{StartTransferResult, TransferEngine, TransferParams, DEFAULT_TICK_RATE};
use crate::transport::{self, MessageReceiver, MessageSender};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// The identity announced in handshake replies
    pub identity: SessionParameters,
    /// TCP port to accept inbound connections on; `None` disables the
    /// acceptor. Port 0 binds an ephemeral port.
    pub listen_port: Option<u16>,
    /// Parse mode for received frames and messages
    pub parse_mode: ParseMode,
}

impl NodeConfig {
    /// Config with an identity, no acceptor, lenient parsing.
    #[must_use]
    pub fn new(identity: SessionParameters) -> Self {
        Self { identity, listen_port: None, parse_mode: ParseMode::Lenient }
    }

    /// Builder-style listen port.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }
}

struct Acceptor {
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub(crate) struct NodeInner {
    sessions: Arc<SessionEngine>,
    peers: Arc<PeerManager>,
    transfers: Arc<TransferEngine>,
    listeners: Listeners,
    acceptor: Mutex<Option<Acceptor>>,
    config: NodeConfig,
}

impl SessionHooks for NodeInner {
    fn session_activated(&self, session: &Arc<DeviceSession>) {
        if let Some(peer) = self.peers.bind_session(session) {
            self.listeners.node("on_peer_connected", |l| l.on_peer_connected(&peer));
        }
    }

    fn session_parameters_updated(&self, session: &Arc<DeviceSession>) {
        if let Some(peer) = self.peers.snapshot_for_session(session) {
            self.listeners
                .node("on_peer_parameters_updated", |l| l.on_peer_parameters_updated(&peer));
        }
    }

    fn session_closed(&self, session: &Arc<DeviceSession>) {
        if let Some(peer) = self.peers.unbind_session(session) {
            // stop the tick task promptly rather than waiting for its own
            // session null-check
            self.transfers.stop_transfer(&peer.peer_id);
            self.listeners.node("on_peer_disconnected", |l| l.on_peer_disconnected(&peer));
        }
    }
}

/// An EnergyNet Protocol node: acceptor, sessions, peers, transfers.
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Build a node. Call [`Node::start`] to bind the acceptor.
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        let listeners = Listeners::new();
        let sessions =
            Arc::new(SessionEngine::new(config.identity.clone(), listeners.clone()));
        let peers =
            Arc::new(PeerManager::new(sessions.clone(), listeners.clone(), config.parse_mode));
        let transfers = Arc::new(TransferEngine::new(peers.clone(), listeners.clone()));

        let inner = Arc::new(NodeInner {
            sessions,
            peers,
            transfers,
            listeners,
            acceptor: Mutex::new(None),
            config,
        });
        let hooks: Weak<NodeInner> = Arc::downgrade(&inner);
        inner.sessions.set_hooks(hooks);
        Self { inner }
    }

    /// The identity this node announces.
    #[must_use]
    pub fn identity(&self) -> &SessionParameters {
        &self.inner.config.identity
    }

    /// Bind the inbound acceptor, when a listen port is configured.
    pub async fn start(&self) -> std::io::Result<()> {
        let Some(port) = self.inner.config.listen_port else {
            return Ok(());
        };
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening");

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::debug!(%remote, "inbound connection");
                        let (sender, receiver) =
                            transport::tcp_transport(stream, inner.config.parse_mode);
                        inner.sessions.accept(sender, receiver);
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        let error = NodeError::Accept(err);
                        inner.listeners.node("on_error", |l| l.on_error(&error));
                    },
                }
            }
        });
        *self.inner.acceptor.lock() = Some(Acceptor { task, local_addr });
        Ok(())
    }

    /// The acceptor's bound address, once [`Node::start`] has run.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.acceptor.lock().as_ref().map(|a| a.local_addr)
    }

    /// Shut the node down: transfers first, then the acceptor and dials,
    /// then every session. Idempotent.
    pub async fn close(&self) {
        self.inner.transfers.shutdown().await;
        if let Some(acceptor) = self.inner.acceptor.lock().take() {
            acceptor.task.abort();
        }
        self.inner.peers.close();
        self.inner.sessions.close().await;
        tracing::info!("node closed");
    }

    /// Configure a peer. Dialing directions get one outbound attempt.
    pub fn add_peer(&self, config: PeerConfig) -> Result<(), PeerError> {
        self.inner.peers.add_peer(config)
    }

    /// Remove a peer, closing its bound session first.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<(), PeerError> {
        self.inner.peers.remove_peer(peer_id).await
    }

    /// Snapshot map of every configured peer.
    #[must_use]
    pub fn peers(&self) -> HashMap<String, PeerSnapshot> {
        self.inner.peers.snapshots()
    }

    /// Start a publishing transfer to a connected peer.
    pub fn start_transfer(
        &self,
        peer_id: &str,
        params: TransferParams,
        tick_rate: Option<Duration>,
    ) -> StartTransferResult {
        self.inner.transfers.start_transfer(
            peer_id,
            params,
            tick_rate.unwrap_or(DEFAULT_TICK_RATE),
        )
    }

    /// Atomically replace a transfer's parameters.
    pub fn update_transfer(
        &self,
        peer_id: &str,
        params: TransferParams,
    ) -> Result<(), TransferError> {
        self.inner.transfers.update_transfer(peer_id, params)
    }

    /// Stop a transfer; no-op when none exists.
    pub fn stop_transfer(&self, peer_id: &str) {
        self.inner.transfers.stop_transfer(peer_id);
    }

    /// Install the high-level peer-focused listener.
    pub fn set_listener(&self, listener: Arc<dyn NodeListener>) {
        self.inner.listeners.set_node(listener);
    }

    /// Install the low-level session-lifecycle listener.
    pub fn set_server_listener(&self, listener: Arc<dyn ServerListener>) {
        self.inner.listeners.set_server(listener);
    }

    /// Accept a session over an externally-built transport (tests,
    /// alternative byte pipes). Equivalent to an inbound TCP accept.
    pub fn accept_transport(
        &self,
        sender: MessageSender,
        receiver: MessageReceiver,
    ) -> Arc<DeviceSession> {
        self.inner.sessions.accept(sender, receiver)
    }

    /// The session engine, for advanced composition.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionEngine> {
        &self.inner.sessions
    }
}
