//! Configured peers and identity-based session binding.
//!
//! A peer is a locally-configured identity that may bind to at most one
//! live session, and a session binds to at most one peer. The table keeps
//! explicit insertion order so that when several peers could match a
//! remote identity, the first one configured wins — deterministically
//! across runs.
//!
//! Outbound peers are dialed once when added; a failed dial leaves the
//! peer disconnected (no retry at this layer). The dialing task pre-binds
//! the new session before the handshake completes, so the later
//! handshake-time bind scan leaves outbound sessions alone.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use enp_proto::registry::ParseMode;
use enp_proto::DEFAULT_PORT;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, PeerError};
use crate::listener::{Listeners, PeerSnapshot};
use crate::session::{DeviceSession, SessionEngine, SessionState};
use crate::transport;

/// Which side may establish the connection for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    /// The remote connects to us
    Inbound,
    /// We dial the remote
    Outbound,
    /// Either side may connect
    Bidirectional,
}

impl PeerDirection {
    /// Whether this direction requires a dial address.
    #[must_use]
    pub fn dials_out(self) -> bool {
        !matches!(self, Self::Inbound)
    }

    /// Whether an inbound session may bind to this peer.
    #[must_use]
    pub fn accepts_inbound(self) -> bool {
        !matches!(self, Self::Outbound)
    }
}

/// Immutable peer configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Unique peer id, the table key
    pub peer_id: String,
    /// Dial host; required unless the direction is inbound-only
    pub host: Option<String>,
    /// Dial port; defaults to [`DEFAULT_PORT`]
    pub port: Option<u16>,
    /// Connection direction
    pub direction: PeerDirection,
    /// Identity to match on handshake; defaults to `peer_id`
    pub expected_identity: Option<String>,
}

impl PeerConfig {
    /// An inbound-only peer.
    #[must_use]
    pub fn inbound(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            host: None,
            port: None,
            direction: PeerDirection::Inbound,
            expected_identity: None,
        }
    }

    /// An outbound peer dialing `host`.
    #[must_use]
    pub fn outbound(peer_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            host: Some(host.into()),
            port: Some(port),
            direction: PeerDirection::Outbound,
            expected_identity: None,
        }
    }

    /// Builder-style expected identity override.
    #[must_use]
    pub fn with_expected_identity(mut self, identity: impl Into<String>) -> Self {
        self.expected_identity = Some(identity.into());
        self
    }

    /// The identity this peer binds to: the explicit override, or the
    /// peer id itself.
    #[must_use]
    pub fn resolved_expected_identity(&self) -> &str {
        self.expected_identity.as_deref().unwrap_or(&self.peer_id)
    }
}

/// Connection state derived from the bound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// No session, or the session is winding down
    Disconnected,
    /// A session is bound but the handshake has not completed
    Connecting,
    /// The bound session is active
    Connected,
}

struct PeerEntry {
    config: PeerConfig,
    session: Option<Arc<DeviceSession>>,
}

impl PeerEntry {
    fn connection_state(&self) -> PeerConnectionState {
        match &self.session {
            None => PeerConnectionState::Disconnected,
            Some(session) => match session.state() {
                SessionState::AwaitingSession => PeerConnectionState::Connecting,
                SessionState::Active => PeerConnectionState::Connected,
                SessionState::Disconnecting | SessionState::Closed => {
                    PeerConnectionState::Disconnected
                },
            },
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        let session = self.session.as_ref();
        PeerSnapshot {
            peer_id: self.config.peer_id.clone(),
            direction: self.config.direction,
            host: self.config.host.clone(),
            port: self.config.port,
            expected_identity: self.config.resolved_expected_identity().to_owned(),
            connection_state: self.connection_state(),
            session_id: session.map(|s| s.id().to_owned()),
            latest_supply: session.and_then(|s| s.latest_supply()),
            latest_demand: session.and_then(|s| s.latest_demand()),
            latest_storage: session.and_then(|s| s.latest_storage()),
            captured_at: Utc::now(),
        }
    }
}

/// Insertion-ordered peer table plus the session→peer index.
#[derive(Default)]
struct PeerTable {
    entries: HashMap<String, PeerEntry>,
    order: Vec<String>,
}

/// The configured-peer table and outbound dial orchestration.
pub struct PeerManager {
    peers: RwLock<PeerTable>,
    session_to_peer: RwLock<HashMap<String, String>>,
    sessions: Arc<SessionEngine>,
    listeners: Listeners,
    parse_mode: ParseMode,
    dial_scope: CancellationToken,
}

impl PeerManager {
    pub(crate) fn new(
        sessions: Arc<SessionEngine>,
        listeners: Listeners,
        parse_mode: ParseMode,
    ) -> Self {
        Self {
            peers: RwLock::new(PeerTable::default()),
            session_to_peer: RwLock::new(HashMap::new()),
            sessions,
            listeners,
            parse_mode,
            dial_scope: CancellationToken::new(),
        }
    }

    /// Add a peer. Fails if the id exists or a dialing direction has no
    /// host. A dialing peer gets one outbound connection attempt.
    pub fn add_peer(self: &Arc<Self>, config: PeerConfig) -> Result<(), PeerError> {
        if config.direction.dials_out() && config.host.is_none() {
            return Err(PeerError::MissingHost(config.peer_id.clone()));
        }
        {
            let mut peers = self.peers.write();
            if peers.entries.contains_key(&config.peer_id) {
                return Err(PeerError::DuplicatePeer(config.peer_id.clone()));
            }
            peers.order.push(config.peer_id.clone());
            peers
                .entries
                .insert(config.peer_id.clone(), PeerEntry { config: config.clone(), session: None });
        }
        tracing::info!(peer = %config.peer_id, direction = ?config.direction, "peer added");

        if config.direction.dials_out() {
            let manager = self.clone();
            let cancel = self.dial_scope.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => {},
                    () = manager.dial(config) => {},
                }
            });
        }
        Ok(())
    }

    /// One outbound connection attempt. No retry: on failure the peer
    /// stays disconnected and the error is reported.
    async fn dial(self: Arc<Self>, config: PeerConfig) {
        let host = config.host.clone().unwrap_or_default();
        let port = config.port.unwrap_or(DEFAULT_PORT);
        tracing::debug!(peer = %config.peer_id, %host, port, "dialing");
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                let (sender, receiver) = transport::tcp_transport(stream, self.parse_mode);
                // pre-bind before the session task can see the handshake
                let mut bound = false;
                let session = self.sessions.accept_with(sender, receiver, |session| {
                    bound = self.pre_bind(&config.peer_id, session);
                });
                if bound {
                    tracing::debug!(
                        peer = %config.peer_id,
                        session = %session.id(),
                        "session pre-bound"
                    );
                } else {
                    // peer removed while the dial was in flight
                    self.sessions.close_session(&session).await;
                }
            },
            Err(source) => {
                tracing::warn!(peer = %config.peer_id, %host, port, error = %source, "dial failed");
                let error = NodeError::Dial { peer_id: config.peer_id.clone(), source };
                self.listeners.node("on_error", |l| l.on_error(&error));
            },
        }
    }

    /// Bind a just-dialed session to its peer before the handshake
    /// completes, so the handshake-time scan keeps its hands off it.
    fn pre_bind(&self, peer_id: &str, session: &Arc<DeviceSession>) -> bool {
        let mut peers = self.peers.write();
        match peers.entries.get_mut(peer_id) {
            Some(entry) if entry.session.is_none() => {
                entry.session = Some(session.clone());
                self.session_to_peer
                    .write()
                    .insert(session.id().to_owned(), peer_id.to_owned());
                true
            },
            _ => false,
        }
    }

    /// Remove a peer: unbind its session, close that session, then drop
    /// the peer from the table.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<(), PeerError> {
        let session = {
            let mut peers = self.peers.write();
            let entry = peers
                .entries
                .get_mut(peer_id)
                .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_owned()))?;
            entry.session.take()
        };
        if let Some(session) = session {
            // the close path finds the peer via the session index and
            // fires on_peer_disconnected
            self.sessions.close_session(&session).await;
        }
        let mut peers = self.peers.write();
        peers.entries.remove(peer_id);
        peers.order.retain(|id| id != peer_id);
        tracing::info!(peer = %peer_id, "peer removed");
        Ok(())
    }

    /// Handshake-time binding. Pre-bound sessions win; otherwise the
    /// first configured peer matching the remote identity (accepting
    /// inbound, currently unbound) gets the session. Returns the bound
    /// peer's snapshot, or `None` when the session stays unbound.
    pub(crate) fn bind_session(&self, session: &Arc<DeviceSession>) -> Option<PeerSnapshot> {
        let identity = session.remote_parameters()?.identity;
        let mut peers = self.peers.write();
        let mut index = self.session_to_peer.write();

        if let Some(peer_id) = index.get(session.id()) {
            // outbound pre-binding wins
            return peers.entries.get(peer_id).map(PeerEntry::snapshot);
        }

        let table = &mut *peers;
        for peer_id in &table.order {
            let Some(entry) = table.entries.get_mut(peer_id) else { continue };
            if entry.config.direction.accepts_inbound()
                && entry.session.is_none()
                && entry.config.resolved_expected_identity() == identity
            {
                entry.session = Some(session.clone());
                index.insert(session.id().to_owned(), peer_id.clone());
                tracing::info!(peer = %peer_id, session = %session.id(), "peer bound");
                return Some(entry.snapshot());
            }
        }
        tracing::debug!(session = %session.id(), %identity, "no peer matched; session unbound");
        None
    }

    /// Unbind whatever peer this session is linked to. Returns the peer's
    /// snapshot (taken after the unbind) when a link existed.
    pub(crate) fn unbind_session(&self, session: &Arc<DeviceSession>) -> Option<PeerSnapshot> {
        // lock order is always peers, then the session index
        let mut peers = self.peers.write();
        let peer_id = self.session_to_peer.write().remove(session.id())?;
        let entry = peers.entries.get_mut(&peer_id)?;
        entry.session = None;
        Some(entry.snapshot())
    }

    /// Snapshot of the peer a session is bound to, if any.
    pub(crate) fn snapshot_for_session(&self, session: &Arc<DeviceSession>) -> Option<PeerSnapshot> {
        let peers = self.peers.read();
        let peer_id = self.session_to_peer.read().get(session.id()).cloned()?;
        peers.entries.get(&peer_id).map(PeerEntry::snapshot)
    }

    /// Derived connection state, or `None` for an unknown peer.
    #[must_use]
    pub fn connection_state(&self, peer_id: &str) -> Option<PeerConnectionState> {
        self.peers.read().entries.get(peer_id).map(PeerEntry::connection_state)
    }

    /// The session currently bound to a peer.
    #[must_use]
    pub fn bound_session(&self, peer_id: &str) -> Option<Arc<DeviceSession>> {
        self.peers.read().entries.get(peer_id).and_then(|e| e.session.clone())
    }

    /// Snapshot map of every configured peer.
    #[must_use]
    pub fn snapshots(&self) -> HashMap<String, PeerSnapshot> {
        self.peers
            .read()
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot()))
            .collect()
    }

    /// Cancel in-flight dial tasks.
    pub(crate) fn close(&self) {
        self.dial_scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use enp_proto::message::SessionParameters;

    use super::*;
    use crate::session::SessionEngine;

    fn manager() -> Arc<PeerManager> {
        let listeners = Listeners::new();
        let sessions =
            Arc::new(SessionEngine::new(SessionParameters::new("local"), listeners.clone()));
        Arc::new(PeerManager::new(sessions, listeners, ParseMode::Lenient))
    }

    #[test]
    fn expected_identity_defaults_to_peer_id() {
        let config = PeerConfig::inbound("charger-7");
        assert_eq!(config.resolved_expected_identity(), "charger-7");
        let config = PeerConfig::inbound("charger-7").with_expected_identity("evse-0007");
        assert_eq!(config.resolved_expected_identity(), "evse-0007");
    }

    #[test]
    fn host_requirement_follows_direction() {
        assert!(PeerDirection::Inbound.accepts_inbound());
        assert!(!PeerDirection::Inbound.dials_out());
        assert!(PeerDirection::Outbound.dials_out());
        assert!(!PeerDirection::Outbound.accepts_inbound());
        assert!(PeerDirection::Bidirectional.dials_out());
        assert!(PeerDirection::Bidirectional.accepts_inbound());
    }

    #[test]
    fn add_peer_validates_before_inserting() {
        let manager = manager();
        let hostless = PeerConfig {
            peer_id: "out".to_owned(),
            host: None,
            port: None,
            direction: PeerDirection::Outbound,
            expected_identity: None,
        };
        assert_eq!(
            manager.add_peer(hostless).unwrap_err(),
            PeerError::MissingHost("out".to_owned())
        );
        assert!(manager.snapshots().is_empty());
    }

    #[test]
    fn duplicate_add_keeps_first_config() {
        let manager = manager();
        manager.add_peer(PeerConfig::inbound("p").with_expected_identity("first")).unwrap();
        let err = manager
            .add_peer(PeerConfig::inbound("p").with_expected_identity("second"))
            .unwrap_err();
        assert_eq!(err, PeerError::DuplicatePeer("p".to_owned()));
        assert_eq!(manager.snapshots()["p"].expected_identity, "first");
    }

    #[tokio::test]
    async fn remove_unknown_peer_errors() {
        let manager = manager();
        assert_eq!(
            manager.remove_peer("ghost").await.unwrap_err(),
            PeerError::UnknownPeer("ghost".to_owned())
        );
    }

    #[test]
    fn fresh_peers_read_disconnected() {
        let manager = manager();
        manager.add_peer(PeerConfig::inbound("a")).unwrap();
        assert_eq!(manager.connection_state("a"), Some(PeerConnectionState::Disconnected));
        assert_eq!(manager.connection_state("missing"), None);
        assert!(manager.bound_session("a").is_none());
    }
}
