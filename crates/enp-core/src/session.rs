//! Per-connection sessions and the session engine.
//!
//! Lifecycle of a session:
//!
//! ```text
//! ┌──────────────────┐ SessionParameters ┌────────┐ SoftDisconnect ┌───────────────┐
//! │ AwaitingSession  │──────────────────>│ Active │───────────────>│ Disconnecting │
//! └──────────────────┘                   └────────┘                └───────────────┘
//!          │ wrong first message / EOF        │ EOF / error / close        │ EOF
//!          ↓                                  ↓                            ↓
//!     ┌────────┐                         ┌────────┐                  ┌────────┐
//!     │ Closed │                         │ Closed │                  │ Closed │
//!     └────────┘                         └────────┘                  └────────┘
//! ```
//!
//! `Closed` is terminal; transitions out of it are silently ignored and
//! `close_session` is idempotent. Each session runs one task that drives
//! the receive sequence; within that task the order is strictly
//! receive → state update → listener callback. Listener callbacks get
//! snapshots and their panics are swallowed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use enp_proto::diag::ParseResult;
use enp_proto::message::{
    DemandParameters, Message, SessionParameters, SoftDisconnect, StorageParameters,
    SupplyParameters,
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{SessionError, TransportError};
use crate::listener::{DeviceSessionSnapshot, Listeners};
use crate::transport::{MessageReceiver, MessageSender};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; waiting for the remote's `SessionParameters`
    AwaitingSession,
    /// Handshake complete; normal dispatch
    Active,
    /// A `SoftDisconnect` was sent or received; draining until EOF
    Disconnecting,
    /// Terminal
    Closed,
}

/// One handshook (or in-progress) connection with a remote endpoint.
///
/// The session exclusively owns its transport: the receive half lives on
/// the session task, the send half sits here behind an async mutex so
/// transfer ticks and graceful disconnects can send without stopping the
/// receive loop.
pub struct DeviceSession {
    id: String,
    state: RwLock<SessionState>,
    sender: tokio::sync::Mutex<MessageSender>,
    remote: RwLock<Option<SessionParameters>>,
    latest_supply: RwLock<Option<SupplyParameters>>,
    latest_demand: RwLock<Option<DemandParameters>>,
    latest_storage: RwLock<Option<StorageParameters>>,
}

impl DeviceSession {
    fn new(sender: MessageSender) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: RwLock::new(SessionState::AwaitingSession),
            sender: tokio::sync::Mutex::new(sender),
            remote: RwLock::new(None),
            latest_supply: RwLock::new(None),
            latest_demand: RwLock::new(None),
            latest_storage: RwLock::new(None),
        }
    }

    /// Opaque unique session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Remote identity, present once the handshake succeeded.
    #[must_use]
    pub fn remote_parameters(&self) -> Option<SessionParameters> {
        self.remote.read().clone()
    }

    /// Most recent supply parameters received on this session.
    #[must_use]
    pub fn latest_supply(&self) -> Option<SupplyParameters> {
        self.latest_supply.read().clone()
    }

    /// Most recent demand parameters received on this session.
    #[must_use]
    pub fn latest_demand(&self) -> Option<DemandParameters> {
        self.latest_demand.read().clone()
    }

    /// Most recent storage parameters received on this session.
    #[must_use]
    pub fn latest_storage(&self) -> Option<StorageParameters> {
        self.latest_storage.read().clone()
    }

    /// Capture an immutable snapshot for listeners.
    #[must_use]
    pub fn snapshot(&self) -> DeviceSessionSnapshot {
        DeviceSessionSnapshot {
            id: self.id.clone(),
            state: self.state(),
            remote: self.remote_parameters(),
            latest_supply: self.latest_supply(),
            latest_demand: self.latest_demand(),
            latest_storage: self.latest_storage(),
            captured_at: Utc::now(),
        }
    }

    /// Send a message on this session's transport.
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        self.sender.lock().await.send(message).await
    }

    /// Transition unless already closed. Returns whether the transition
    /// was applied.
    fn transition(&self, to: SessionState) -> bool {
        let mut state = self.state.write();
        if *state == SessionState::Closed {
            return false;
        }
        *state = to;
        true
    }

    /// Mark closed; true only for the first caller.
    fn close_once(&self) -> bool {
        let mut state = self.state.write();
        if *state == SessionState::Closed {
            return false;
        }
        *state = SessionState::Closed;
        true
    }

    async fn close_transport(&self) {
        self.sender.lock().await.close().await;
    }
}

/// Cross-engine effects of session lifecycle events, implemented by the
/// node core: peer binding on handshake, unbinding and transfer stops on
/// close.
pub(crate) trait SessionHooks: Send + Sync {
    /// The handshake succeeded; bind a peer if one matches.
    fn session_activated(&self, session: &Arc<DeviceSession>);

    /// The session received fresh supply/demand/storage parameters.
    fn session_parameters_updated(&self, session: &Arc<DeviceSession>);

    /// The session closed; unbind and stop dependents.
    fn session_closed(&self, session: &Arc<DeviceSession>);
}

struct SessionHandle {
    session: Arc<DeviceSession>,
    cancel: CancellationToken,
}

/// Owns the session table and the per-session tasks.
pub struct SessionEngine {
    identity: SessionParameters,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    listeners: Listeners,
    hooks: RwLock<Option<Weak<dyn SessionHooks>>>,
    scope: CancellationToken,
}

impl SessionEngine {
    pub(crate) fn new(identity: SessionParameters, listeners: Listeners) -> Self {
        Self {
            identity,
            sessions: RwLock::new(HashMap::new()),
            listeners,
            hooks: RwLock::new(None),
            scope: CancellationToken::new(),
        }
    }

    pub(crate) fn set_hooks(&self, hooks: Weak<dyn SessionHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn SessionHooks>> {
        self.hooks.read().as_ref().and_then(Weak::upgrade)
    }

    /// The identity this node announces in handshake replies.
    #[must_use]
    pub fn identity(&self) -> &SessionParameters {
        &self.identity
    }

    /// Look up a live session by id.
    #[must_use]
    pub fn session(&self, id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.read().get(id).map(|h| h.session.clone())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Accept a transport: create a session in `AwaitingSession`, register
    /// it, fire `on_session_created`, and spawn the session task. Returns
    /// immediately.
    pub fn accept(
        self: &Arc<Self>,
        sender: MessageSender,
        receiver: MessageReceiver,
    ) -> Arc<DeviceSession> {
        self.accept_with(sender, receiver, |_| {})
    }

    /// [`SessionEngine::accept`] with a hook that runs after the session
    /// is registered but before its task can process any message. The
    /// peer manager pre-binds dialed sessions here, so the handshake-time
    /// bind scan can never race the pre-binding.
    pub(crate) fn accept_with(
        self: &Arc<Self>,
        sender: MessageSender,
        receiver: MessageReceiver,
        before_spawn: impl FnOnce(&Arc<DeviceSession>),
    ) -> Arc<DeviceSession> {
        let session = Arc::new(DeviceSession::new(sender));
        let cancel = self.scope.child_token();
        self.sessions.write().insert(
            session.id().to_owned(),
            SessionHandle { session: session.clone(), cancel: cancel.clone() },
        );
        tracing::debug!(session = %session.id(), "session created");
        before_spawn(&session);
        let snapshot = session.snapshot();
        self.listeners.server("on_session_created", |l| l.on_session_created(&snapshot));

        let engine = self.clone();
        let task_session = session.clone();
        tokio::spawn(async move {
            engine.run_session(task_session, receiver, cancel).await;
        });
        session
    }

    async fn run_session(
        self: Arc<Self>,
        session: Arc<DeviceSession>,
        mut receiver: MessageReceiver,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                item = receiver.recv() => match item {
                    None => break,
                    Some(ParseResult::Success { value, .. }) => {
                        if !self.handle_message(&session, value).await {
                            break;
                        }
                    },
                    Some(ParseResult::Failure { diagnostics }) => {
                        let error = SessionError::Parse { diagnostics };
                        tracing::debug!(session = %session.id(), %error, "receive failed");
                        let snapshot = session.snapshot();
                        self.listeners
                            .server("on_session_error", |l| l.on_session_error(&snapshot, &error));
                        break;
                    },
                }
            }
        }
        self.close_session(&session).await;
    }

    /// Dispatch one received message. Returns whether the session task
    /// should keep receiving.
    async fn handle_message(&self, session: &Arc<DeviceSession>, message: Message) -> bool {
        {
            let snapshot = session.snapshot();
            self.listeners
                .server("on_message_received", |l| l.on_message_received(&snapshot, &message));
        }

        match session.state() {
            SessionState::AwaitingSession => match message {
                Message::SessionParameters(remote) => self.complete_handshake(session, remote).await,
                other => {
                    let reason = format!(
                        "handshake expected SessionParameters, received {}",
                        other.name()
                    );
                    tracing::debug!(session = %session.id(), reason, "handshake failed");
                    let snapshot = session.snapshot();
                    self.listeners.server("on_session_handshake_failed", |l| {
                        l.on_session_handshake_failed(&snapshot, &reason);
                    });
                    false
                },
            },
            SessionState::Active => {
                match message {
                    Message::SupplyParameters(params) => {
                        *session.latest_supply.write() = Some(params);
                        if let Some(hooks) = self.hooks() {
                            hooks.session_parameters_updated(session);
                        }
                    },
                    Message::DemandParameters(params) => {
                        *session.latest_demand.write() = Some(params);
                        if let Some(hooks) = self.hooks() {
                            hooks.session_parameters_updated(session);
                        }
                    },
                    Message::StorageParameters(params) => {
                        *session.latest_storage.write() = Some(params);
                        if let Some(hooks) = self.hooks() {
                            hooks.session_parameters_updated(session);
                        }
                    },
                    Message::SoftDisconnect(announce) => {
                        // the EOF that follows closes the session; here we
                        // only leave the active state
                        session.transition(SessionState::Disconnecting);
                        let snapshot = session.snapshot();
                        self.listeners.server("on_session_disconnecting", |l| {
                            l.on_session_disconnecting(&snapshot, Some(&announce));
                        });
                    },
                    // keepalive and everything else: generic callback only
                    Message::Ping
                    | Message::SessionParameters(_)
                    | Message::Unknown { .. } => {},
                }
                true
            },
            // draining until the peer hangs up
            SessionState::Disconnecting => true,
            SessionState::Closed => false,
        }
    }

    async fn complete_handshake(
        &self,
        session: &Arc<DeviceSession>,
        remote: SessionParameters,
    ) -> bool {
        tracing::info!(
            session = %session.id(),
            identity = %remote.identity,
            "handshake complete"
        );
        *session.remote.write() = Some(remote);
        session.transition(SessionState::Active);

        let reply = Message::SessionParameters(self.identity.clone());
        if let Err(err) = session.send(&reply).await {
            let error = SessionError::Transport(err);
            let snapshot = session.snapshot();
            self.listeners.server("on_session_error", |l| l.on_session_error(&snapshot, &error));
            return false;
        }

        if let Some(hooks) = self.hooks() {
            hooks.session_activated(session);
        }
        let snapshot = session.snapshot();
        self.listeners.server("on_session_active", |l| l.on_session_active(&snapshot));
        true
    }

    /// Gracefully disconnect: announce `SoftDisconnect` (send errors are
    /// swallowed — the transport may already be broken), then close.
    pub async fn disconnect(&self, session: &Arc<DeviceSession>, reason: Option<String>) {
        if session.state() == SessionState::Active {
            session.transition(SessionState::Disconnecting);
            let announce = SoftDisconnect { reconnect: Some(false), reason };
            let _ = session.send(&Message::SoftDisconnect(announce.clone())).await;
            let snapshot = session.snapshot();
            self.listeners.server("on_session_disconnecting", |l| {
                l.on_session_disconnecting(&snapshot, Some(&announce));
            });
        }
        self.close_session(session).await;
    }

    /// Close a session. Idempotent: the first caller tears down, later
    /// callers (and the session task's own exit path) are no-ops.
    pub async fn close_session(&self, session: &Arc<DeviceSession>) {
        if !session.close_once() {
            return;
        }
        let handle = self.sessions.write().remove(session.id());
        if let Some(handle) = handle {
            handle.cancel.cancel();
        }
        session.close_transport().await;

        if let Some(hooks) = self.hooks() {
            hooks.session_closed(session);
        }
        tracing::debug!(session = %session.id(), "session closed");
        let snapshot = session.snapshot();
        self.listeners.server("on_session_closed", |l| l.on_session_closed(&snapshot));
    }

    /// Close every session and cancel the session scope.
    pub async fn close(&self) {
        let sessions: Vec<_> =
            self.sessions.read().values().map(|h| h.session.clone()).collect();
        for session in sessions {
            self.disconnect(&session, Some("node closing".to_owned())).await;
        }
        self.scope.cancel();
    }
}
