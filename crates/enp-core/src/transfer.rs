//! Per-peer energy-parameter publishing loops.
//!
//! A transfer is one background task that, every tick, reads the peer's
//! bound session and the current parameter tuple and publishes the
//! non-empty parts in a fixed order: supply, then demand, then storage.
//! The first tick fires immediately.
//!
//! The parameter tuple is an immutable value behind an atomic swap:
//! `update_transfer` stores a whole new tuple, the tick task reads it
//! once per tick, and no tick ever observes a partial update. Once
//! `update_transfer` returns, no later tick uses the older tuple.
//!
//! A transfer reaches `Stopped` exactly once — on manual stop, peer
//! disconnect, transport error, or node shutdown — always through the
//! task's cleanup path, which removes it from the table and fires
//! `on_transfer_stopped`. Transport errors are swallowed: the transfer
//! simply stops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use enp_proto::message::Message;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;
use crate::listener::Listeners;
use crate::peer::{PeerConnectionState, PeerManager};
use crate::session::SessionState;

/// Interval between publishing ticks when none is given.
pub const DEFAULT_TICK_RATE: Duration = Duration::from_millis(100);

/// The immutable tuple of parameters a transfer publishes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransferParams {
    /// Supply parameters to publish, if any
    pub supply: Option<enp_proto::message::SupplyParameters>,
    /// Demand parameters to publish, if any
    pub demand: Option<enp_proto::message::DemandParameters>,
    /// Storage parameters to publish, if any
    pub storage: Option<enp_proto::message::StorageParameters>,
}

/// Transfer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Publishing
    Active,
    /// Terminal; published exactly once
    Stopped,
}

/// One active per-peer publisher.
pub struct EnergyTransfer {
    peer_id: String,
    params: RwLock<Arc<TransferParams>>,
    state: RwLock<TransferState>,
    cancel: CancellationToken,
}

impl EnergyTransfer {
    /// The peer this transfer publishes to.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransferState {
        *self.state.read()
    }

    /// The parameter tuple the next tick will use.
    #[must_use]
    pub fn params(&self) -> Arc<TransferParams> {
        self.params.read().clone()
    }

    fn swap_params(&self, params: TransferParams) {
        *self.params.write() = Arc::new(params);
    }

    /// True only for the first caller.
    fn mark_stopped(&self) -> bool {
        let mut state = self.state.write();
        if *state == TransferState::Stopped {
            return false;
        }
        *state = TransferState::Stopped;
        true
    }
}

/// Outcome of [`TransferEngine::start_transfer`].
pub enum StartTransferResult {
    /// The transfer is registered and publishing
    Success(Arc<EnergyTransfer>),
    /// No peer with this id is configured
    PeerNotFound(String),
    /// The peer exists but is not connected
    PeerNotConnected(String, PeerConnectionState),
    /// A transfer is already registered for this peer
    TransferAlreadyActive(String),
}

impl StartTransferResult {
    /// The transfer, when the start succeeded.
    #[must_use]
    pub fn transfer(&self) -> Option<&Arc<EnergyTransfer>> {
        match self {
            Self::Success(transfer) => Some(transfer),
            _ => None,
        }
    }
}

struct TransferEntry {
    transfer: Arc<EnergyTransfer>,
    task: Option<JoinHandle<()>>,
}

/// The transfer table and tick-task lifecycle.
pub struct TransferEngine {
    transfers: Mutex<HashMap<String, TransferEntry>>,
    peers: Arc<PeerManager>,
    listeners: Listeners,
    scope: CancellationToken,
}

impl TransferEngine {
    pub(crate) fn new(peers: Arc<PeerManager>, listeners: Listeners) -> Self {
        Self {
            transfers: Mutex::new(HashMap::new()),
            peers,
            listeners,
            scope: CancellationToken::new(),
        }
    }

    /// Start publishing to a peer. Validation order: unknown peer, peer
    /// not connected, transfer already active.
    pub fn start_transfer(
        self: &Arc<Self>,
        peer_id: &str,
        params: TransferParams,
        tick_rate: Duration,
    ) -> StartTransferResult {
        let Some(state) = self.peers.connection_state(peer_id) else {
            return StartTransferResult::PeerNotFound(peer_id.to_owned());
        };
        if state != PeerConnectionState::Connected {
            return StartTransferResult::PeerNotConnected(peer_id.to_owned(), state);
        }

        let transfer = {
            let mut transfers = self.transfers.lock();
            if transfers.contains_key(peer_id) {
                return StartTransferResult::TransferAlreadyActive(peer_id.to_owned());
            }
            let transfer = Arc::new(EnergyTransfer {
                peer_id: peer_id.to_owned(),
                params: RwLock::new(Arc::new(params)),
                state: RwLock::new(TransferState::Active),
                cancel: self.scope.child_token(),
            });
            transfers.insert(
                peer_id.to_owned(),
                TransferEntry { transfer: transfer.clone(), task: None },
            );
            transfer
        };

        let engine = self.clone();
        let tick_transfer = transfer.clone();
        let task = tokio::spawn(async move {
            engine.run_transfer(tick_transfer, tick_rate).await;
        });
        if let Some(entry) = self.transfers.lock().get_mut(peer_id) {
            entry.task = Some(task);
        }

        tracing::info!(peer = %peer_id, ?tick_rate, "transfer started");
        self.listeners.node("on_transfer_started", |l| l.on_transfer_started(peer_id));
        StartTransferResult::Success(transfer)
    }

    async fn run_transfer(self: Arc<Self>, transfer: Arc<EnergyTransfer>, tick_rate: Duration) {
        loop {
            if transfer.cancel.is_cancelled() {
                break;
            }

            // tick: peer liveness, then one atomic read of the tuple
            let Some(session) = self.peers.bound_session(transfer.peer_id()) else { break };
            if session.state() != SessionState::Active {
                break;
            }
            let params = transfer.params();

            let messages = [
                params.supply.clone().map(Message::SupplyParameters),
                params.demand.clone().map(Message::DemandParameters),
                params.storage.clone().map(Message::StorageParameters),
            ];
            let mut send_failed = false;
            for message in messages.into_iter().flatten() {
                if let Err(err) = session.send(&message).await {
                    tracing::debug!(
                        peer = %transfer.peer_id(),
                        error = %err,
                        "transfer send failed; stopping"
                    );
                    send_failed = true;
                    break;
                }
                self.listeners
                    .node("on_message_sent", |l| l.on_message_sent(transfer.peer_id(), &message));
            }
            if send_failed {
                break;
            }

            tokio::select! {
                () = transfer.cancel.cancelled() => break,
                () = tokio::time::sleep(tick_rate) => {},
            }
        }

        if transfer.mark_stopped() {
            self.transfers.lock().remove(transfer.peer_id());
            tracing::info!(peer = %transfer.peer_id(), "transfer stopped");
            self.listeners
                .node("on_transfer_stopped", |l| l.on_transfer_stopped(transfer.peer_id()));
        }
    }

    /// Atomically replace a transfer's parameter tuple. The next tick uses
    /// the new tuple; no partial tick is produced.
    pub fn update_transfer(&self, peer_id: &str, params: TransferParams) -> Result<(), TransferError> {
        let transfers = self.transfers.lock();
        let entry =
            transfers.get(peer_id).ok_or_else(|| TransferError::NotActive(peer_id.to_owned()))?;
        entry.transfer.swap_params(params);
        Ok(())
    }

    /// Cancel a transfer's tick task. No-op when none exists; the task's
    /// cleanup path publishes `Stopped` and fires the listener.
    pub fn stop_transfer(&self, peer_id: &str) {
        let cancel = self.transfers.lock().get(peer_id).map(|e| e.transfer.cancel.clone());
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// The registered transfer for a peer, if any.
    #[must_use]
    pub fn transfer(&self, peer_id: &str) -> Option<Arc<EnergyTransfer>> {
        self.transfers.lock().get(peer_id).map(|e| e.transfer.clone())
    }

    /// Cancel every transfer and wait for the cleanup paths (and their
    /// `on_transfer_stopped` callbacks) to finish.
    pub async fn shutdown(&self) {
        self.scope.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut transfers = self.transfers.lock();
            transfers.values_mut().filter_map(|e| e.task.take()).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}
