//! Error types for the node core.
//!
//! Each layer has its own enum. Transfer pre-conditions are deliberately
//! *not* here: they come back as the tagged
//! [`StartTransferResult`](crate::transfer::StartTransferResult), not as
//! errors.

use enp_proto::diag::{Diagnostic, Severity};
use thiserror::Error;

/// Failures of a frame/message transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O failed
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was closed before or during the operation
    #[error("transport closed")]
    Closed,
}

/// Failures observed by a session task.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport failed mid-session
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The receive stream yielded a parse failure
    #[error("parse failure: {}", summarize(.diagnostics))]
    Parse {
        /// Diagnostics from the failed parse
        diagnostics: Vec<Diagnostic>,
    },
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .find(|d| d.severity == Severity::Error)
        .or_else(|| diagnostics.first())
        .map_or_else(|| "no diagnostics".to_owned(), |d| format!("{}: {}", d.code, d.message))
}

/// Invalid-argument failures of the peer table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// A peer with this id is already configured
    #[error("peer `{0}` already exists")]
    DuplicatePeer(String),

    /// The direction requires dialing but no host is configured
    #[error("peer `{0}` dials out but has no host configured")]
    MissingHost(String),

    /// No peer with this id is configured
    #[error("peer `{0}` is not configured")]
    UnknownPeer(String),
}

/// Failures of transfer operations that are plain errors (as opposed to
/// the tagged start result).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// No transfer is registered for this peer
    #[error("no active transfer for peer `{0}`")]
    NotActive(String),
}

/// Node-level failures surfaced through
/// [`NodeListener::on_error`](crate::listener::NodeListener::on_error).
#[derive(Debug, Error)]
pub enum NodeError {
    /// Accepting an inbound connection failed
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// An outbound dial failed; the peer stays disconnected
    #[error("dial to peer `{peer_id}` failed: {source}")]
    Dial {
        /// The peer being dialed
        peer_id: String,
        /// The underlying connect error
        #[source]
        source: std::io::Error,
    },
}
