//! EnergyNet Protocol node core.
//!
//! The async half of the protocol stack (the wire format lives in
//! `enp-proto`):
//!
//! - [`transport`]: frame/message transports over any byte pipe
//! - [`session`]: per-connection state machines and the session table
//! - [`peer`]: configured peers and identity-based binding
//! - [`transfer`]: per-peer periodic parameter publishing
//! - [`node`]: the façade composing all of the above plus a TCP acceptor
//! - [`listener`]: snapshot-based callback interfaces
//!
//! Concurrency model: one cooperative task per session, per transfer,
//! per acceptor, and per outbound dial. Shared tables sit behind
//! short-lived locks never held across a suspension point; only socket
//! sends, socket reads, and tick sleeps suspend.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod listener;
pub mod node;
pub mod peer;
pub mod session;
pub mod transfer;
pub mod transport;

pub use error::{NodeError, PeerError, SessionError, TransferError, TransportError};
pub use listener::{DeviceSessionSnapshot, NodeListener, PeerSnapshot, ServerListener};
pub use node::{Node, NodeConfig};
pub use peer::{PeerConfig, PeerConnectionState, PeerDirection, PeerManager};
pub use session::{DeviceSession, SessionEngine, SessionState};
pub use transfer::{
    EnergyTransfer, StartTransferResult, TransferEngine, TransferParams, TransferState,
    DEFAULT_TICK_RATE,
};
pub use transport::{
    split_transport, tcp_transport, FrameReader, FrameSink, FrameSource, FrameWriter,
    MessageReceiver, MessageSender,
};
