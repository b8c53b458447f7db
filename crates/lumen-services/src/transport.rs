//! Outbound side of the wire.
//!
//! The retrieval layer never talks to sockets. It hands each attempt to a
//! `Transport`, and whoever owns the connections feeds replies back through
//! `RetrieveManager::deliver`.

use lumen_core::{NodeId, RequestMessage};
use tokio::sync::mpsc;

/// Sends one request message to one peer. Must not block.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, peer: &NodeId, message: RequestMessage) -> Result<(), TransportError>;
}

/// Transport backed by an unbounded queue.
///
/// The receiving end is drained by a connection task (or, in tests, by a
/// simulated network).
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(NodeId, RequestMessage)>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(NodeId, RequestMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, peer: &NodeId, message: RequestMessage) -> Result<(), TransportError> {
        tracing::trace!(peer = %peer, req_id = message.req_id, kind = ?message.request.kind(), "request out");
        self.tx
            .send((*peer, message))
            .map_err(|_| TransportError::Closed)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(NodeId),

    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Other(String),
}
