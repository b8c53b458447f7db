//! lumen-services — the on-demand retrieval substrate.
//!
//! Peer bookkeeping, request distribution, retrieval with retries, and the
//! server pool that keeps the peer set stocked. Everything mutable is owned
//! by one actor task; other tasks talk to it over channels.

pub mod distributor;
pub mod odr;
pub mod peer_set;
pub mod redial;
pub mod retrieve;
pub mod score;
pub mod server_pool;
pub mod service;
pub mod transport;
pub mod validate;

pub use distributor::{
    Assignment, DistRequest, DistributorError, DistributorStats, PeerReport, PendingRequest,
    RequestDistributor,
};
pub use odr::{Odr, OdrError};
pub use peer_set::{Peer, PeerEvent, PeerSet, PeerSetError, PeerSnapshot, PeerStatus};
pub use retrieve::{PeerFeedback, RetrieveError, RetrieveManager, RetrieveStats};
pub use score::{Outcome, Quality};
pub use server_pool::{
    Dialer, EntryState, HandshakeError, NodeAddr, PoolEntry, PoolError, ServerHello, ServerPool,
};
pub use service::{discovery_topic, LightService};
pub use transport::{ChannelTransport, Transport, TransportError};
pub use validate::{ReceiptsValidator, RejectReason, Validator, ValidatorSet, Verdict};
