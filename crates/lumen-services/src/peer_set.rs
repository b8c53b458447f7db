//! Peer set — connected servers, what they offer, and how loaded they are.
//!
//! The set itself is a plain struct owned by the distributor task. Other
//! tasks see it through `PeerSnapshot`s and `PeerEvent`s; they never
//! touch the map directly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;

use lumen_core::{Announcement, NodeId, Request, RequestKind};

use crate::score::{Outcome, Quality};

/// Event channel depth. Slow subscribers see `Lagged` and resync from a snapshot.
const EVENT_CAPACITY: usize = 256;

/// A connected server, as established by the handshake.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: NodeId,
    pub protocol_version: u32,
    /// Head the server last announced.
    pub announcement: Announcement,
    /// Concurrency budget in cost units.
    pub max_capacity: u64,
    /// Cost of one request per kind. Missing kinds cost 1.
    pub costs: HashMap<RequestKind, u64>,
}

impl Peer {
    pub fn new(id: NodeId, protocol_version: u32, max_capacity: u64) -> Self {
        Self {
            id,
            protocol_version,
            announcement: Announcement::default(),
            max_capacity,
            costs: HashMap::new(),
        }
    }

    pub fn with_announcement(mut self, announcement: Announcement) -> Self {
        self.announcement = announcement;
        self
    }

    pub fn with_cost(mut self, kind: RequestKind, cost: u64) -> Self {
        self.costs.insert(kind, cost);
        self
    }

    pub fn request_cost(&self, kind: RequestKind) -> u64 {
        self.costs.get(&kind).copied().unwrap_or(1)
    }

    /// Whether the announced head is recent enough for this request.
    pub fn can_serve(&self, request: &Request) -> bool {
        request
            .min_head()
            .map_or(true, |n| self.announcement.head_number >= n)
    }
}

/// A peer plus the bookkeeping that changes with every request.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer: Arc<Peer>,
    /// Sum of costs of requests currently assigned to this peer.
    pub load: u64,
    pub quality: Quality,
    pub consecutive_timeouts: u32,
    pub last_seen: Instant,
}

impl PeerStatus {
    fn new(peer: Peer, quality: Quality) -> Self {
        Self {
            peer: Arc::new(peer),
            load: 0,
            quality,
            consecutive_timeouts: 0,
            last_seen: Instant::now(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.peer.id
    }

    pub fn free_capacity(&self) -> u64 {
        self.peer.max_capacity.saturating_sub(self.load)
    }

    /// Load relative to capacity. Peers without capacity count as full.
    pub fn load_ratio(&self) -> f64 {
        if self.peer.max_capacity == 0 {
            return 1.0;
        }
        self.load as f64 / self.peer.max_capacity as f64
    }
}

/// Published on every mutation of the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Registered(NodeId),
    Unregistered(NodeId),
    /// Announcement, load or score changed.
    Updated(NodeId),
}

/// Immutable view of the set at one point in time, sorted by id.
///
/// Cheap to clone and iterate as often as needed.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    peers: Arc<[PeerStatus]>,
}

impl Default for PeerSnapshot {
    fn default() -> Self {
        Self {
            peers: Arc::from(Vec::new()),
        }
    }
}

impl PeerSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, PeerStatus> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerStatus> {
        self.peers
            .binary_search_by(|s| s.peer.id.cmp(id))
            .ok()
            .map(|i| &self.peers[i])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Peers whose capabilities satisfy `predicate`.
    pub fn matching<'a, F>(&'a self, predicate: F) -> impl Iterator<Item = &'a PeerStatus> + 'a
    where
        F: Fn(&Peer) -> bool + 'a,
    {
        self.peers.iter().filter(move |s| predicate(&s.peer))
    }

    /// Highest quality among peers satisfying `predicate`, then highest head.
    pub fn best_peer<F>(&self, predicate: F) -> Option<&PeerStatus>
    where
        F: Fn(&Peer) -> bool,
    {
        self.peers
            .iter()
            .filter(|s| predicate(&s.peer))
            .max_by(|a, b| {
                a.quality
                    .value()
                    .total_cmp(&b.quality.value())
                    .then(a.peer.announcement.head_number.cmp(&b.peer.announcement.head_number))
                    // Prefer the lower id on a full tie.
                    .then(b.peer.id.cmp(&a.peer.id))
            })
    }
}

/// The set of connected server peers. Keys are unique.
pub struct PeerSet {
    peers: HashMap<NodeId, PeerStatus>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSet {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peers: HashMap::new(),
            events,
        }
    }

    /// Add a peer. Fails if one with the same id is already present.
    pub fn register(&mut self, peer: Peer, quality: Quality) -> Result<(), PeerSetError> {
        let id = peer.id;
        if self.peers.contains_key(&id) {
            return Err(PeerSetError::DuplicatePeer(id));
        }
        self.peers.insert(id, PeerStatus::new(peer, quality));
        self.publish(PeerEvent::Registered(id));
        Ok(())
    }

    /// Remove a peer, returning its final status.
    pub fn unregister(&mut self, id: &NodeId) -> Result<PeerStatus, PeerSetError> {
        let status = self
            .peers
            .remove(id)
            .ok_or(PeerSetError::UnknownPeer(*id))?;
        self.publish(PeerEvent::Unregistered(*id));
        Ok(status)
    }

    /// Record a new head announced by a peer.
    pub fn update_announcement(
        &mut self,
        id: &NodeId,
        announcement: Announcement,
    ) -> Result<(), PeerSetError> {
        let status = self.peers.get_mut(id).ok_or(PeerSetError::UnknownPeer(*id))?;
        let mut peer = (*status.peer).clone();
        peer.announcement = announcement;
        status.peer = Arc::new(peer);
        status.last_seen = Instant::now();
        self.publish(PeerEvent::Updated(*id));
        Ok(())
    }

    /// Fold a request outcome into the peer's quality and timeout streak.
    pub fn record_outcome(
        &mut self,
        id: &NodeId,
        outcome: &Outcome,
        cfg: &lumen_core::config::ScoreConfig,
    ) -> Result<&PeerStatus, PeerSetError> {
        let status = self.peers.get_mut(id).ok_or(PeerSetError::UnknownPeer(*id))?;
        status.quality.observe(outcome, cfg);
        match outcome {
            Outcome::Success { .. } => {
                status.consecutive_timeouts = 0;
                status.last_seen = Instant::now();
            }
            Outcome::TimedOut => status.consecutive_timeouts += 1,
            Outcome::Rejected => status.last_seen = Instant::now(),
        }
        let _ = self.events.send(PeerEvent::Updated(*id));
        self.peers.get(id).ok_or(PeerSetError::UnknownPeer(*id))
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerStatus> {
        self.peers.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &NodeId) -> Option<&mut PeerStatus> {
        self.peers.get_mut(id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PeerStatus> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<PeerEvent> {
        self.events.clone()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let mut peers: Vec<PeerStatus> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.peer.id.cmp(&b.peer.id));
        PeerSnapshot {
            peers: peers.into(),
        }
    }

    fn publish(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerSetError {
    #[error("peer {0} is already registered")]
    DuplicatePeer(NodeId),

    #[error("peer {0} is not registered")]
    UnknownPeer(NodeId),
}
