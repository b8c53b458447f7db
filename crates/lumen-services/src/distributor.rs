//! Request distributor — hands queued requests to peers with spare capacity.
//!
//! One task owns the peer set, the pending queue and the capacity ledger.
//! Everything else holds a `RequestDistributor` handle and talks to that
//! task over a channel, so registration, capacity accounting and queue
//! re-evaluation are applied strictly one after another.
//!
//! Selection runs after every command: pending entries are visited oldest
//! first, and each goes to the eligible peer with the lowest load ratio,
//! ties broken by quality.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use lumen_core::config::ScoreConfig;
use lumen_core::{Announcement, NodeId};

use crate::peer_set::{Peer, PeerEvent, PeerSet, PeerSetError, PeerSnapshot, PeerStatus};
use crate::score::{Outcome, Quality};

type CanSend = Box<dyn Fn(&PeerStatus) -> bool + Send>;
type CostFn = Box<dyn Fn(&Peer) -> u64 + Send>;

/// A request as the distributor sees it: who may serve it, and what it costs.
pub struct DistRequest {
    can_send: CanSend,
    cost: CostFn,
}

impl DistRequest {
    pub fn new<P, C>(can_send: P, cost: C) -> Self
    where
        P: Fn(&PeerStatus) -> bool + Send + 'static,
        C: Fn(&Peer) -> u64 + Send + 'static,
    {
        Self {
            can_send: Box::new(can_send),
            cost: Box::new(cost),
        }
    }
}

/// Quality and timeout streak after an outcome was recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerReport {
    pub quality: Quality,
    pub consecutive_timeouts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributorStats {
    /// Submitted, not yet assigned.
    pub pending: usize,
    /// Assigned, not yet completed.
    pub in_flight: usize,
}

enum Command {
    Register {
        peer: Peer,
        quality: Quality,
        reply: oneshot::Sender<Result<(), PeerSetError>>,
    },
    Unregister {
        id: NodeId,
        reply: oneshot::Sender<Result<(), PeerSetError>>,
    },
    Announce {
        id: NodeId,
        announcement: Announcement,
        reply: oneshot::Sender<Result<(), PeerSetError>>,
    },
    Report {
        id: NodeId,
        outcome: Outcome,
        reply: oneshot::Sender<Result<PeerReport, PeerSetError>>,
    },
    Submit {
        seq: u64,
        request: DistRequest,
        reply: oneshot::Sender<Assignment>,
    },
    Cancel {
        seq: u64,
        reply: Option<oneshot::Sender<bool>>,
    },
    Complete {
        seq: u64,
    },
    Stats {
        reply: oneshot::Sender<DistributorStats>,
    },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the distributor task.
#[derive(Clone)]
pub struct RequestDistributor {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<PeerSnapshot>,
    events: broadcast::Sender<PeerEvent>,
    next_seq: Arc<AtomicU64>,
    initial: Quality,
}

impl RequestDistributor {
    /// Build a handle and the task that backs it. The caller spawns `run`.
    pub fn new(score: ScoreConfig) -> (Self, DistributorActor) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let peers = PeerSet::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(PeerSnapshot::default());
        let handle = Self {
            commands: commands_tx.clone(),
            snapshot: snapshot_rx,
            events: peers.event_sender(),
            next_seq: Arc::new(AtomicU64::new(0)),
            initial: Quality::initial(&score),
        };
        let actor = DistributorActor {
            score,
            peers,
            queue: BTreeMap::new(),
            assigned: HashMap::new(),
            commands: commands_rx,
            self_tx: commands_tx.downgrade(),
            snapshot: snapshot_tx,
        };
        (handle, actor)
    }

    /// Build and spawn on the current runtime.
    pub fn spawn(score: ScoreConfig, shutdown: broadcast::Receiver<()>) -> Self {
        let (handle, actor) = Self::new(score);
        tokio::spawn(async move {
            if let Err(e) = actor.run(shutdown).await {
                tracing::error!(error = %e, "request distributor failed");
            }
        });
        handle
    }

    pub async fn register_peer(&self, peer: Peer) -> Result<(), DistributorError> {
        self.register_peer_with_quality(peer, self.initial).await
    }

    /// Register carrying a score earned elsewhere (e.g. during admission).
    pub async fn register_peer_with_quality(
        &self,
        peer: Peer,
        quality: Quality,
    ) -> Result<(), DistributorError> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Register { peer, quality, reply }, rx)
            .await?
            .map_err(Into::into)
    }

    /// Remove a peer. Requests assigned to it are revoked so their owners
    /// can re-queue them elsewhere.
    pub async fn unregister_peer(&self, id: NodeId) -> Result<(), DistributorError> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Unregister { id, reply }, rx)
            .await?
            .map_err(Into::into)
    }

    pub async fn announce(
        &self,
        id: NodeId,
        announcement: Announcement,
    ) -> Result<(), DistributorError> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Announce { id, announcement, reply }, rx)
            .await?
            .map_err(Into::into)
    }

    /// Record how a request to `id` went.
    pub async fn report(&self, id: NodeId, outcome: Outcome) -> Result<PeerReport, DistributorError> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Report { id, outcome, reply }, rx)
            .await?
            .map_err(Into::into)
    }

    /// Queue a request. Await the returned handle for the assignment.
    pub fn submit(&self, request: DistRequest) -> PendingRequest {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        // On a closed channel the reply sender is dropped with the command,
        // which resolves the handle with Closed.
        let _ = self.commands.send(Command::Submit { seq, request, reply });
        PendingRequest {
            seq,
            reply: rx,
            commands: self.commands.clone(),
            resolved: false,
        }
    }

    pub async fn stats(&self) -> Result<DistributorStats, DistributorError> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Stats { reply }, rx).await
    }

    /// Latest published view of the peer set.
    pub fn peers(&self) -> PeerSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the peer set satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<PeerSnapshot, DistributorError>
    where
        F: FnMut(&PeerSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| DistributorError::Closed)?;
        Ok(snapshot.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn call<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, DistributorError> {
        self.commands
            .send(command)
            .map_err(|_| DistributorError::Closed)?;
        rx.await.map_err(|_| DistributorError::Closed)
    }
}

// ── Pending and assigned requests ─────────────────────────────────────────────

/// A submitted request waiting for a peer.
///
/// Resolves to an `Assignment`. Dropping it unresolved withdraws the entry.
pub struct PendingRequest {
    seq: u64,
    reply: oneshot::Receiver<Assignment>,
    commands: mpsc::UnboundedSender<Command>,
    resolved: bool,
}

impl PendingRequest {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Withdraw the request. Returns false if a peer was already assigned,
    /// in which case the assignment is released instead.
    pub async fn cancel(mut self) -> bool {
        self.resolved = true;
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Cancel {
                seq: self.seq,
                reply: Some(reply),
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

impl Future for PendingRequest {
    type Output = Result<Assignment, DistributorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.reply).poll(cx) {
            Poll::Ready(result) => {
                this.resolved = true;
                Poll::Ready(result.map_err(|_| DistributorError::Closed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.resolved {
            let _ = self.commands.send(Command::Cancel {
                seq: self.seq,
                reply: None,
            });
        }
    }
}

/// A request bound to a peer. Holds `cost` units of the peer's capacity
/// until dropped.
pub struct Assignment {
    seq: u64,
    peer: Arc<Peer>,
    cost: u64,
    revoked: Option<oneshot::Receiver<()>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Assignment {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Resolves once the peer has been unregistered or the distributor
    /// has shut down.
    pub async fn revoked(&mut self) {
        if let Some(rx) = self.revoked.as_mut() {
            let _ = rx.await;
            self.revoked = None;
        }
    }
}

impl fmt::Debug for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assignment")
            .field("seq", &self.seq)
            .field("peer", &self.peer.id)
            .field("cost", &self.cost)
            .finish()
    }
}

impl Drop for Assignment {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Complete { seq: self.seq });
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct Queued {
    request: DistRequest,
    reply: oneshot::Sender<Assignment>,
}

struct Assigned {
    peer: NodeId,
    cost: u64,
    revoke: oneshot::Sender<()>,
}

/// The task that owns the peer set and the queue.
pub struct DistributorActor {
    score: ScoreConfig,
    peers: PeerSet,
    /// Keyed by submission sequence, so iteration is oldest first.
    queue: BTreeMap<u64, Queued>,
    assigned: HashMap<u64, Assigned>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Weak, so the task ends once every handle is gone.
    self_tx: mpsc::WeakUnboundedSender<Command>,
    snapshot: watch::Sender<PeerSnapshot>,
}

impl DistributorActor {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        tracing::info!("request distributor starting");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("request distributor shutting down");
                    return Ok(());
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        tracing::debug!("all distributor handles dropped");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register { peer, quality, reply } => {
                let id = peer.id;
                let result = self.peers.register(peer, quality);
                if result.is_ok() {
                    tracing::debug!(peer = %id, "peer registered");
                }
                self.settle();
                let _ = reply.send(result);
            }
            Command::Unregister { id, reply } => {
                let result = self.unregister(&id);
                self.settle();
                let _ = reply.send(result);
            }
            Command::Announce { id, announcement, reply } => {
                let result = self.peers.update_announcement(&id, announcement);
                self.settle();
                let _ = reply.send(result);
            }
            Command::Report { id, outcome, reply } => {
                let result = self
                    .peers
                    .record_outcome(&id, &outcome, &self.score)
                    .map(|s| PeerReport {
                        quality: s.quality,
                        consecutive_timeouts: s.consecutive_timeouts,
                    });
                self.settle();
                let _ = reply.send(result);
            }
            Command::Submit { seq, request, reply } => {
                self.queue.insert(seq, Queued { request, reply });
                self.settle();
            }
            Command::Cancel { seq, reply } => {
                let withdrawn = self.queue.remove(&seq).is_some();
                if withdrawn {
                    tracing::trace!(seq, "pending request withdrawn");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(withdrawn);
                }
            }
            Command::Complete { seq } => {
                self.release(seq);
                self.settle();
            }
            Command::Stats { reply } => {
                let _ = reply.send(DistributorStats {
                    pending: self.queue.len(),
                    in_flight: self.assigned.len(),
                });
            }
        }
    }

    /// Re-run selection and publish the resulting view.
    fn settle(&mut self) {
        self.dispatch();
        self.snapshot.send_replace(self.peers.snapshot());
    }

    fn dispatch(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let Some(commands) = self.self_tx.upgrade() else {
            return;
        };

        let mut chosen: Vec<(u64, Arc<Peer>, u64)> = Vec::new();
        let mut abandoned: Vec<u64> = Vec::new();

        for (&seq, queued) in &self.queue {
            if queued.reply.is_closed() {
                abandoned.push(seq);
                continue;
            }
            let choice = self
                .peers
                .iter()
                .filter(|s| (queued.request.can_send)(s))
                .filter_map(|s| {
                    let cost = (queued.request.cost)(&*s.peer).max(1);
                    (cost <= s.free_capacity()).then_some((s, cost))
                })
                .min_by(|(a, _), (b, _)| {
                    a.load_ratio()
                        .total_cmp(&b.load_ratio())
                        .then(b.quality.value().total_cmp(&a.quality.value()))
                        .then(a.peer.id.cmp(&b.peer.id))
                })
                .map(|(s, cost)| (s.peer.clone(), cost));

            let Some((peer, cost)) = choice else {
                continue;
            };
            // Charge now so later entries in this pass see the new load.
            if let Some(status) = self.peers.get_mut(&peer.id) {
                status.load += cost;
            }
            chosen.push((seq, peer, cost));
        }

        for seq in abandoned {
            self.queue.remove(&seq);
        }

        for (seq, peer, cost) in chosen {
            let Some(queued) = self.queue.remove(&seq) else {
                continue;
            };
            let (revoke, revoked) = oneshot::channel();
            self.assigned.insert(
                seq,
                Assigned {
                    peer: peer.id,
                    cost,
                    revoke,
                },
            );
            tracing::trace!(seq, peer = %peer.id, cost, "request assigned");
            let assignment = Assignment {
                seq,
                peer,
                cost,
                revoked: Some(revoked),
                commands: commands.clone(),
            };
            // A refused assignment is dropped here, which queues its release.
            let _ = queued.reply.send(assignment);
        }
    }

    fn release(&mut self, seq: u64) {
        if let Some(assigned) = self.assigned.remove(&seq) {
            if let Some(status) = self.peers.get_mut(&assigned.peer) {
                status.load = status.load.saturating_sub(assigned.cost);
            }
        }
    }

    fn unregister(&mut self, id: &NodeId) -> Result<(), PeerSetError> {
        self.peers.unregister(id)?;
        let revoked: Vec<u64> = self
            .assigned
            .iter()
            .filter(|(_, a)| a.peer == *id)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &revoked {
            if let Some(assigned) = self.assigned.remove(seq) {
                let _ = assigned.revoke.send(());
            }
        }
        tracing::info!(peer = %id, released = revoked.len(), "peer unregistered");
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DistributorError {
    #[error(transparent)]
    PeerSet(#[from] PeerSetError),

    #[error("request distributor has shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use lumen_core::RequestKind;

    fn id(n: u8) -> NodeId {
        NodeId([n; 32])
    }

    fn any_peer() -> DistRequest {
        DistRequest::new(|_| true, |_| 1)
    }

    fn spawn() -> (RequestDistributor, broadcast::Sender<()>) {
        let (shutdown, _) = broadcast::channel(1);
        let distributor = RequestDistributor::spawn(ScoreConfig::default(), shutdown.subscribe());
        (distributor, shutdown)
    }

    #[tokio::test]
    async fn three_peers_five_requests() {
        let (dist, _shutdown) = spawn();
        for n in 1..=3 {
            dist.register_peer(Peer::new(id(n), 2, 1)).await.unwrap();
        }

        let mut pending: Vec<PendingRequest> = (0..5).map(|_| dist.submit(any_peer())).collect();
        let stats = dist.stats().await.unwrap();
        assert_eq!(stats, DistributorStats { pending: 2, in_flight: 3 });

        let mut sent = Vec::new();
        for p in pending.iter_mut().take(3) {
            sent.push(p.now_or_never().unwrap().unwrap());
        }
        // Oldest first: the last two are the ones still waiting.
        assert!((&mut pending[3]).now_or_never().is_none());
        assert!((&mut pending[4]).now_or_never().is_none());

        let distinct: std::collections::HashSet<_> = sent.iter().map(|a| a.peer().id).collect();
        assert_eq!(distinct.len(), 3);

        drop(sent.pop());
        let stats = dist.stats().await.unwrap();
        assert_eq!(stats, DistributorStats { pending: 1, in_flight: 3 });
        assert!((&mut pending[3]).now_or_never().unwrap().is_ok());
        assert!((&mut pending[4]).now_or_never().is_none());
    }

    #[tokio::test]
    async fn queued_until_qualifying_peer_registers() {
        let (dist, _shutdown) = spawn();
        dist.register_peer(Peer::new(id(1), 1, 4)).await.unwrap();

        let mut pending = dist.submit(DistRequest::new(|s| s.peer.protocol_version >= 2, |_| 1));
        assert_eq!(dist.stats().await.unwrap().pending, 1);
        assert!((&mut pending).now_or_never().is_none());

        dist.register_peer(Peer::new(id(2), 2, 4)).await.unwrap();
        let assignment = (&mut pending).now_or_never().unwrap().unwrap();
        assert_eq!(assignment.peer().id, id(2));
    }

    #[tokio::test]
    async fn capacity_stays_within_bounds() {
        let (dist, _shutdown) = spawn();
        dist.register_peer(Peer::new(id(1), 2, 3)).await.unwrap();
        dist.register_peer(Peer::new(id(2), 2, 5).with_cost(RequestKind::Code, 2))
            .await
            .unwrap();

        let mut held: Vec<Assignment> = Vec::new();
        let mut waiting: Vec<PendingRequest> = Vec::new();
        let mut x: u32 = 11;
        for _ in 0..200 {
            x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            match (x >> 16) % 3 {
                0 | 1 => waiting.push(dist.submit(DistRequest::new(
                    |_| true,
                    |p: &Peer| p.request_cost(RequestKind::Code),
                ))),
                _ => {
                    if !held.is_empty() {
                        let i = (x as usize) % held.len();
                        drop(held.swap_remove(i));
                    }
                }
            }
            dist.stats().await.unwrap();
            let mut still_waiting = Vec::new();
            for mut p in waiting.drain(..) {
                match (&mut p).now_or_never() {
                    Some(Ok(a)) => held.push(a),
                    Some(Err(e)) => panic!("distributor closed: {e}"),
                    None => still_waiting.push(p),
                }
            }
            waiting = still_waiting;
            for status in dist.peers().iter() {
                assert!(status.load <= status.peer.max_capacity);
            }
        }

        drop(waiting);
        held.clear();
        dist.stats().await.unwrap();
        assert!(dist.peers().iter().all(|s| s.load == 0));
    }

    #[tokio::test]
    async fn cancel_withdraws_pending_only() {
        let (dist, _shutdown) = spawn();
        let pending = dist.submit(any_peer());
        assert!(pending.cancel().await);
        assert_eq!(dist.stats().await.unwrap().pending, 0);

        dist.register_peer(Peer::new(id(1), 2, 1)).await.unwrap();
        let pending = dist.submit(any_peer());
        dist.stats().await.unwrap();
        assert!(!pending.cancel().await);
        let stats = dist.stats().await.unwrap();
        assert_eq!(stats, DistributorStats { pending: 0, in_flight: 0 });
        assert_eq!(dist.peers().get(&id(1)).unwrap().load, 0);
    }

    #[tokio::test]
    async fn dropping_pending_handle_withdraws() {
        let (dist, _shutdown) = spawn();
        drop(dist.submit(any_peer()));
        assert_eq!(dist.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn unregister_revokes_assignments() {
        let (dist, _shutdown) = spawn();
        dist.register_peer(Peer::new(id(1), 2, 2)).await.unwrap();
        let mut assignment = dist.submit(any_peer()).await.unwrap();

        dist.unregister_peer(id(1)).await.unwrap();
        assignment.revoked().await;
        assert_eq!(dist.stats().await.unwrap().in_flight, 0);
        assert!(dist.peers().is_empty());

        assert_eq!(
            dist.unregister_peer(id(1)).await,
            Err(DistributorError::PeerSet(PeerSetError::UnknownPeer(id(1))))
        );
    }

    #[tokio::test]
    async fn prefers_lower_load_ratio_then_quality() {
        let (dist, _shutdown) = spawn();
        dist.register_peer_with_quality(Peer::new(id(1), 2, 4), Quality::new(0.9))
            .await
            .unwrap();
        dist.register_peer_with_quality(Peer::new(id(2), 2, 4), Quality::new(0.6))
            .await
            .unwrap();

        let first = dist.submit(any_peer()).await.unwrap();
        assert_eq!(first.peer().id, id(1));
        // Peer 1 is now at 1/4, peer 2 idle.
        let second = dist.submit(any_peer()).await.unwrap();
        assert_eq!(second.peer().id, id(2));
    }

    #[tokio::test]
    async fn duplicate_registration_is_reported() {
        let (dist, _shutdown) = spawn();
        let mut events = dist.subscribe();
        dist.register_peer(Peer::new(id(1), 2, 1)).await.unwrap();
        assert_eq!(
            dist.register_peer(Peer::new(id(1), 2, 1)).await,
            Err(DistributorError::PeerSet(PeerSetError::DuplicatePeer(id(1))))
        );
        assert_eq!(events.recv().await.unwrap(), PeerEvent::Registered(id(1)));
        assert_eq!(dist.peers().len(), 1);
    }

    #[tokio::test]
    async fn handles_fail_after_shutdown() {
        let (dist, shutdown) = spawn();
        shutdown.send(()).unwrap();
        let pending = dist.submit(any_peer());
        assert_eq!(pending.await.unwrap_err(), DistributorError::Closed);
    }
}
