//! Server pool — finds servers, vets them, and keeps the peer set stocked.
//!
//! Candidates come from a discovery stream, configured bootnodes, and the
//! servers remembered from the last run. Each goes through the same
//! admission pipeline before anything is sent to it:
//!
//!   discovered → dialing → validating → active
//!        ▲          │           │          │
//!        └─── re-dial due ──────┴──────────┴──▶ dropped
//!
//! Dialing covers connect + handshake (server mode, protocol version,
//! identity). Validating asks for the header the server claims as its head
//! and checks the answer like any other response. Promotion registers the
//! server with the distributor. Retrieval feedback keeps scoring it after
//! that, and a server whose quality sinks below the floor is evicted.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;

use lumen_core::config::{PoolConfig, ScoreConfig};
use lumen_core::wire::WireError;
use bytes::Bytes;
use lumen_core::{Announcement, NodeId, Request, RequestKind};

use crate::distributor::{DistributorError, RequestDistributor};
use crate::peer_set::{Peer, PeerEvent, PeerSetError};
use crate::redial::RedialSchedule;
use crate::retrieve::PeerFeedback;
use crate::score::{Outcome, Quality};
use crate::validate::{header_validator, Validator, ValidatorSet, Verdict};

// ── Addresses and entries ─────────────────────────────────────────────────────

/// Where to reach a server: `hexid@host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    pub id: NodeId,
    pub endpoint: String,
}

impl NodeAddr {
    pub fn new(id: NodeId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", hex::encode(self.id.0), self.endpoint)
    }
}

impl FromStr for NodeAddr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WireError::InvalidAddress(s.to_string());
        let (id, endpoint) = s.split_once('@').ok_or_else(invalid)?;
        let id: NodeId = id.parse()?;
        let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
        Ok(Self::new(id, endpoint))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Discovered,
    Dialing,
    Validating,
    Active,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub addr: NodeAddr,
    pub quality: Quality,
    pub discovered_at: Instant,
    pub state: EntryState,
    /// Was active at some point. Only these are remembered across restarts.
    pub promoted: bool,
}

impl PoolEntry {
    fn new(addr: NodeAddr, quality: Quality) -> Self {
        Self {
            addr,
            quality,
            discovered_at: Instant::now(),
            state: EntryState::Discovered,
            promoted: false,
        }
    }
}

/// On-disk form of a remembered server.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedServer {
    id: NodeId,
    endpoint: String,
    quality: Quality,
}

// ── Dialer ────────────────────────────────────────────────────────────────────

/// What a server says about itself during the handshake.
#[derive(Debug, Clone)]
pub struct ServerHello {
    pub id: NodeId,
    pub protocol_version: u32,
    /// Offers to serve light clients.
    pub serves: bool,
    pub announcement: Announcement,
    pub max_capacity: u64,
    pub costs: HashMap<RequestKind, u64>,
}

impl ServerHello {
    pub fn into_peer(self) -> Peer {
        let mut peer = Peer::new(self.id, self.protocol_version, self.max_capacity)
            .with_announcement(self.announcement);
        peer.costs = self.costs;
        peer
    }
}

/// Connection establishment, outside this crate.
pub trait Dialer: Send + Sync + 'static {
    /// Connect and handshake.
    fn dial(&self, addr: &NodeAddr) -> BoxFuture<'static, Result<ServerHello, HandshakeError>>;

    /// Send `request` on an established connection and return the raw
    /// answer. The pool validates it.
    fn trial(&self, addr: &NodeAddr, request: Request) -> BoxFuture<'static, Result<Bytes, HandshakeError>>;
}

fn check_hello(addr: &NodeAddr, hello: &ServerHello, min_version: u32) -> Result<(), HandshakeError> {
    if !hello.serves {
        return Err(HandshakeError::NotServer);
    }
    if hello.protocol_version < min_version {
        return Err(HandshakeError::ProtocolVersion {
            got: hello.protocol_version,
            min: min_version,
        });
    }
    if hello.id != addr.id {
        return Err(HandshakeError::IdentityMismatch {
            expected: addr.id,
            got: hello.id,
        });
    }
    Ok(())
}

// ── Handle ────────────────────────────────────────────────────────────────────

enum Command {
    Entries {
        reply: oneshot::Sender<Vec<PoolEntry>>,
    },
    AddCandidate {
        addr: NodeAddr,
    },
}

#[derive(Clone)]
pub struct ServerPool {
    commands: mpsc::UnboundedSender<Command>,
    feedback: mpsc::UnboundedSender<PeerFeedback>,
}

impl ServerPool {
    /// Build a handle and its backing task. The caller spawns `run`.
    ///
    /// Remembered servers and bootnodes are queued immediately.
    pub fn new<S>(
        config: PoolConfig,
        score: ScoreConfig,
        distributor: RequestDistributor,
        dialer: Arc<dyn Dialer>,
        validators: &ValidatorSet,
        discovery: S,
    ) -> (Self, ServerPoolActor)
    where
        S: Stream<Item = NodeAddr> + Send + Unpin + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let events = distributor.subscribe();
        let trial_validator = validators
            .get(RequestKind::Header)
            .unwrap_or_else(|| Arc::new(header_validator) as Arc<dyn Validator>);
        let mut actor = ServerPoolActor {
            redial: RedialSchedule::from_config(&config),
            config,
            score,
            distributor,
            dialer,
            trial_validator,
            discovery: Some(discovery.boxed()),
            entries: HashMap::new(),
            queue: VecDeque::new(),
            stages: JoinSet::new(),
            commands: commands_rx,
            feedback: feedback_rx,
            events,
        };
        actor.load_from_disk();
        actor.queue_bootnodes();
        (
            Self {
                commands: commands_tx,
                feedback: feedback_tx,
            },
            actor,
        )
    }

    /// Build and spawn on the current runtime.
    pub fn spawn<S>(
        config: PoolConfig,
        score: ScoreConfig,
        distributor: RequestDistributor,
        dialer: Arc<dyn Dialer>,
        validators: &ValidatorSet,
        discovery: S,
        shutdown: broadcast::Receiver<()>,
    ) -> Self
    where
        S: Stream<Item = NodeAddr> + Send + Unpin + 'static,
    {
        let (handle, actor) = Self::new(config, score, distributor, dialer, validators, discovery);
        tokio::spawn(async move {
            if let Err(e) = actor.run(shutdown).await {
                tracing::error!(error = %e, "server pool failed");
            }
        });
        handle
    }

    /// Sink for retrieval outcomes. Hand it to the retrieve manager.
    pub fn feedback_sink(&self) -> mpsc::UnboundedSender<PeerFeedback> {
        self.feedback.clone()
    }

    /// All known entries, sorted by id.
    pub async fn entries(&self) -> Result<Vec<PoolEntry>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Entries { reply })
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Ids of the servers currently active.
    pub async fn active(&self) -> Result<Vec<NodeId>, PoolError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.state == EntryState::Active)
            .map(|e| e.addr.id)
            .collect())
    }

    /// Offer a candidate outside of discovery. Known ids are ignored.
    pub fn add_candidate(&self, addr: NodeAddr) -> Result<(), PoolError> {
        self.commands
            .send(Command::AddCandidate { addr })
            .map_err(|_| PoolError::Closed)
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

enum StageOutput {
    Dialed(Result<ServerHello, HandshakeError>),
    Trialled(ServerHello, Result<Duration, HandshakeError>),
}

pub struct ServerPoolActor {
    config: PoolConfig,
    score: ScoreConfig,
    distributor: RequestDistributor,
    dialer: Arc<dyn Dialer>,
    /// Checks the answer to the trial request.
    trial_validator: Arc<dyn Validator>,
    discovery: Option<BoxStream<'static, NodeAddr>>,
    entries: HashMap<NodeId, PoolEntry>,
    /// Discovered entries waiting for a dial slot.
    queue: VecDeque<NodeId>,
    redial: RedialSchedule,
    /// Dials and trials in flight.
    stages: JoinSet<(NodeId, StageOutput)>,
    commands: mpsc::UnboundedReceiver<Command>,
    feedback: mpsc::UnboundedReceiver<PeerFeedback>,
    events: broadcast::Receiver<PeerEvent>,
}

impl ServerPoolActor {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        tracing::info!(
            known = self.entries.len(),
            target = self.config.target_active,
            "server pool starting"
        );
        let period = self.config.maintenance_interval();
        let mut maintenance = tokio::time::interval_at(Instant::now() + period, period);
        let mut discovery = self.discovery.take();
        let mut events_open = true;
        self.start_stages();

        loop {
            let wants_more = discovery.is_some()
                && self.queue.len() < self.config.max_concurrent_dials
                && self.active_count() < self.config.target_active;

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(active = self.active_count(), "server pool shutting down");
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(Command::Entries { reply }) => {
                        let mut entries: Vec<PoolEntry> = self.entries.values().cloned().collect();
                        entries.sort_by(|a, b| a.addr.id.cmp(&b.addr.id));
                        let _ = reply.send(entries);
                    }
                    Some(Command::AddCandidate { addr }) => self.add_candidate(addr),
                    None => break,
                },

                next = next_candidate(&mut discovery), if wants_more => match next {
                    Some(addr) => self.add_candidate(addr),
                    None => {
                        tracing::debug!("discovery exhausted");
                        discovery = None;
                    }
                },

                Some(joined) = self.stages.join_next(), if !self.stages.is_empty() => match joined {
                    Ok((id, output)) => self.on_stage(id, output).await,
                    Err(e) => tracing::warn!(error = %e, "admission task failed"),
                },

                Some(feedback) = self.feedback.recv() => self.on_feedback(feedback).await,

                event = self.events.recv(), if events_open => match event {
                    Ok(PeerEvent::Unregistered(id)) => self.on_disconnect(id),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "peer events lagged, resyncing");
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },

                _ = maintenance.tick() => self.maintain(),
            }

            self.start_stages();
        }

        self.stages.abort_all();
        self.save_to_disk();
        Ok(())
    }

    fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Active)
            .count()
    }

    fn add_candidate(&mut self, addr: NodeAddr) {
        if self.entries.contains_key(&addr.id) {
            return;
        }
        tracing::debug!(peer = %addr.id, endpoint = %addr.endpoint, "candidate discovered");
        let id = addr.id;
        self.entries
            .insert(id, PoolEntry::new(addr, Quality::initial(&self.score)));
        self.queue.push_back(id);
    }

    /// Start dials from the queue while there are free slots and the pool
    /// is short of its target.
    fn start_stages(&mut self) {
        while self.stages.len() < self.config.max_concurrent_dials
            && self.active_count() + self.stages.len() < self.config.target_active
        {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.state != EntryState::Discovered {
                continue;
            }
            entry.state = EntryState::Dialing;

            let dialer = self.dialer.clone();
            let addr = entry.addr.clone();
            let timeout = self.config.dial_timeout();
            let min_version = self.config.min_protocol_version;
            tracing::debug!(peer = %id, endpoint = %addr.endpoint, "dialing");
            self.stages.spawn(async move {
                let result = match tokio::time::timeout(timeout, dialer.dial(&addr)).await {
                    Ok(Ok(hello)) => check_hello(&addr, &hello, min_version).map(|()| hello),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(HandshakeError::TimedOut),
                };
                (addr.id, StageOutput::Dialed(result))
            });
        }
    }

    async fn on_stage(&mut self, id: NodeId, output: StageOutput) {
        match output {
            StageOutput::Dialed(Ok(hello)) => {
                let Some(entry) = self.entries.get_mut(&id) else {
                    return;
                };
                entry.state = EntryState::Validating;
                let dialer = self.dialer.clone();
                let validator = self.trial_validator.clone();
                let addr = entry.addr.clone();
                let timeout = self.config.trial_timeout();
                let request = Request::Header {
                    number: hello.announcement.head_number,
                };
                tracing::debug!(peer = %id, head = hello.announcement.head_number, "trial request");
                self.stages.spawn(async move {
                    let started = Instant::now();
                    let answer = tokio::time::timeout(timeout, dialer.trial(&addr, request.clone())).await;
                    let rtt = started.elapsed();
                    let result = match answer {
                        Ok(Ok(payload)) => match validator.validate(&request, &payload) {
                            Verdict::Accept(_) => Ok(rtt),
                            Verdict::Reject(reason) => Err(HandshakeError::TrialFailed(reason.to_string())),
                        },
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(HandshakeError::TimedOut),
                    };
                    (addr.id, StageOutput::Trialled(hello, result))
                });
            }
            StageOutput::Trialled(hello, Ok(rtt)) => self.promote(id, hello, rtt).await,
            StageOutput::Dialed(Err(e)) | StageOutput::Trialled(_, Err(e)) => {
                tracing::warn!(peer = %id, error = %e, "handshake failed");
                self.drop_entry(id);
            }
        }
    }

    async fn promote(&mut self, id: NodeId, hello: ServerHello, rtt: Duration) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.quality.observe(&Outcome::Success { rtt }, &self.score);
        let quality = entry.quality;
        let result = self
            .distributor
            .register_peer_with_quality(hello.into_peer(), quality)
            .await;
        match result {
            Ok(()) | Err(DistributorError::PeerSet(PeerSetError::DuplicatePeer(_))) => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.state = EntryState::Active;
                    entry.promoted = true;
                }
                self.redial.clear(&id);
                tracing::info!(peer = %id, quality = quality.value(), ?rtt, "server promoted");
                self.save_to_disk();
            }
            Err(e) => {
                tracing::warn!(peer = %id, error = %e, "could not register server");
                self.drop_entry(id);
            }
        }
    }

    fn drop_entry(&mut self, id: NodeId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = EntryState::Dropped;
            match self.redial.failed(id) {
                Some(wait) => tracing::debug!(peer = %id, ?wait, "re-dial scheduled"),
                None => tracing::debug!(peer = %id, "giving up on server"),
            }
        }
    }

    async fn on_feedback(&mut self, feedback: PeerFeedback) {
        let Some(entry) = self.entries.get_mut(&feedback.peer) else {
            return;
        };
        entry.quality.observe(&feedback.outcome, &self.score);
        if entry.state != EntryState::Active || !entry.quality.is_below(self.score.floor) {
            return;
        }
        tracing::info!(
            peer = %feedback.peer,
            quality = entry.quality.value(),
            "evicting low-quality server"
        );
        self.drop_entry(feedback.peer);
        if let Err(e) = self.distributor.unregister_peer(feedback.peer).await {
            tracing::debug!(peer = %feedback.peer, error = %e, "server already gone");
        }
        self.save_to_disk();
    }

    fn on_disconnect(&mut self, id: NodeId) {
        let active = self
            .entries
            .get(&id)
            .is_some_and(|e| e.state == EntryState::Active);
        if active {
            tracing::info!(peer = %id, "server disconnected");
            self.drop_entry(id);
        }
    }

    /// Reconcile active entries with the distributor after missing events.
    fn resync(&mut self) {
        let peers = self.distributor.peers();
        let gone: Vec<NodeId> = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::Active && !peers.contains(&e.addr.id))
            .map(|e| e.addr.id)
            .collect();
        for id in gone {
            self.on_disconnect(id);
        }
    }

    fn maintain(&mut self) {
        let below_target = self.active_count() < self.config.target_active;
        let mut forget = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if entry.state != EntryState::Dropped {
                continue;
            }
            if self.redial.is_given_up(id) {
                forget.push(*id);
            } else if below_target && self.redial.is_due(id) {
                entry.state = EntryState::Discovered;
                self.queue.push_back(*id);
            }
        }
        for id in &forget {
            tracing::debug!(peer = %id, "forgetting server");
            self.entries.remove(id);
            self.redial.clear(id);
        }
        tracing::debug!(
            entries = self.entries.len(),
            active = self.active_count(),
            queued = self.queue.len(),
            forgotten = forget.len(),
            "pool maintenance"
        );
        self.save_to_disk();
    }

    fn queue_bootnodes(&mut self) {
        for text in self.config.bootnodes.clone() {
            match text.parse::<NodeAddr>() {
                Ok(addr) => self.add_candidate(addr),
                Err(e) => tracing::warn!(error = %e, "ignoring bootnode"),
            }
        }
    }
}

async fn next_candidate(discovery: &mut Option<BoxStream<'static, NodeAddr>>) -> Option<NodeAddr> {
    match discovery {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

// ── Persistence ───────────────────────────────────────────────────────────────

impl ServerPoolActor {
    /// Write every server that was ever promoted. Failures are logged and ignored.
    fn save_to_disk(&self) {
        let Some(path) = self.config.persist_path.as_deref() else {
            return;
        };
        let mut servers: Vec<PersistedServer> = self
            .entries
            .values()
            .filter(|e| e.promoted)
            .map(|e| PersistedServer {
                id: e.addr.id,
                endpoint: e.addr.endpoint.clone(),
                quality: e.quality,
            })
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        match serde_json::to_string_pretty(&servers) {
            Ok(json) => {
                if let Some(dir) = path.parent() {
                    if let Err(e) = std::fs::create_dir_all(dir) {
                        tracing::warn!(error = %e, path = %dir.display(), "failed to create pool directory");
                        return;
                    }
                }
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist server pool");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize server pool");
            }
        }
    }

    /// Reload remembered servers as fresh candidates. They are dialled and
    /// trialled again before being used.
    fn load_from_disk(&mut self) {
        let Some(path) = self.config.persist_path.clone() else {
            return;
        };
        let servers = match read_persisted(&path) {
            Ok(Some(servers)) => servers,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to load server pool");
                return;
            }
        };
        let count = servers.len();
        for server in servers {
            let addr = NodeAddr::new(server.id, server.endpoint);
            let id = addr.id;
            let mut entry = PoolEntry::new(addr, server.quality);
            entry.promoted = true;
            self.entries.insert(id, entry);
            self.queue.push_back(id);
        }
        if count > 0 {
            tracing::info!(count, path = %path.display(), "loaded remembered servers");
        }
    }
}

fn read_persisted(path: &Path) -> anyhow::Result<Option<Vec<PersistedServer>>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&text)?))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("node does not serve light clients")]
    NotServer,

    #[error("protocol version {got} below minimum {min}")]
    ProtocolVersion { got: u32, min: u32 },

    #[error("expected node {expected}, handshake came from {got}")]
    IdentityMismatch { expected: NodeId, got: NodeId },

    #[error("trial request failed: {0}")]
    TrialFailed(String),

    #[error("timed out")]
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("server pool has shut down")]
    Closed,
}
