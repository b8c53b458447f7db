//! Retrieve manager — drives one logical fetch to completion.
//!
//! The manager task owns two tables: fetches in flight, keyed by the request
//! itself so identical concurrent fetches share one, and response slots,
//! keyed by `req_id` so replies find the attempt that is waiting for them.
//!
//! Each fetch runs in its own task as a small state machine:
//!
//!   Queued ── assigned ──▶ Sent ── valid ──▶ Done
//!     ▲                     │
//!     └── rejected / timed out / peer gone ──┘
//!
//! A rejected or timed-out peer is never asked again for the same fetch.
//! The fetch gives up with `RetriesExhausted` after `max_attempts` peers
//! or when nobody untried is left to ask. Passing the latest caller
//! deadline ends it the same way.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use lumen_core::config::RetrieveConfig;
use lumen_core::{NodeId, Request, RequestKind, RequestMessage};

use crate::distributor::{Assignment, DistRequest, RequestDistributor};
use crate::peer_set::{Peer, PeerSnapshot, PeerStatus};
use crate::score::Outcome;
use crate::transport::Transport;
use crate::validate::{Validator, ValidatorSet, Verdict};

/// One scored interaction, forwarded to whoever tracks server reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFeedback {
    pub peer: NodeId,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrieveStats {
    /// Distinct fetches in flight.
    pub fetches: usize,
    /// Attempts waiting for a response.
    pub awaiting: usize,
}

type FetchResult = Result<Bytes, RetrieveError>;

enum Command {
    Fetch {
        request: Request,
        deadline: Instant,
        reply: oneshot::Sender<Joined>,
    },
    Abandon {
        request: Request,
    },
    Finished {
        request: Request,
        fetch_id: u64,
        result: FetchResult,
    },
    Expect {
        req_id: u64,
        peer: NodeId,
        slot: oneshot::Sender<Bytes>,
    },
    Forget {
        req_id: u64,
    },
    Deliver {
        peer: NodeId,
        req_id: u64,
        payload: Bytes,
    },
    Stats {
        reply: oneshot::Sender<RetrieveStats>,
    },
}

/// A caller's place on a fetch: where the result arrives, and how many
/// peers have been asked so far.
struct Joined {
    result: oneshot::Receiver<FetchResult>,
    attempts: watch::Receiver<u32>,
}

/// What every fetch task needs, shared read-only.
struct FetchContext {
    config: RetrieveConfig,
    distributor: RequestDistributor,
    transport: Arc<dyn Transport>,
    validators: ValidatorSet,
    feedback: Option<mpsc::UnboundedSender<PeerFeedback>>,
    next_req_id: AtomicU64,
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RetrieveManager {
    commands: mpsc::UnboundedSender<Command>,
}

impl RetrieveManager {
    /// Build a handle and its backing task. The caller spawns `run`.
    pub fn new(
        config: RetrieveConfig,
        distributor: RequestDistributor,
        transport: Arc<dyn Transport>,
        validators: ValidatorSet,
        feedback: Option<mpsc::UnboundedSender<PeerFeedback>>,
    ) -> (Self, RetrieveActor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = RetrieveActor {
            ctx: Arc::new(FetchContext {
                config,
                distributor,
                transport,
                validators,
                feedback,
                next_req_id: AtomicU64::new(1),
            }),
            fetches: HashMap::new(),
            expected: HashMap::new(),
            next_fetch_id: 0,
            commands: rx,
            self_tx: tx.downgrade(),
        };
        (Self { commands: tx }, actor)
    }

    /// Build and spawn on the current runtime.
    pub fn spawn(
        config: RetrieveConfig,
        distributor: RequestDistributor,
        transport: Arc<dyn Transport>,
        validators: ValidatorSet,
        feedback: Option<mpsc::UnboundedSender<PeerFeedback>>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (handle, actor) = Self::new(config, distributor, transport, validators, feedback);
        tokio::spawn(async move {
            if let Err(e) = actor.run(shutdown).await {
                tracing::error!(error = %e, "retrieve manager failed");
            }
        });
        handle
    }

    /// Fetch and validate `request`, retrying across peers until it
    /// succeeds, attempts run out, or `deadline` passes.
    ///
    /// Dropping the returned future abandons this caller's interest; the
    /// underlying fetch is stopped once no caller is left.
    pub async fn fetch(&self, request: Request, deadline: Instant) -> Result<Bytes, RetrieveError> {
        let (reply, joined) = oneshot::channel();
        self.commands
            .send(Command::Fetch {
                request: request.clone(),
                deadline,
                reply,
            })
            .map_err(|_| RetrieveError::Shutdown)?;
        Waiter {
            request,
            commands: self.commands.clone(),
            attempts: None,
            done: false,
        }
        .wait(joined, deadline)
        .await
    }

    /// Hand a response from `peer` to the attempt waiting on `req_id`.
    pub fn deliver(&self, peer: NodeId, req_id: u64, payload: Bytes) {
        let _ = self.commands.send(Command::Deliver {
            peer,
            req_id,
            payload,
        });
    }

    pub async fn stats(&self) -> Result<RetrieveStats, RetrieveError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .map_err(|_| RetrieveError::Shutdown)?;
        rx.await.map_err(|_| RetrieveError::Shutdown)
    }
}

/// A caller waiting on a (possibly shared) fetch. Tells the manager when it
/// leaves early.
struct Waiter {
    request: Request,
    commands: mpsc::UnboundedSender<Command>,
    attempts: Option<watch::Receiver<u32>>,
    done: bool,
}

impl Waiter {
    async fn wait(mut self, joined: oneshot::Receiver<Joined>, deadline: Instant) -> FetchResult {
        // The result slot lives inside this future, so it is closed by the
        // time `Drop` tells the manager we left.
        let outcome = tokio::time::timeout_at(deadline, async {
            let Ok(joined) = joined.await else {
                return Err(RetrieveError::Shutdown);
            };
            self.attempts = Some(joined.attempts);
            joined.result.await.unwrap_or(Err(RetrieveError::Shutdown))
        })
        .await;
        match outcome {
            Ok(result) => {
                self.done = true;
                result
            }
            Err(_) => Err(RetrieveError::RetriesExhausted {
                attempts: self.attempts.as_ref().map_or(0, |a| *a.borrow()),
            }),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.commands.send(Command::Abandon {
                request: self.request.clone(),
            });
        }
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct InFlight {
    fetch_id: u64,
    waiters: Vec<oneshot::Sender<FetchResult>>,
    attempts: watch::Receiver<u32>,
    /// Latest deadline among the callers. The task runs until then.
    deadline: watch::Sender<Instant>,
    task: AbortHandle,
}

struct Expected {
    peer: NodeId,
    slot: oneshot::Sender<Bytes>,
}

pub struct RetrieveActor {
    ctx: Arc<FetchContext>,
    fetches: HashMap<Request, InFlight>,
    expected: HashMap<u64, Expected>,
    next_fetch_id: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
}

impl RetrieveActor {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        tracing::info!("retrieve manager starting");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(in_flight = self.fetches.len(), "retrieve manager shutting down");
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                }
            }
        }
        for (_, fetch) in self.fetches.drain() {
            fetch.task.abort();
        }
        Ok(())
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Fetch {
                request,
                deadline,
                reply,
            } => self.start(request, deadline, reply),

            Command::Abandon { request } => {
                if let Some(fetch) = self.fetches.get_mut(&request) {
                    fetch.waiters.retain(|w| !w.is_closed());
                    if fetch.waiters.is_empty() {
                        tracing::debug!(kind = ?request.kind(), "all callers gone, stopping fetch");
                        fetch.task.abort();
                        self.fetches.remove(&request);
                    }
                }
            }

            Command::Finished {
                request,
                fetch_id,
                result,
            } => {
                // A newer fetch for the same request may have replaced an
                // aborted one.
                if self.fetches.get(&request).map(|f| f.fetch_id) != Some(fetch_id) {
                    return;
                }
                if let Some(fetch) = self.fetches.remove(&request) {
                    for waiter in fetch.waiters {
                        let _ = waiter.send(result.clone());
                    }
                }
            }

            Command::Expect { req_id, peer, slot } => {
                self.expected.insert(req_id, Expected { peer, slot });
            }

            Command::Forget { req_id } => {
                self.expected.remove(&req_id);
            }

            Command::Deliver {
                peer,
                req_id,
                payload,
            } => match self.expected.get(&req_id).map(|e| e.peer) {
                None => {
                    tracing::debug!(peer = %peer, req_id, "dropping response to unknown request");
                }
                Some(expected) if expected != peer => {
                    tracing::debug!(
                        peer = %peer,
                        expected = %expected,
                        req_id,
                        "dropping response from wrong peer"
                    );
                }
                Some(_) => {
                    if let Some(expected) = self.expected.remove(&req_id) {
                        let _ = expected.slot.send(payload);
                    }
                }
            },

            Command::Stats { reply } => {
                let _ = reply.send(RetrieveStats {
                    fetches: self.fetches.len(),
                    awaiting: self.expected.len(),
                });
            }
        }
    }

    fn start(&mut self, request: Request, deadline: Instant, reply: oneshot::Sender<Joined>) {
        let (result_tx, result) = oneshot::channel();
        if let Some(fetch) = self.fetches.get_mut(&request) {
            tracing::trace!(kind = ?request.kind(), "joining fetch in flight");
            fetch.deadline.send_if_modified(|latest| {
                let later = deadline > *latest;
                if later {
                    *latest = deadline;
                }
                later
            });
            fetch.waiters.push(result_tx);
            let _ = reply.send(Joined {
                result,
                attempts: fetch.attempts.clone(),
            });
            return;
        }

        let kind = request.kind();
        let (validator, commands) = match (self.ctx.validators.get(kind), self.self_tx.upgrade()) {
            (Some(validator), Some(commands)) => (validator, commands),
            (None, _) => return refuse(reply, RetrieveError::NoValidator(kind)),
            (_, None) => return refuse(reply, RetrieveError::Shutdown),
        };

        let fetch_id = self.next_fetch_id;
        self.next_fetch_id += 1;

        let (progress, attempts) = watch::channel(0);
        let (deadline_tx, deadline_rx) = watch::channel(deadline);
        let fetch = Fetch {
            ctx: self.ctx.clone(),
            validator,
            request: request.clone(),
            commands: commands.clone(),
            tried: HashSet::new(),
            attempts: 0,
            progress,
        };
        let key = request.clone();
        let task = tokio::spawn(async move {
            let result = fetch.run_until(deadline_rx).await;
            let _ = commands.send(Command::Finished {
                request: key,
                fetch_id,
                result,
            });
        });

        self.fetches.insert(
            request,
            InFlight {
                fetch_id,
                waiters: vec![result_tx],
                attempts: attempts.clone(),
                deadline: deadline_tx,
                task: task.abort_handle(),
            },
        );
        let _ = reply.send(Joined { result, attempts });
    }
}

/// Answer a caller straight away, without starting a fetch.
fn refuse(reply: oneshot::Sender<Joined>, error: RetrieveError) {
    let (result_tx, result) = oneshot::channel();
    let _ = result_tx.send(Err(error));
    let _ = reply.send(Joined {
        result,
        attempts: watch::channel(0).1,
    });
}

// ── Fetch state machine ───────────────────────────────────────────────────────

enum FetchState {
    Queued,
    Sent {
        assignment: Assignment,
        req_id: u64,
        response: oneshot::Receiver<Bytes>,
        _slot: ExpectGuard,
        sent_at: Instant,
    },
}

struct Fetch {
    ctx: Arc<FetchContext>,
    validator: Arc<dyn Validator>,
    request: Request,
    commands: mpsc::UnboundedSender<Command>,
    tried: HashSet<NodeId>,
    attempts: u32,
    progress: watch::Sender<u32>,
}

impl Fetch {
    /// Run until done or until the deadline passes. Callers joining later
    /// can push the deadline out.
    async fn run_until(self, mut deadline: watch::Receiver<Instant>) -> FetchResult {
        let attempts = self.progress.subscribe();
        let run = self.run();
        tokio::pin!(run);
        loop {
            let until = *deadline.borrow_and_update();
            tokio::select! {
                result = &mut run => return result,

                _ = tokio::time::sleep_until(until) => {
                    let attempts = *attempts.borrow();
                    tracing::debug!(attempts, "fetch deadline passed");
                    return Err(RetrieveError::RetriesExhausted { attempts });
                }

                Ok(()) = deadline.changed() => {}
            }
        }
    }

    async fn run(mut self) -> FetchResult {
        let mut state = FetchState::Queued;
        loop {
            state = match state {
                FetchState::Queued => {
                    if self.attempts >= self.ctx.config.max_attempts {
                        tracing::debug!(kind = ?self.request.kind(), attempts = self.attempts, "retries exhausted");
                        return Err(RetrieveError::RetriesExhausted {
                            attempts: self.attempts,
                        });
                    }
                    let ctx = self.ctx.clone();
                    let pending = ctx.distributor.submit(self.dist_request());
                    let out_of_peers = ctx.distributor.wait_for(self.out_of_peers());
                    tokio::select! {
                        assignment = pending => {
                            let assignment = assignment.map_err(|_| RetrieveError::Shutdown)?;
                            self.send(assignment).await
                        }

                        Ok(_) = out_of_peers => {
                            tracing::debug!(kind = ?self.request.kind(), attempts = self.attempts, "no untried peer left");
                            return Err(RetrieveError::RetriesExhausted {
                                attempts: self.attempts,
                            });
                        }
                    }
                }

                FetchState::Sent {
                    mut assignment,
                    req_id,
                    mut response,
                    _slot,
                    sent_at,
                } => {
                    let peer = assignment.peer().id;
                    let timer = tokio::time::sleep(self.ctx.config.request_timeout());
                    tokio::select! {
                        payload = &mut response => {
                            let Ok(payload) = payload else {
                                return Err(RetrieveError::Shutdown);
                            };
                            drop(assignment);
                            match self.validator.validate(&self.request, &payload) {
                                Verdict::Accept(value) => {
                                    let rtt = sent_at.elapsed();
                                    tracing::debug!(peer = %peer, req_id, ?rtt, "response accepted");
                                    self.report(peer, Outcome::Success { rtt }).await;
                                    return Ok(value);
                                }
                                Verdict::Reject(reason) => {
                                    tracing::debug!(peer = %peer, req_id, %reason, "response rejected");
                                    self.report(peer, Outcome::Rejected).await;
                                    FetchState::Queued
                                }
                            }
                        }

                        _ = assignment.revoked() => {
                            // Lost the peer, not its fault: this attempt does not count.
                            tracing::debug!(peer = %peer, req_id, "peer went away, re-queueing");
                            self.attempts = self.attempts.saturating_sub(1);
                            self.progress.send_replace(self.attempts);
                            FetchState::Queued
                        }

                        _ = timer => {
                            drop(assignment);
                            tracing::debug!(peer = %peer, req_id, "request timed out");
                            self.report(peer, Outcome::TimedOut).await;
                            FetchState::Queued
                        }
                    }
                }
            };
        }
    }

    /// Eligible: not yet tried by this fetch, and far enough along the
    /// chain to answer.
    fn dist_request(&self) -> DistRequest {
        let tried = self.tried.clone();
        let request = self.request.clone();
        let kind = self.request.kind();
        DistRequest::new(
            move |status: &PeerStatus| {
                !tried.contains(&status.peer.id) && status.peer.can_serve(&request)
            },
            move |peer: &Peer| peer.request_cost(kind),
        )
    }

    /// True once some peer has been asked and no registered peer is left
    /// that could still be. Before the first attempt the fetch waits for
    /// servers to show up.
    fn out_of_peers(&self) -> impl FnMut(&PeerSnapshot) -> bool + Send + 'static {
        let tried = self.tried.clone();
        let request = self.request.clone();
        let attempted = self.attempts > 0;
        move |peers: &PeerSnapshot| {
            attempted
                && !peers
                    .iter()
                    .any(|s| !tried.contains(&s.peer.id) && s.peer.can_serve(&request))
        }
    }

    async fn send(&mut self, assignment: Assignment) -> FetchState {
        let peer = assignment.peer().id;
        let req_id = self.ctx.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (slot, response) = oneshot::channel();
        // Registered before the message leaves, so a fast reply is not lost.
        let guard = ExpectGuard::register(&self.commands, req_id, peer, slot);

        self.attempts += 1;
        self.progress.send_replace(self.attempts);
        self.tried.insert(peer);

        let message = RequestMessage {
            req_id,
            request: self.request.clone(),
        };
        match self.ctx.transport.send(&peer, message) {
            Ok(()) => {
                tracing::debug!(peer = %peer, req_id, attempt = self.attempts, "request sent");
                FetchState::Sent {
                    assignment,
                    req_id,
                    response,
                    _slot: guard,
                    sent_at: Instant::now(),
                }
            }
            Err(e) => {
                tracing::warn!(peer = %peer, req_id, error = %e, "send failed");
                drop(assignment);
                self.report(peer, Outcome::Rejected).await;
                FetchState::Queued
            }
        }
    }

    async fn report(&self, peer: NodeId, outcome: Outcome) {
        if let Some(feedback) = &self.ctx.feedback {
            let _ = feedback.send(PeerFeedback { peer, outcome });
        }
        match self.ctx.distributor.report(peer, outcome).await {
            Ok(report) => {
                let threshold = self.ctx.config.timeout_eviction_threshold;
                if outcome == Outcome::TimedOut
                    && threshold > 0
                    && report.consecutive_timeouts >= threshold
                {
                    tracing::info!(
                        peer = %peer,
                        timeouts = report.consecutive_timeouts,
                        "evicting unresponsive peer"
                    );
                    let _ = self.ctx.distributor.unregister_peer(peer).await;
                }
            }
            Err(e) => tracing::debug!(peer = %peer, error = %e, "outcome not recorded"),
        }
    }
}

/// Response slot registration. Dropping it forgets the slot.
struct ExpectGuard {
    req_id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl ExpectGuard {
    fn register(
        commands: &mpsc::UnboundedSender<Command>,
        req_id: u64,
        peer: NodeId,
        slot: oneshot::Sender<Bytes>,
    ) -> Self {
        let _ = commands.send(Command::Expect { req_id, peer, slot });
        Self {
            req_id,
            commands: commands.clone(),
        }
    }
}

impl Drop for ExpectGuard {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Forget { req_id: self.req_id });
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrieveError {
    /// The fetch gave up. `attempts` is how many peers were asked.
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("no validator registered for {0:?} requests")]
    NoValidator(RequestKind),

    #[error("retrieval layer has shut down")]
    Shutdown,
}
