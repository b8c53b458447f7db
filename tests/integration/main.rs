//! Lumen integration test harness.
//!
//! Brings up the whole retrieval layer (distributor, retrieve manager,
//! server pool, ODR) against a simulated network of servers. Everything
//! is in memory and runs on tokio's paused clock, so timeouts and
//! back-offs cost no wall time.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=lumen_services=debug to watch the request flow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};

use lumen_core::{content_hash, Announcement, Hash, Header, LumenConfig, NodeId, Request, RequestMessage};
use lumen_services::{
    ChannelTransport, Dialer, HandshakeError, LightService, NodeAddr, RetrieveManager, ServerHello,
    ValidatorSet,
};

mod pool;
mod retrieval;

// ── Harness ───────────────────────────────────────────────────────────────────

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn node(n: u8) -> NodeId {
    NodeId([n; 32])
}

/// How a simulated server behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Honest,
    /// Answers with bytes that fail validation.
    Corrupt,
    /// Takes requests, never answers.
    Silent,
    /// Answers correctly after a delay.
    Slow(Duration),
    /// Refuses connections.
    Unreachable,
    /// Handshakes, then answers the trial with its parent header.
    FailsTrial,
}

/// The chain every honest server serves from.
pub struct Chain {
    pub headers: Vec<Header>,
    /// Content-addressed code and trie nodes.
    pub blobs: HashMap<Hash, Vec<u8>>,
}

impl Chain {
    pub fn new(length: u64) -> Self {
        let mut headers = Vec::new();
        let mut parent = [0u8; 32];
        for number in 0..length {
            let header = Header {
                number,
                parent_hash: parent,
                state_root: content_hash(&number.to_be_bytes()),
                receipts_root: [0; 32],
            };
            parent = header.hash();
            headers.push(header);
        }
        let blobs = (0..16u8)
            .map(|i| {
                let blob = vec![i; 32 + i as usize];
                (content_hash(&blob), blob)
            })
            .collect();
        Self { headers, blobs }
    }

    pub fn head(&self) -> Announcement {
        let last = self.headers.last();
        Announcement {
            head_number: last.map_or(0, |h| h.number),
            head_hash: last.map_or([0; 32], Header::hash),
            total_difficulty: self.headers.len() as u64,
        }
    }

    /// Blob hashes in a fixed order.
    pub fn code_hashes(&self) -> Vec<Hash> {
        let mut hashes: Vec<Hash> = self.blobs.keys().copied().collect();
        hashes.sort();
        hashes
    }

    fn answer(&self, request: &Request) -> Vec<u8> {
        match request {
            Request::Header { number } => self
                .headers
                .get(*number as usize)
                .map(Header::encode)
                .unwrap_or_default(),
            Request::TrieNode { node_hash: hash, .. } | Request::Code { code_hash: hash } => {
                self.blobs.get(hash).cloned().unwrap_or_default()
            }
            Request::Receipts { .. } => b"[]".to_vec(),
        }
    }
}

/// Simulated servers. Acts as the dialer, and answers whatever the
/// transport sends out.
pub struct SimNet {
    chain: Arc<Chain>,
    servers: HashMap<NodeId, Behaviour>,
    sent: Mutex<HashMap<NodeId, usize>>,
    dials: Mutex<HashMap<NodeId, usize>>,
}

impl SimNet {
    pub fn new(chain: Arc<Chain>, servers: impl IntoIterator<Item = (u8, Behaviour)>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            servers: servers.into_iter().map(|(n, b)| (node(n), b)).collect(),
            sent: Mutex::new(HashMap::new()),
            dials: Mutex::new(HashMap::new()),
        })
    }

    pub fn addrs(&self) -> Vec<NodeAddr> {
        let mut addrs: Vec<NodeAddr> = self
            .servers
            .keys()
            .map(|id| NodeAddr::new(*id, format!("10.0.0.{}:30303", id.0[0])))
            .collect();
        addrs.sort_by(|a, b| a.id.cmp(&b.id));
        addrs
    }

    pub fn sent_to(&self, id: NodeId) -> usize {
        self.sent.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn sent_total(&self) -> usize {
        self.sent.lock().unwrap().values().sum()
    }

    pub fn dials(&self) -> usize {
        self.dials.lock().unwrap().values().sum()
    }

    /// Answer outbound requests until the transport closes.
    pub fn serve(
        self: &Arc<Self>,
        mut outbound: mpsc::UnboundedReceiver<(NodeId, RequestMessage)>,
        retriever: RetrieveManager,
    ) {
        let net = self.clone();
        tokio::spawn(async move {
            while let Some((peer, msg)) = outbound.recv().await {
                *net.sent.lock().unwrap().entry(peer).or_default() += 1;
                let behaviour = net.servers.get(&peer).copied().unwrap_or(Behaviour::Silent);
                let (payload, delay) = match behaviour {
                    Behaviour::Honest => (net.chain.answer(&msg.request), Duration::from_millis(20)),
                    Behaviour::Slow(delay) => (net.chain.answer(&msg.request), delay),
                    Behaviour::Corrupt => (b"\xde\xad\xbe\xef".to_vec(), Duration::from_millis(20)),
                    _ => continue,
                };
                let retriever = retriever.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    retriever.deliver(peer, msg.req_id, Bytes::from(payload));
                });
            }
        });
    }
}

impl Dialer for SimNet {
    fn dial(&self, addr: &NodeAddr) -> BoxFuture<'static, Result<ServerHello, HandshakeError>> {
        *self.dials.lock().unwrap().entry(addr.id).or_default() += 1;
        let behaviour = self.servers.get(&addr.id).copied();
        let hello = ServerHello {
            id: addr.id,
            protocol_version: 2,
            serves: true,
            announcement: self.chain.head(),
            max_capacity: 4,
            costs: HashMap::new(),
        };
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            match behaviour {
                None | Some(Behaviour::Unreachable) => {
                    Err(HandshakeError::DialFailed("connection refused".into()))
                }
                Some(_) => Ok(hello),
            }
        }
        .boxed()
    }

    fn trial(&self, addr: &NodeAddr, request: Request) -> BoxFuture<'static, Result<Bytes, HandshakeError>> {
        let request = match (self.servers.get(&addr.id), request) {
            (Some(Behaviour::FailsTrial), Request::Header { number }) => Request::Header {
                number: number.saturating_sub(1),
            },
            (_, request) => request,
        };
        let answer = Bytes::from(self.chain.answer(&request));
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(answer)
        }
        .boxed()
    }
}

/// Config with persistence off.
pub fn test_config() -> LumenConfig {
    let mut config = LumenConfig::default();
    config.pool.persist_path = None;
    config
}

/// A running light service plus the means to stop it.
pub struct LightNode {
    pub svc: LightService,
    pub shutdown: broadcast::Sender<()>,
}

/// Start a light service that discovers every server in `net`.
pub fn start(net: &Arc<SimNet>, config: LumenConfig) -> LightNode {
    start_with_discovery(net, config, net.addrs())
}

pub fn start_with_discovery(net: &Arc<SimNet>, config: LumenConfig, discovered: Vec<NodeAddr>) -> LightNode {
    init_tracing();
    let (shutdown, _) = broadcast::channel(1);
    let (transport, outbound) = ChannelTransport::new();
    let svc = LightService::start(
        config,
        Arc::new(transport),
        net.clone(),
        futures::stream::iter(discovered),
        ValidatorSet::with_defaults(),
        &shutdown,
    );
    net.serve(outbound, svc.retriever.clone());
    LightNode { svc, shutdown }
}

/// Wait until at least `n` servers are registered.
pub async fn wait_active(svc: &LightService, n: usize) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(60), svc.distributor.wait_for(|p| p.len() >= n))
        .await
        .with_context(|| format!("timed out waiting for {n} active servers"))??;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_service_comes_up() -> Result<()> {
    let chain = Arc::new(Chain::new(50));
    let net = SimNet::new(chain.clone(), [(1, Behaviour::Honest), (2, Behaviour::Honest)]);
    let lumen = start(&net, test_config());

    wait_active(&lumen.svc, 2).await?;
    let header = lumen.svc.odr.header(49).await?;
    assert_eq!(header, chain.headers[49]);
    Ok(())
}
