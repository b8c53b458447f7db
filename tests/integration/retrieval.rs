//! Retrieval through the full stack: pool-admitted servers, distributor,
//! retries and validation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::time::Instant;

use lumen_core::Request;
use lumen_services::{PeerEvent, RetrieveError};

use crate::{node, start, test_config, wait_active, Behaviour, Chain, SimNet};

#[tokio::test(start_paused = true)]
async fn test_headers_and_code_from_honest_servers() -> Result<()> {
    let chain = Arc::new(Chain::new(100));
    let net = SimNet::new(
        chain.clone(),
        [(1, Behaviour::Honest), (2, Behaviour::Honest), (3, Behaviour::Honest)],
    );
    let lumen = start(&net, test_config());
    wait_active(&lumen.svc, 3).await?;

    let headers = join_all((0..50).map(|n| lumen.svc.odr.header(n))).await;
    for (n, header) in headers.into_iter().enumerate() {
        assert_eq!(header?, chain.headers[n]);
    }

    for hash in chain.code_hashes() {
        let code = lumen.svc.odr.code(hash).await?;
        assert_eq!(code.as_ref(), chain.blobs[&hash].as_slice());
    }

    assert_eq!(net.sent_total(), 50 + chain.blobs.len());
    // Concurrent load spreads over every server.
    for id in 1..=3 {
        assert!(net.sent_to(node(id)) > 0, "server {id} never used");
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_servers_are_routed_around() -> Result<()> {
    let chain = Arc::new(Chain::new(20));
    let net = SimNet::new(
        chain.clone(),
        [(1, Behaviour::Corrupt), (2, Behaviour::Corrupt), (3, Behaviour::Honest)],
    );
    let lumen = start(&net, test_config());
    wait_active(&lumen.svc, 3).await?;

    for n in 0..10 {
        assert_eq!(lumen.svc.odr.header(n).await?, chain.headers[n as usize]);
    }

    // Every fetch ends at the honest server exactly once.
    assert_eq!(net.sent_to(node(3)), 10);
    // Once penalised, corrupt servers stop being picked first.
    assert!(net.sent_to(node(1)) + net.sent_to(node(2)) < 10);

    let peers = lumen.svc.distributor.peers();
    let honest = peers.get(&node(3)).map(|p| p.quality.value());
    for id in [1, 2] {
        if let (Some(bad), Some(good)) = (peers.get(&node(id)), honest) {
            assert!(bad.quality.value() < good, "server {id} not penalised");
        }
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_identical_fetches_share_one_round_trip() -> Result<()> {
    let chain = Arc::new(Chain::new(10));
    let net = SimNet::new(chain.clone(), [(1, Behaviour::Slow(Duration::from_millis(500)))]);
    let lumen = start(&net, test_config());
    wait_active(&lumen.svc, 1).await?;

    let results = join_all((0..5).map(|_| lumen.svc.odr.header(7))).await;
    for header in results {
        assert_eq!(header?, chain.headers[7]);
    }
    assert_eq!(net.sent_total(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_is_evicted() -> Result<()> {
    let chain = Arc::new(Chain::new(10));
    let net = SimNet::new(chain, [(1, Behaviour::Silent)]);
    let mut config = test_config();
    config.retrieve.request_timeout_ms = 100;
    let lumen = start(&net, config);
    wait_active(&lumen.svc, 1).await?;
    let mut events = lumen.svc.distributor.subscribe();

    let mut outcomes = Vec::new();
    for n in 0..3 {
        let deadline = Instant::now() + Duration::from_secs(1);
        outcomes.push(lumen.svc.odr.fetch(Request::Header { number: n }, deadline).await);
    }
    for outcome in outcomes {
        assert_eq!(outcome, Err(RetrieveError::RetriesExhausted { attempts: 1 }.into()));
    }

    let evicted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(PeerEvent::Unregistered(id)) if id == node(1) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(evicted, "silent server still registered");
    assert!(net.sent_to(node(1)) <= 3);
    Ok(())
}
