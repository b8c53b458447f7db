//! Server pool admission and persistence across restarts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use lumen_services::EntryState;

use crate::{node, start, start_with_discovery, test_config, wait_active, Behaviour, Chain, SimNet};

#[tokio::test(start_paused = true)]
async fn test_pool_admits_only_working_servers() -> Result<()> {
    let chain = Arc::new(Chain::new(10));
    let mut servers = vec![(1, Behaviour::Honest), (2, Behaviour::Honest), (3, Behaviour::Honest)];
    servers.extend((4..=7).map(|n| (n, Behaviour::Unreachable)));
    servers.extend((8..=10).map(|n| (n, Behaviour::FailsTrial)));
    let net = SimNet::new(chain, servers);

    let lumen = start(&net, test_config());
    wait_active(&lumen.svc, 3).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(lumen.svc.pool.active().await?, vec![node(1), node(2), node(3)]);
    assert_eq!(lumen.svc.distributor.peers().len(), 3);
    assert_eq!(net.dials(), 10);

    let entries = lumen.svc.pool.entries().await?;
    assert_eq!(entries.len(), 10);
    for entry in entries.iter().filter(|e| e.addr.id.0[0] > 3) {
        assert_eq!(entry.state, EntryState::Dropped, "{}", entry.addr);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_revalidates_remembered_servers() -> Result<()> {
    let path = std::env::temp_dir().join(format!("lumen-pool-restart-{}.json", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let mut config = test_config();
    config.pool.persist_path = Some(path.clone());

    // First run: both servers work and are remembered.
    let chain = Arc::new(Chain::new(10));
    let net = SimNet::new(chain.clone(), [(1, Behaviour::Honest), (2, Behaviour::Honest)]);
    let first = start(&net, config.clone());
    wait_active(&first.svc, 2).await?;
    let _ = first.shutdown.send(());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).context("pool file missing")?)?;
    assert_eq!(saved.as_array().map(Vec::len), Some(2));

    // Second run: no discovery, and one of the servers has gone away.
    let net = SimNet::new(chain, [(1, Behaviour::Honest), (2, Behaviour::Unreachable)]);
    let second = start_with_discovery(&net, config, Vec::new());
    wait_active(&second.svc, 1).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(net.dials(), 2);
    assert_eq!(second.svc.pool.active().await?, vec![node(1)]);
    let entries = second.svc.pool.entries().await?;
    let gone = entries.iter().find(|e| e.addr.id == node(2)).context("server 2 forgotten")?;
    assert_eq!(gone.state, EntryState::Dropped);

    let _ = second.shutdown.send(());
    let _ = std::fs::remove_file(&path);
    Ok(())
}
