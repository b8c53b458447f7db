//! Wiring — one call that brings up the whole retrieval layer.

use std::sync::Arc;

use futures::stream::Stream;
use tokio::sync::broadcast;

use lumen_core::{Hash, LumenConfig};

use crate::distributor::RequestDistributor;
use crate::odr::Odr;
use crate::retrieve::RetrieveManager;
use crate::server_pool::{Dialer, NodeAddr, ServerPool};
use crate::transport::Transport;
use crate::validate::ValidatorSet;

/// Handles to the running components. Cheap to clone.
#[derive(Clone)]
pub struct LightService {
    pub distributor: RequestDistributor,
    pub retriever: RetrieveManager,
    pub pool: ServerPool,
    pub odr: Odr,
}

impl LightService {
    /// Spawn the distributor, retrieve manager and server pool on the
    /// current runtime. All three stop when `shutdown` fires.
    pub fn start<S>(
        config: LumenConfig,
        transport: Arc<dyn Transport>,
        dialer: Arc<dyn Dialer>,
        discovery: S,
        validators: ValidatorSet,
        shutdown: &broadcast::Sender<()>,
    ) -> Self
    where
        S: Stream<Item = NodeAddr> + Send + Unpin + 'static,
    {
        let distributor = RequestDistributor::spawn(config.score.clone(), shutdown.subscribe());
        let pool = ServerPool::spawn(
            config.pool.clone(),
            config.score.clone(),
            distributor.clone(),
            dialer,
            &validators,
            discovery,
            shutdown.subscribe(),
        );
        let retriever = RetrieveManager::spawn(
            config.retrieve.clone(),
            distributor.clone(),
            transport,
            validators,
            Some(pool.feedback_sink()),
            shutdown.subscribe(),
        );
        let odr = Odr::new(retriever.clone(), config.retrieve.default_timeout());
        tracing::info!(
            max_attempts = config.retrieve.max_attempts,
            target_active = config.pool.target_active,
            "light service started"
        );
        Self {
            distributor,
            retriever,
            pool,
            odr,
        }
    }

    /// Config from env and file, falling back to defaults. Writes the
    /// default file on first run.
    pub fn load_config() -> LumenConfig {
        if let Err(e) = LumenConfig::write_default_if_missing() {
            tracing::warn!(error = %e, "failed to write default config");
        }
        LumenConfig::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            LumenConfig::default()
        })
    }
}

/// Discovery topic under which servers for a given chain advertise.
pub fn discovery_topic(genesis: &Hash) -> String {
    format!("LES@{}", hex::encode(&genesis[..8]))
}
