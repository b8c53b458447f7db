//! On-demand retrieval — typed chain queries on top of the retrieve manager.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use lumen_core::{Hash, Header, Receipt, Request};

use crate::retrieve::{RetrieveError, RetrieveManager};

#[derive(Clone)]
pub struct Odr {
    retriever: RetrieveManager,
    default_timeout: Duration,
}

impl Odr {
    pub fn new(retriever: RetrieveManager, default_timeout: Duration) -> Self {
        Self {
            retriever,
            default_timeout,
        }
    }

    pub async fn header(&self, number: u64) -> Result<Header, OdrError> {
        let payload = self.fetch_default(Request::Header { number }).await?;
        serde_json::from_slice(&payload).map_err(|e| OdrError::Decode(e.to_string()))
    }

    pub async fn trie_node(&self, root: Hash, node_hash: Hash) -> Result<Bytes, OdrError> {
        self.fetch_default(Request::TrieNode { root, node_hash }).await
    }

    pub async fn receipts(&self, block_number: u64, block_hash: Hash) -> Result<Vec<Receipt>, OdrError> {
        let payload = self
            .fetch_default(Request::Receipts {
                block_number,
                block_hash,
            })
            .await?;
        serde_json::from_slice(&payload).map_err(|e| OdrError::Decode(e.to_string()))
    }

    pub async fn code(&self, code_hash: Hash) -> Result<Bytes, OdrError> {
        self.fetch_default(Request::Code { code_hash }).await
    }

    /// Raw fetch with an explicit deadline.
    pub async fn fetch(&self, request: Request, deadline: Instant) -> Result<Bytes, OdrError> {
        Ok(self.retriever.fetch(request, deadline).await?)
    }

    async fn fetch_default(&self, request: Request) -> Result<Bytes, OdrError> {
        self.fetch(request, Instant::now() + self.default_timeout).await
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OdrError {
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error("failed to decode response: {0}")]
    Decode(String),
}
