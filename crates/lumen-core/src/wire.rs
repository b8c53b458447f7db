//! Lumen wire types — what a light client asks a server for, and the
//! chain fragments that come back.
//!
//! Framing and encryption belong to the transport. These types only fix
//! the shape of a request and the identity used to deduplicate it: two
//! `Request` values that compare equal are the same logical fetch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Identities ───────────────────────────────────────────────────────────────

/// BLAKE3 content hash. Trie nodes and code blobs are addressed by it.
pub type Hash = [u8; 32];

/// Hash arbitrary bytes the way servers address content.
pub fn content_hash(bytes: &[u8]) -> Hash {
    *blake3::hash(bytes).as_bytes()
}

/// Stable identifier of a remote node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "hex_serde")] pub [u8; 32]);

impl NodeId {
    /// First 8 bytes as hex. Enough to tell peers apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| WireError::InvalidNodeId(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WireError::InvalidNodeId(s.to_string()))?;
        Ok(NodeId(arr))
    }
}

// ── Requests ─────────────────────────────────────────────────────────────────

/// Request kind. Validators and per-peer costs are keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Header,
    TrieNode,
    Receipts,
    Code,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::Header,
        RequestKind::TrieNode,
        RequestKind::Receipts,
        RequestKind::Code,
    ];
}

/// A typed, idempotent retrieval request.
///
/// Immutable once issued. Retries re-send the same value to a different
/// peer under a fresh `req_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Canonical header at a block number.
    Header { number: u64 },

    /// A single trie node, addressed by its hash, under a state root.
    TrieNode {
        #[serde(with = "hex_serde")]
        root: Hash,
        #[serde(with = "hex_serde")]
        node_hash: Hash,
    },

    /// All receipts of one block.
    Receipts {
        block_number: u64,
        #[serde(with = "hex_serde")]
        block_hash: Hash,
    },

    /// Contract code by code hash.
    Code {
        #[serde(with = "hex_serde")]
        code_hash: Hash,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Header { .. } => RequestKind::Header,
            Request::TrieNode { .. } => RequestKind::TrieNode,
            Request::Receipts { .. } => RequestKind::Receipts,
            Request::Code { .. } => RequestKind::Code,
        }
    }

    /// Block number a server must have announced to be able to answer.
    /// None when any head will do.
    pub fn min_head(&self) -> Option<u64> {
        match self {
            Request::Header { number } => Some(*number),
            Request::Receipts { block_number, .. } => Some(*block_number),
            Request::TrieNode { .. } | Request::Code { .. } => None,
        }
    }
}

/// One send attempt of a request. `req_id` is unique per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub req_id: u64,
    pub request: Request,
}

// ── Chain fragments ──────────────────────────────────────────────────────────

/// Head advertised by a server, at handshake and on every new block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub head_number: u64,
    #[serde(with = "hex_serde")]
    pub head_hash: Hash,
    pub total_difficulty: u64,
}

/// Minimal block header, JSON-encoded on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: u64,
    #[serde(with = "hex_serde")]
    pub parent_hash: Hash,
    #[serde(with = "hex_serde")]
    pub state_root: Hash,
    #[serde(with = "hex_serde")]
    pub receipts_root: Hash,
}

impl Header {
    /// Content hash of the canonical JSON encoding.
    pub fn hash(&self) -> Hash {
        content_hash(&self.encode())
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of integers and strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Transaction receipt, as much of it as the light client needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(with = "hex_serde")]
    pub tx_hash: Hash,
    pub success: bool,
    pub gas_used: u64,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid node address: {0}")]
    InvalidAddress(String),
}

pub mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("expected 32 bytes"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
