//! lumen-core — shared types, request wire format, and configuration.
//! All other Lumen crates depend on this one.

pub mod config;
pub mod wire;

pub use config::LumenConfig;
pub use wire::{content_hash, Announcement, Hash, Header, NodeId, Receipt, Request, RequestKind, RequestMessage};
