//! When the pool may dial a server again after it failed.
//!
//! Every failure (handshake, trial, eviction, disconnect) doubles the wait
//! before the next dial, starting at `backoff_min` and capped at
//! `backoff_max`. After `backoff_steps` failures in a row the server is
//! given up and the pool forgets it. A promotion wipes the record.

use std::collections::HashMap;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use lumen_core::config::PoolConfig;
use lumen_core::NodeId;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Failures {
    count: usize,
    /// No dial before this.
    not_before: Instant,
}

#[derive(Debug)]
pub struct RedialSchedule {
    delays: ExponentialBuilder,
    max_failures: usize,
    failures: HashMap<NodeId, Failures>,
}

impl RedialSchedule {
    pub fn new(min_delay: Duration, max_delay: Duration, max_failures: usize) -> Self {
        let delays = ExponentialBuilder::default()
            .with_min_delay(min_delay)
            .with_max_delay(max_delay)
            .with_factor(2.0)
            .with_max_times(max_failures);
        Self {
            delays,
            max_failures,
            failures: HashMap::new(),
        }
    }

    pub fn from_config(cfg: &PoolConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_min_ms),
            Duration::from_millis(cfg.backoff_max_ms),
            cfg.backoff_steps,
        )
    }

    /// Record a failure. Returns how long to wait before dialling again,
    /// or `None` once the server has failed too often to bother.
    pub fn failed(&mut self, id: NodeId) -> Option<Duration> {
        let now = Instant::now();
        let record = self.failures.entry(id).or_insert(Failures {
            count: 0,
            not_before: now,
        });
        record.count += 1;
        let wait = self.delays.build().nth(record.count - 1)?;
        record.not_before = now + wait;
        Some(wait)
    }

    /// May be dialled now: never failed, or its wait has run out.
    pub fn is_due(&self, id: &NodeId) -> bool {
        self.failures
            .get(id)
            .map_or(true, |f| Instant::now() >= f.not_before)
    }

    pub fn is_given_up(&self, id: &NodeId) -> bool {
        self.failures
            .get(id)
            .is_some_and(|f| f.count > self.max_failures)
    }

    pub fn clear(&mut self, id: &NodeId) {
        self.failures.remove(id);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
