//! Peer quality — a decaying average over request outcomes.
//!
//! Successes pull the score toward 1, faster when the round trip was quick.
//! Rejections and timeouts pull it toward 0, timeouts harder. The
//! direction of each step never depends on the current value.

use std::time::Duration;

use lumen_core::config::ScoreConfig;
use serde::{Deserialize, Serialize};

/// What happened to one request sent to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success { rtt: Duration },
    Rejected,
    TimedOut,
}

/// Quality score in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quality(f64);

impl Quality {
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }

    pub fn initial(cfg: &ScoreConfig) -> Self {
        Self::new(cfg.initial)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Fold one outcome into the average.
    pub fn observe(&mut self, outcome: &Outcome, cfg: &ScoreConfig) {
        let alpha = cfg.alpha.clamp(0.0, 1.0);
        match outcome {
            Outcome::Success { rtt } => {
                let slow = cfg.slow_rtt().as_secs_f64().max(f64::EPSILON);
                let speed = 1.0 - 0.5 * (rtt.as_secs_f64() / slow).min(1.0);
                self.0 += alpha * speed * (1.0 - self.0);
            }
            Outcome::Rejected => {
                self.0 -= alpha * self.0;
            }
            Outcome::TimedOut => {
                let weight = (alpha * cfg.timeout_weight).clamp(0.0, 1.0);
                self.0 -= weight * self.0;
            }
        }
        self.0 = self.0.clamp(0.0, 1.0);
    }

    pub fn is_below(&self, floor: f64) -> bool {
        self.0 < floor
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::initial(&ScoreConfig::default())
    }
}
