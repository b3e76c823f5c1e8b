//! Connection status and reconnect backoff
//!
//! The remote proxy's connection lifecycle is modeled explicitly: a status
//! enum driving UI connectivity indicators and gating `invoke()`, and a
//! bounded exponential backoff counter whose pending sleep is cancellable by
//! the owner's shutdown channel.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection state of a remote proxy.
///
/// Embedded proxies are permanently [`Connected`](ConnectionStatus::Connected).
/// [`Failed`](ConnectionStatus::Failed) is terminal: the reconnect budget is
/// exhausted and the proxy stays down until the embedding page is reloaded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Bounded exponential backoff: `base * growth^(attempt-1)`, up to
/// `max_attempts` delays, then `None` forever until [`reset`](Backoff::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    growth: f64,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, growth: f64, max_attempts: u32) -> Self {
        Self {
            base,
            growth,
            max_attempts,
            attempt: 0,
        }
    }

    /// The delay before the next reconnect attempt, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        let factor = self.growth.powi(self.attempt as i32 - 1);
        Some(self.base.mul_f64(factor))
    }

    /// Reset to the base delay. Called on every successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts consumed since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
