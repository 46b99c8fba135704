use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Process-local circuit breaker keyed by dependency (a storage provider, a
/// webhook hostname). State is not shared across processes.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    entries: DashMap<String, BreakerEntry>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            entries: DashMap::new(),
        }
    }

    pub fn state(&self, key: &str) -> BreakerState {
        let Some(entry) = self.entries.get(key) else {
            return BreakerState::Closed;
        };
        match entry.opened_at {
            Some(opened) if opened.elapsed() >= self.cooldown => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
            None => BreakerState::Closed,
        }
    }

    /// Whether a call through this key is currently allowed. Open circuits
    /// reject; half-open circuits let one probe through.
    pub fn allows(&self, key: &str) -> bool {
        self.state(key) != BreakerState::Open
    }

    pub fn record_success(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn record_failure(&self, key: &str) {
        let mut entry = self.entries.entry(key.to_string()).or_insert(BreakerEntry {
            consecutive_failures: 0,
            opened_at: None,
        });
        // A failed half-open probe re-opens with a fresh cooldown.
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold {
            if entry.opened_at.is_none() {
                warn!(key, failures = entry.consecutive_failures, "circuit opened");
            }
            entry.opened_at = Some(Instant::now());
        }
    }
}
