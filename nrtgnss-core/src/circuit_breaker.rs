//! Per-provider circuit breaker.
//!
//! A provider that rejects our credentials, or that refuses connections
//! several times in a row, is taken out of the rotation for a cooldown
//! period. Tasks then fall through to the next provider without spending
//! attempts on one that is known to be down or misconfigured.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// State of one provider's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Tripped: requests are refused until the cooldown expires.
    Open { tripped_at: Instant },
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: BreakerState,
    consecutive_failures: u32,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
        }
    }
}

/// Breakers for every provider, keyed by provider name.
#[derive(Debug)]
pub struct CircuitBreaker {
    slots: Mutex<HashMap<String, Slot>>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// 30-minute cooldown, trips after 3 consecutive connection failures.
    pub fn default_provider() -> Self {
        Self::new(Duration::from_secs(30 * 60), 3)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // A panic while holding the lock leaves plain counters behind; keep using them.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `provider` may be contacted right now.
    pub fn is_allowed(&self, provider: &str) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(provider) else {
            return true;
        };
        match slot.state {
            BreakerState::Closed => true,
            BreakerState::Open { tripped_at } => {
                if tripped_at.elapsed() >= self.cooldown {
                    *slot = Slot::default();
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, provider: &str) {
        if let Some(slot) = self.slots().get_mut(provider) {
            slot.consecutive_failures = 0;
        }
    }

    /// Record a connection-level failure; trips after the threshold.
    pub fn record_failure(&self, provider: &str) {
        let mut slots = self.slots();
        let slot = slots.entry(provider.to_string()).or_default();
        slot.consecutive_failures += 1;
        if slot.consecutive_failures >= self.failure_threshold {
            slot.state = BreakerState::Open {
                tripped_at: Instant::now(),
            };
        }
    }

    /// Trip immediately (authentication rejected, provider misconfigured).
    pub fn trip(&self, provider: &str) {
        let mut slots = self.slots();
        let slot = slots.entry(provider.to_string()).or_default();
        slot.state = BreakerState::Open {
            tripped_at: Instant::now(),
        };
    }

    pub fn state(&self, provider: &str) -> BreakerState {
        self.slots()
            .get(provider)
            .map(|s| s.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Names of providers whose breaker is currently open.
    pub fn tripped(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, s)| matches!(s.state, BreakerState::Open { tripped_at } if tripped_at.elapsed() < self.cooldown))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::default_provider()
    }
}
