//! Per-provider circuit breaker.
//!
//! After three consecutive failures a provider enters a cooldown (default
//! five minutes). During cooldown, best-effort callers degrade to their
//! deterministic fallbacks and strict callers fail fast with
//! `ProviderCoolingDown`. Any success resets the counter. State is
//! in-memory only: a cold start always allows one attempt per provider.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Failures before the circuit opens.
pub const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cooldown: Duration,
    states: Mutex<HashMap<&'static str, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the provider may be called now. `Err(until)` while the
    /// circuit is open.
    pub fn check(&self, provider: &'static str) -> Result<(), DateTime<Utc>> {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states.entry(provider).or_default();
        match state.cooldown_until {
            Some(until) if Instant::now() < until => {
                let remaining = until.duration_since(Instant::now());
                Err(Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_default())
            }
            Some(_) => {
                // Cooldown elapsed: allow a probe attempt, keep the counter
                // so one more failure re-opens the circuit immediately.
                state.cooldown_until = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn record_success(&self, provider: &'static str) {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states.entry(provider).or_default();
        state.consecutive_failures = 0;
        state.cooldown_until = None;
    }

    pub fn record_failure(&self, provider: &'static str) {
        let mut states = self.states.lock().expect("breaker lock");
        let state = states.entry(provider).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= FAILURE_THRESHOLD {
            state.cooldown_until = Some(Instant::now() + self.cooldown);
        }
    }

    #[cfg(test)]
    fn failures(&self, provider: &'static str) -> u32 {
        self.states
            .lock()
            .unwrap()
            .get(provider)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }
}
