// src/circuit_breaker/breaker.rs

use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitBreakerState {
    Closed,   // Normal operation
    Open,     // Failing, excluded from selection
    HalfOpen, // Recovery window elapsed, next outcome decides
}

#[derive(Debug, Clone)]
struct CircuitEntry {
    // Only Closed or Open are stored; HalfOpen is derived from `opened_at`.
    state: CircuitBreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for CircuitEntry {
    fn default() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
}

/// Per-backend circuit breaker management.
///
/// Each entry is mutated under its DashMap shard lock, so an update and the
/// state it derives from are never interleaved with another update for the
/// same backend.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, CircuitEntry>,
    failure_threshold: u32,
    recovery_timeout: Option<Duration>,
}

impl CircuitBreakerManager {
    pub fn new(failure_threshold: u32, recovery_timeout: Option<Duration>) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.recovery_timeout())
    }

    fn effective_state(&self, entry: &CircuitEntry) -> CircuitBreakerState {
        match (entry.state, entry.opened_at, self.recovery_timeout) {
            (CircuitBreakerState::Open, Some(opened_at), Some(timeout))
                if opened_at.elapsed() >= timeout =>
            {
                CircuitBreakerState::HalfOpen
            }
            (state, _, _) => state,
        }
    }

    pub fn record_failure(&self, backend_id: &str) -> CircuitBreakerState {
        let mut entry = self.breakers.entry(backend_id.to_string()).or_default();

        match self.effective_state(&entry) {
            CircuitBreakerState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.failure_threshold {
                    entry.state = CircuitBreakerState::Open;
                    entry.opened_at = Some(Instant::now());
                    tracing::warn!(
                        backend = %backend_id,
                        failures = entry.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitBreakerState::HalfOpen => {
                entry.consecutive_failures += 1;
                entry.state = CircuitBreakerState::Open;
                entry.opened_at = Some(Instant::now());
                tracing::warn!(backend = %backend_id, "Circuit breaker re-opened after failed probe");
            }
            CircuitBreakerState::Open => {}
        }

        self.effective_state(&entry)
    }

    pub fn record_success(&self, backend_id: &str) -> CircuitBreakerState {
        let mut entry = self.breakers.entry(backend_id.to_string()).or_default();

        match self.effective_state(&entry) {
            CircuitBreakerState::Closed => {
                entry.consecutive_failures = 0;
            }
            CircuitBreakerState::HalfOpen => {
                *entry = CircuitEntry::default();
                tracing::info!(backend = %backend_id, "Circuit breaker closed after successful recovery");
            }
            // Closing an open circuit needs the recovery window or a reset.
            CircuitBreakerState::Open => {}
        }

        self.effective_state(&entry)
    }

    /// Only `Open` excludes a backend; a half-open circuit admits every
    /// concurrent request until an outcome is recorded.
    pub fn is_open(&self, backend_id: &str) -> bool {
        self.get_state(backend_id) == CircuitBreakerState::Open
    }

    /// Unknown backends read as `Closed`.
    pub fn get_state(&self, backend_id: &str) -> CircuitBreakerState {
        self.breakers
            .get(backend_id)
            .map(|entry| self.effective_state(&entry))
            .unwrap_or(CircuitBreakerState::Closed)
    }

    pub fn consecutive_failures(&self, backend_id: &str) -> u32 {
        self.breakers
            .get(backend_id)
            .map(|entry| entry.consecutive_failures)
            .unwrap_or(0)
    }

    /// Manual recovery: force `Closed` with zero failures.
    pub fn reset(&self, backend_id: &str) {
        self.breakers
            .insert(backend_id.to_string(), CircuitEntry::default());
        tracing::info!(backend = %backend_id, "Circuit breaker reset");
    }

    pub fn remove(&self, backend_id: &str) {
        self.breakers.remove(backend_id);
    }

    pub fn snapshot(&self) -> HashMap<String, CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|entry| {
                let snapshot = CircuitSnapshot {
                    state: self.effective_state(entry.value()),
                    consecutive_failures: entry.consecutive_failures,
                };
                (entry.key().clone(), snapshot)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unknown_backend_is_closed() {
        let breaker = CircuitBreakerManager::new(3, None);
        assert_eq!(breaker.get_state("nobody"), CircuitBreakerState::Closed);
        assert!(!breaker.is_open("nobody"));
        assert!(breaker.snapshot().is_empty());
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreakerManager::new(3, None);
        breaker.record_failure("a");
        breaker.record_failure("a");
        assert!(!breaker.is_open("a"));
        assert_eq!(breaker.record_failure("a"), CircuitBreakerState::Open);
        assert!(breaker.is_open("a"));
        assert!(!breaker.is_open("b"));
    }

    #[test]
    fn test_success_resets_failures_while_closed() {
        let breaker = CircuitBreakerManager::new(3, None);
        breaker.record_failure("a");
        breaker.record_failure("a");
        breaker.record_success("a");
        assert_eq!(breaker.consecutive_failures("a"), 0);

        breaker.record_failure("a");
        breaker.record_failure("a");
        assert!(!breaker.is_open("a"));
    }

    #[test]
    fn test_open_circuit_ignores_bare_success() {
        let breaker = CircuitBreakerManager::new(1, None);
        breaker.record_failure("a");
        assert_eq!(breaker.record_success("a"), CircuitBreakerState::Open);
        breaker.record_failure("a");
        assert!(breaker.is_open("a"));
        assert_eq!(breaker.consecutive_failures("a"), 1);
    }

    #[test]
    fn test_reset_closes_from_any_state() {
        let breaker = CircuitBreakerManager::new(2, None);
        breaker.record_failure("a");
        breaker.record_failure("a");
        assert!(breaker.is_open("a"));

        breaker.reset("a");
        assert_eq!(breaker.get_state("a"), CircuitBreakerState::Closed);
        assert_eq!(breaker.consecutive_failures("a"), 0);

        breaker.reset("never-seen");
        assert_eq!(breaker.get_state("never-seen"), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_recovery_window_half_opens() {
        let breaker = CircuitBreakerManager::new(1, Some(Duration::from_millis(30)));
        breaker.record_failure("a");
        assert!(breaker.is_open("a"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.get_state("a"), CircuitBreakerState::HalfOpen);
        assert!(!breaker.is_open("a"));

        assert_eq!(breaker.record_success("a"), CircuitBreakerState::Closed);
        assert_eq!(breaker.consecutive_failures("a"), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreakerManager::new(1, Some(Duration::from_millis(30)));
        breaker.record_failure("a");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(breaker.record_failure("a"), CircuitBreakerState::Open);
        assert!(breaker.is_open("a"));
    }

    #[test]
    fn test_remove_drops_entry() {
        let breaker = CircuitBreakerManager::new(1, None);
        breaker.record_failure("a");
        breaker.remove("a");
        assert!(!breaker.is_open("a"));
        assert!(breaker.snapshot().is_empty());
    }

    proptest! {
        #[test]
        fn prop_exactly_threshold_failures_open(threshold in 1u32..20) {
            let breaker = CircuitBreakerManager::new(threshold, None);
            for _ in 1..threshold {
                breaker.record_failure("x");
                prop_assert!(!breaker.is_open("x"));
            }
            breaker.record_failure("x");
            prop_assert!(breaker.is_open("x"));
        }
    }
}
