// packages/engine/src/scheduler/circuit_breaker.rs
//! Per-capability circuit breaker
//!
//! ```text
//! Closed ──failure rate ≥ threshold──▶ Open ──cooldown──▶ HalfOpen
//!   ▲                                   ▲                    │
//!   └──────────── probe succeeds ───────┼──── probe fails ───┘
//! ```
//!
//! Time is passed in by the caller so the breaker stays deterministic.

use crate::utils::config::CircuitBreakerConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    window: usize,
    min_samples: usize,
    failure_threshold: f64,
    cooldown: Duration,
    outcomes: VecDeque<bool>,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            window: config.window.max(1),
            min_samples: config.min_samples,
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown(),
            outcomes: VecDeque::with_capacity(config.window.max(1)),
            state: CircuitState::Closed,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn status(&self) -> CircuitStatus {
        match self.state {
            CircuitState::Closed => CircuitStatus::Closed,
            CircuitState::Open { .. } => CircuitStatus::Open,
            CircuitState::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }

    /// Whether a dispatch may go ahead at `now`
    ///
    /// An open circuit whose cooldown has passed turns half-open and allows
    /// exactly one probe, claimed with [`CircuitBreaker::on_dispatch`].
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { until } if now >= until => {
                self.state = CircuitState::HalfOpen {
                    probe_in_flight: false,
                };
                true
            }
            CircuitState::Open { .. } => false,
            CircuitState::HalfOpen { probe_in_flight } => !probe_in_flight,
        }
    }

    pub fn on_dispatch(&mut self) {
        if let CircuitState::HalfOpen { .. } = self.state {
            self.state = CircuitState::HalfOpen {
                probe_in_flight: true,
            };
        }
    }

    pub fn record(&mut self, success: bool, now: Instant) {
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);

        match self.state {
            CircuitState::HalfOpen { .. } if success => {
                self.state = CircuitState::Closed;
                self.outcomes.clear();
            }
            CircuitState::HalfOpen { .. } => self.trip(now),
            CircuitState::Closed => {
                if self.outcomes.len() >= self.min_samples && self.failure_rate() >= self.failure_threshold {
                    self.trip(now);
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Release a claimed probe that never ran
    pub fn abandon_probe(&mut self) {
        if let CircuitState::HalfOpen { probe_in_flight: true } = self.state {
            self.state = CircuitState::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open {
            until: now + self.cooldown,
        };
    }

    pub fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    /// When an open circuit becomes eligible for a probe
    pub fn reopens_at(&self) -> Option<Instant> {
        match self.state {
            CircuitState::Open { until } => Some(until),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            window: 10,
            min_samples: 4,
            failure_threshold: 0.5,
            cooldown_ms: 1_000,
        })
    }

    #[test]
    fn test_stays_closed_below_min_samples() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            cb.record(false, now);
        }
        assert_eq!(cb.status(), CircuitStatus::Closed);
        assert!(cb.allow(now));
    }

    #[test]
    fn test_opens_then_probes() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            cb.record(false, now);
        }
        assert_eq!(cb.status(), CircuitStatus::Open);
        assert!(!cb.allow(now + Duration::from_millis(500)));

        let later = now + Duration::from_secs(1);
        assert!(cb.allow(later));
        cb.on_dispatch();
        assert!(!cb.allow(later), "only one probe while half-open");

        cb.record(true, later);
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            cb.record(false, now);
        }
        let later = now + Duration::from_secs(2);
        assert!(cb.allow(later));
        cb.on_dispatch();
        cb.record(false, later);
        assert_eq!(cb.reopens_at(), Some(later + Duration::from_secs(1)));
    }

    #[test]
    fn test_mixed_outcomes_under_threshold() {
        let mut cb = breaker();
        let now = Instant::now();
        for ok in [true, true, false, true, true, false] {
            cb.record(ok, now);
        }
        assert_eq!(cb.status(), CircuitStatus::Closed);
        assert!((cb.failure_rate() - 1.0 / 3.0).abs() < 1e-9);
    }
}
