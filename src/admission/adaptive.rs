//! Adaptive concurrency penalty.
//!
//! Pressure signals (rate-limit hits, timeouts, errors) add to a penalty
//! that shrinks the effective ceiling. The penalty decays continuously with
//! a configured half-life, so a run of successes lets capacity recover.
//! Observations are immutable and kept in a bounded sliding window.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Observations older than this are evicted.
    pub window_secs: u64,
    /// Hard cap on retained observations.
    pub max_events: usize,
    pub rate_limit_step: f64,
    pub timeout_step: f64,
    pub error_step: f64,
    /// Upper bound on the penalty, in `[0, 1]`.
    pub max_penalty: f64,
    pub half_life_secs: f64,
    /// When set, mean success latency above this target shrinks the
    /// factor proportionally.
    pub latency_target_ms: Option<u64>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            max_events: 256,
            rate_limit_step: 0.25,
            timeout_step: 0.15,
            error_step: 0.05,
            max_penalty: 0.9,
            half_life_secs: 60.0,
            latency_target_ms: None,
        }
    }
}

/// An externally observed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationKind {
    Success { latency_ms: u64 },
    RateLimit { wait_ms: u64 },
    Timeout { latency_ms: u64 },
    Error,
}

impl ObservationKind {
    fn step(&self, config: &AdaptiveConfig) -> f64 {
        match self {
            ObservationKind::Success { .. } => 0.0,
            ObservationKind::RateLimit { .. } => config.rate_limit_step,
            ObservationKind::Timeout { .. } => config.timeout_step,
            ObservationKind::Error => config.error_step,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub kind: ObservationKind,
    pub at: Instant,
}

/// Counts and derived values for one key, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AdaptiveSnapshot {
    pub penalty: f64,
    pub factor: f64,
    pub successes: usize,
    pub rate_limits: usize,
    pub timeouts: usize,
    pub errors: usize,
    pub mean_latency_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveState {
    config: AdaptiveConfig,
    events: VecDeque<Observation>,
    penalty: f64,
    updated_at: Option<Instant>,
}

impl AdaptiveState {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            events: VecDeque::new(),
            penalty: 0.0,
            updated_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn record(&mut self, kind: ObservationKind, at: Instant) {
        let decayed = self.penalty_at(at);
        let max = self.config.max_penalty.clamp(0.0, 1.0);
        self.penalty = (decayed + kind.step(&self.config)).min(max);
        self.updated_at = Some(at);

        self.events.push_back(Observation { kind, at });
        self.evict(at);
    }

    /// Penalty decayed to `now`: `p * 0.5^(elapsed / half_life)`.
    pub fn penalty_at(&self, now: Instant) -> f64 {
        let Some(updated) = self.updated_at else {
            return 0.0;
        };
        if self.config.half_life_secs <= 0.0 {
            return 0.0;
        }
        let elapsed = now.saturating_duration_since(updated).as_secs_f64();
        self.penalty * 0.5_f64.powf(elapsed / self.config.half_life_secs)
    }

    /// Multiplicative factor in `[0, 1]` applied to the preset limit.
    pub fn factor_at(&self, now: Instant) -> f64 {
        ((1.0 - self.penalty_at(now)) * self.latency_factor(now)).clamp(0.0, 1.0)
    }

    pub fn snapshot(&self, now: Instant) -> AdaptiveSnapshot {
        let mut snapshot = AdaptiveSnapshot {
            penalty: self.penalty_at(now),
            factor: self.factor_at(now),
            mean_latency_ms: self.mean_latency_ms(now),
            ..Default::default()
        };
        for event in self.live(now) {
            match event.kind {
                ObservationKind::Success { .. } => snapshot.successes += 1,
                ObservationKind::RateLimit { .. } => snapshot.rate_limits += 1,
                ObservationKind::Timeout { .. } => snapshot.timeouts += 1,
                ObservationKind::Error => snapshot.errors += 1,
            }
        }
        snapshot
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    fn live(&self, now: Instant) -> impl Iterator<Item = &Observation> {
        let window = self.window();
        self.events
            .iter()
            .filter(move |e| now.saturating_duration_since(e.at) <= window)
    }

    fn evict(&mut self, now: Instant) {
        let window = self.window();
        while self
            .events
            .front()
            .is_some_and(|e| now.saturating_duration_since(e.at) > window)
        {
            self.events.pop_front();
        }
        while self.events.len() > self.config.max_events.max(1) {
            self.events.pop_front();
        }
    }

    fn mean_latency_ms(&self, now: Instant) -> Option<f64> {
        let latencies: Vec<u64> = self
            .live(now)
            .filter_map(|e| match e.kind {
                ObservationKind::Success { latency_ms } => Some(latency_ms),
                _ => None,
            })
            .collect();
        if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
        }
    }

    fn latency_factor(&self, now: Instant) -> f64 {
        match (self.config.latency_target_ms, self.mean_latency_ms(now)) {
            (Some(target), Some(mean)) if mean > target as f64 && mean > 0.0 => {
                (target as f64 / mean).clamp(0.0, 1.0)
            }
            _ => 1.0,
        }
    }
}
