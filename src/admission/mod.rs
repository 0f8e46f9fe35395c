//! Admission control: how many tasks may run at once, and when the next
//! one may start.
//!
//! [`AdmissionController`] ties together the per-key token buckets, the
//! adaptive penalty and the layered limit resolver.

pub mod adaptive;
pub mod bucket;
pub mod presets;
pub mod resolver;

pub use adaptive::{AdaptiveConfig, AdaptiveSnapshot, AdaptiveState, ObservationKind};
pub use bucket::{limiter_key, Acquire, RateLimit, RateLimiter};
pub use presets::{PresetEntry, PresetSource, PresetTable, ResolvedPreset, LOCAL_PROVIDER};
pub use resolver::{
    LimitBreakdown, LimitInput, SnapshotProvider, StaticSnapshot, SystemSnapshot,
};

use crate::config::Config;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub struct AdmissionController {
    presets: PresetTable,
    limiter: RateLimiter,
    adaptive_config: AdaptiveConfig,
    adaptive: Mutex<HashMap<String, AdaptiveState>>,
    snapshot_provider: Option<Arc<dyn SnapshotProvider>>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("presets", &self.presets.entries().len())
            .field("snapshot_provider", &self.snapshot_provider.is_some())
            .finish()
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(PresetTable::builtin(), AdaptiveConfig::default())
    }
}

/// Token buckets mirroring the preset table. Tier rows only shape
/// concurrency; buckets are keyed by provider and model.
fn limiter_for(presets: &PresetTable) -> RateLimiter {
    let mut limiter = RateLimiter::new(RateLimit::default());
    // Earlier rows win, so insert in reverse.
    for entry in presets.entries().iter().rev() {
        if entry.tier.is_some() {
            continue;
        }
        let model = entry.model.as_deref().unwrap_or("*");
        limiter = limiter.with_limit(&entry.provider, model, entry.rate_limit());
    }
    limiter
}

impl AdmissionController {
    pub fn new(presets: PresetTable, adaptive_config: AdaptiveConfig) -> Self {
        let limiter = limiter_for(&presets);
        Self {
            presets,
            limiter,
            adaptive_config,
            adaptive: Mutex::new(HashMap::new()),
            snapshot_provider: None,
        }
    }

    /// Built-in presets adjusted by the configured profile, default
    /// parallelism and preset overrides.
    pub fn from_config(config: &Config) -> Self {
        let mut presets = PresetTable::builtin();
        if let Some(max) = config.max_parallelism {
            presets = presets
                .with_default_concurrency(max)
                .with_overrides(vec![PresetEntry::local(max)]);
        }
        presets = presets.with_overrides(config.presets.clone());
        let scale = config.profile.concurrency_scale();
        if scale < 1.0 {
            presets = presets.scaled(scale);
        }
        Self::new(presets, config.adaptive.clone())
    }

    pub fn with_snapshot_provider(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshot_provider = Some(provider);
        self
    }

    pub fn presets(&self) -> &PresetTable {
        &self.presets
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn observe(&self, provider: &str, model: &str, kind: ObservationKind) {
        self.observe_at(provider, model, kind, Instant::now());
    }

    pub fn observe_at(&self, provider: &str, model: &str, kind: ObservationKind, at: Instant) {
        let key = limiter_key(provider, model);
        let mut states = self.adaptive.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(key.clone())
            .or_insert_with(|| AdaptiveState::new(self.adaptive_config.clone()));
        state.record(kind, at);
        tracing::trace!(key = %key, ?kind, penalty = state.penalty_at(at), "observation");
    }

    /// Adaptive factor for a key, or `None` before the first observation.
    fn adaptive_factor_at(&self, key: &str, now: Instant) -> Option<f64> {
        let states = self.adaptive.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(key).map(|s| s.factor_at(now))
    }

    pub fn adaptive_snapshot(&self, provider: &str, model: &str) -> AdaptiveSnapshot {
        let key = limiter_key(provider, model);
        let now = Instant::now();
        let states = self.adaptive.lock().unwrap_or_else(PoisonError::into_inner);
        match states.get(&key) {
            Some(state) => state.snapshot(now),
            None => AdaptiveSnapshot {
                factor: 1.0,
                ..Default::default()
            },
        }
    }

    pub fn effective_limit(&self, input: &LimitInput) -> LimitBreakdown {
        self.effective_limit_at(input, Instant::now())
    }

    pub fn effective_limit_at(&self, input: &LimitInput, now: Instant) -> LimitBreakdown {
        let factor = self.adaptive_factor_at(&input.key(), now);
        let snapshot = self.snapshot_provider.as_ref().and_then(|p| p.snapshot());
        let breakdown = resolver::resolve(&self.presets, input, factor, snapshot);
        for warning in &breakdown.warnings {
            tracing::trace!(key = %breakdown.key, warning = %warning, "limit resolution");
        }
        breakdown
    }

    pub fn try_acquire(&self, provider: &str, model: &str) -> Acquire {
        self.limiter.try_acquire(provider, model)
    }

    /// Wait for a rate-limit permit, recording the wait as pressure.
    pub async fn acquire(
        &self,
        provider: &str,
        model: &str,
        queue_timeout: Option<Duration>,
    ) -> Result<Duration> {
        let waited = self.limiter.acquire(provider, model, queue_timeout).await?;
        if !waited.is_zero() {
            self.observe(
                provider,
                model,
                ObservationKind::RateLimit {
                    wait_ms: waited.as_millis() as u64,
                },
            );
        }
        Ok(waited)
    }
}
