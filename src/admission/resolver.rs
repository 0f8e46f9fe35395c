//! Effective-parallelism resolution.
//!
//! Each layer is a pure function of explicit inputs; [`reduce`] combines
//! them deterministically:
//!
//! ```text
//! effective = max(1, floor(min(preset × adaptive × share, hard) × (1 + adjustment)))
//! ```
//!
//! Nothing here is cached; every call recomputes from the inputs it is given.

use crate::admission::bucket::limiter_key;
use crate::admission::presets::{PresetSource, PresetTable, ResolvedPreset, LOCAL_PROVIDER};
use serde::{Deserialize, Serialize};

/// What the caller wants a limit for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitInput {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl LimitInput {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            tier: None,
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn key(&self) -> String {
        limiter_key(&self.provider, &self.model)
    }
}

impl Default for LimitInput {
    fn default() -> Self {
        Self::new(LOCAL_PROVIDER, "default")
    }
}

/// Runtime signals outside the adaptive layer. `None` fields mean the
/// signal does not constrain the limit.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// Process or OS ceiling, e.g. derived from file-descriptor headroom.
    pub hard_limit: Option<u32>,
    /// Independent executor instances sharing one global budget.
    pub active_instances: Option<u32>,
    /// Signed adjustment in `[-1, 1]`; negative under backpressure.
    pub scheduling_adjustment: Option<f64>,
}

/// Source of runtime signals.
pub trait SnapshotProvider: Send + Sync {
    /// Current snapshot, or `None` when signals are unavailable.
    fn snapshot(&self) -> Option<SystemSnapshot>;
}

/// Fixed snapshot, for configuration-driven limits and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticSnapshot(pub SystemSnapshot);

impl SnapshotProvider for StaticSnapshot {
    fn snapshot(&self) -> Option<SystemSnapshot> {
        Some(self.0)
    }
}

/// Every factor that went into one resolution, plus the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitBreakdown {
    pub key: String,
    pub preset_limit: u32,
    pub preset_source: PresetSource,
    pub adaptive_factor: f64,
    pub fair_share: f64,
    pub hard_constraint: Option<u32>,
    pub scheduling_adjustment: f64,
    pub effective_limit: u32,
    pub warnings: Vec<String>,
}

// ========== Layers ==========

pub fn preset_layer(table: &PresetTable, input: &LimitInput) -> ResolvedPreset {
    table.lookup(&input.provider, &input.model, input.tier.as_deref())
}

/// Adaptive factor clamped to `[0, 1]`. No observations means no penalty.
pub fn adaptive_layer(factor: Option<f64>, warnings: &mut Vec<String>) -> f64 {
    match factor {
        None => 1.0,
        Some(f) if f.is_nan() => {
            warnings.push("adaptive factor is NaN; ignoring".to_string());
            1.0
        }
        Some(f) => f.clamp(0.0, 1.0),
    }
}

/// This instance's share of a global budget, in `(0, 1]`.
pub fn fair_share_layer(instances: Option<u32>) -> f64 {
    match instances {
        Some(n) if n > 1 => 1.0 / n as f64,
        _ => 1.0,
    }
}

pub fn hard_constraint_layer(hard_limit: Option<u32>) -> Option<u32> {
    hard_limit.map(|h| h.max(1))
}

pub fn adjustment_layer(adjustment: Option<f64>, warnings: &mut Vec<String>) -> f64 {
    match adjustment {
        None => 0.0,
        Some(a) if a.is_nan() => {
            warnings.push("scheduling adjustment is NaN; ignoring".to_string());
            0.0
        }
        Some(a) if !(-1.0..=1.0).contains(&a) => {
            warnings.push(format!("scheduling adjustment {a} clamped to [-1, 1]"));
            a.clamp(-1.0, 1.0)
        }
        Some(a) => a,
    }
}

/// Combine layer outputs into an integer limit of at least one.
pub fn reduce(
    preset: u32,
    adaptive: f64,
    share: f64,
    hard: Option<u32>,
    adjustment: f64,
) -> u32 {
    let mut limit = preset as f64 * adaptive * share;
    if let Some(hard) = hard {
        limit = limit.min(hard as f64);
    }
    limit *= 1.0 + adjustment;
    if limit.is_finite() {
        (limit.floor().max(0.0) as u32).max(1)
    } else {
        1
    }
}

/// Resolve the effective limit for `input`.
///
/// A missing snapshot degrades to the preset (with the adaptive factor still
/// applied) and records a warning instead of failing.
pub fn resolve(
    table: &PresetTable,
    input: &LimitInput,
    adaptive_factor: Option<f64>,
    snapshot: Option<SystemSnapshot>,
) -> LimitBreakdown {
    let mut warnings = Vec::new();

    let preset = preset_layer(table, input);
    if preset.source == PresetSource::Default {
        warnings.push(format!(
            "no preset for {}; using default concurrency {}",
            input.key(),
            preset.max_concurrency
        ));
    }

    let adaptive = adaptive_layer(adaptive_factor, &mut warnings);

    let snapshot = match snapshot {
        Some(s) => s,
        None => {
            warnings.push("no snapshot provider available; using preset limit".to_string());
            SystemSnapshot::default()
        }
    };
    let share = fair_share_layer(snapshot.active_instances);
    let hard = hard_constraint_layer(snapshot.hard_limit);
    let adjustment = adjustment_layer(snapshot.scheduling_adjustment, &mut warnings);

    let effective_limit = reduce(preset.max_concurrency, adaptive, share, hard, adjustment);

    LimitBreakdown {
        key: input.key(),
        preset_limit: preset.max_concurrency,
        preset_source: preset.source,
        adaptive_factor: adaptive,
        fair_share: share,
        hard_constraint: hard,
        scheduling_adjustment: adjustment,
        effective_limit,
        warnings,
    }
}
