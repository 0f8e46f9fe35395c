//! Static per-provider/model limit presets.

use crate::admission::bucket::RateLimit;
use serde::{Deserialize, Serialize};

/// Provider name for in-process runners; never rate limited.
pub const LOCAL_PROVIDER: &str = "local";

/// One preset row. `model` and `tier` narrow the match; a row with neither
/// applies to every model of the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetEntry {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    pub max_concurrency: u32,
    pub requests_per_minute: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_interval_ms: Option<u64>,
}

impl PresetEntry {
    pub fn local(max_concurrency: u32) -> Self {
        entry(LOCAL_PROVIDER, None, None, max_concurrency, 0)
    }

    pub fn rate_limit(&self) -> RateLimit {
        RateLimit {
            capacity: self.burst.unwrap_or(self.max_concurrency).max(1),
            requests_per_minute: self.requests_per_minute,
            min_interval_ms: self.min_interval_ms,
        }
    }
}

/// Which preset row answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetSource {
    Model,
    Tier,
    Provider,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPreset {
    pub max_concurrency: u32,
    pub rate: RateLimit,
    pub source: PresetSource,
}

#[derive(Debug, Clone)]
pub struct PresetTable {
    entries: Vec<PresetEntry>,
    default_concurrency: u32,
    default_rate: RateLimit,
}

impl Default for PresetTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn entry(
    provider: &str,
    model: Option<&str>,
    tier: Option<&str>,
    conc: u32,
    rpm: u32,
) -> PresetEntry {
    PresetEntry {
        provider: provider.to_string(),
        model: model.map(str::to_string),
        tier: tier.map(str::to_string),
        max_concurrency: conc,
        requests_per_minute: rpm,
        burst: None,
        min_interval_ms: None,
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl PresetTable {
    pub fn new(entries: Vec<PresetEntry>, default_concurrency: u32) -> Self {
        Self {
            entries,
            default_concurrency: default_concurrency.max(1),
            default_rate: RateLimit::default(),
        }
    }

    /// Conservative defaults for common hosted and local providers.
    pub fn builtin() -> Self {
        Self::new(
            vec![
                entry("anthropic", None, None, 8, 50),
                entry("anthropic", None, Some("free"), 2, 5),
                entry("openai", None, None, 8, 60),
                entry("openai", None, Some("free"), 2, 3),
                entry("openai", Some("gpt-4o-mini"), None, 16, 500),
                entry("google", None, None, 6, 60),
                entry("ollama", None, None, 2, 0),
                PresetEntry::local(4),
            ],
            4,
        )
    }

    pub fn entries(&self) -> &[PresetEntry] {
        &self.entries
    }

    pub fn default_concurrency(&self) -> u32 {
        self.default_concurrency
    }

    /// Prepend entries so they win over existing rows.
    pub fn with_overrides(mut self, overrides: Vec<PresetEntry>) -> Self {
        let mut entries = overrides;
        entries.append(&mut self.entries);
        self.entries = entries;
        self
    }

    pub fn with_default_concurrency(mut self, concurrency: u32) -> Self {
        self.default_concurrency = concurrency.max(1);
        self
    }

    /// Multiply every concurrency by `factor`, flooring, never below one.
    pub fn scaled(mut self, factor: f64) -> Self {
        let scale = |n: u32| ((n as f64 * factor).floor() as u32).max(1);
        for entry in &mut self.entries {
            entry.max_concurrency = scale(entry.max_concurrency);
        }
        self.default_concurrency = scale(self.default_concurrency);
        self
    }

    /// Resolve by model, then tier, then provider, then the table default.
    /// Matching is case-insensitive.
    pub fn lookup(&self, provider: &str, model: &str, tier: Option<&str>) -> ResolvedPreset {
        let rows: Vec<&PresetEntry> = self
            .entries
            .iter()
            .filter(|e| same_name(&e.provider, provider))
            .collect();

        let by_model = rows
            .iter()
            .copied()
            .find(|e| e.model.as_deref().is_some_and(|m| same_name(m, model)));
        let by_tier = tier.and_then(|t| {
            rows.iter().copied().find(|e| {
                e.model.is_none() && e.tier.as_deref().is_some_and(|et| same_name(et, t))
            })
        });
        let by_provider = rows
            .iter()
            .copied()
            .find(|e| e.model.is_none() && e.tier.is_none());

        let (found, source) = if by_model.is_some() {
            (by_model, PresetSource::Model)
        } else if by_tier.is_some() {
            (by_tier, PresetSource::Tier)
        } else {
            (by_provider, PresetSource::Provider)
        };

        match found {
            Some(e) => ResolvedPreset {
                max_concurrency: e.max_concurrency.max(1),
                rate: e.rate_limit(),
                source,
            },
            None => ResolvedPreset {
                max_concurrency: self.default_concurrency,
                rate: self.default_rate,
                source: PresetSource::Default,
            },
        }
    }
}
