use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::admission::adaptive::AdaptiveConfig;
use crate::admission::presets::PresetEntry;
use crate::core::validator::ValidationConfig;
use crate::orchestration::retry::RetryPolicy;
use crate::{Error, Result};

/// Tuning profile. `Stable` trades throughput for fewer provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Default,
    Stable,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Default => "default",
            Profile::Stable => "stable",
        }
    }

    /// Multiplier applied to preset concurrencies.
    pub fn concurrency_scale(self) -> f64 {
        match self {
            Profile::Default => 1.0,
            Profile::Stable => 0.5,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(Profile::Default),
            "stable" => Ok(Profile::Stable),
            other => Err(Error::Config(format!("unknown profile '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub preemption_enabled: bool,
    #[serde(default)]
    pub weighted_scheduling: bool,
    /// Overrides the default concurrency for providers without a preset.
    pub max_parallelism: Option<u32>,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    /// Overrides the profile's retry policy when set.
    pub retry: Option<RetryPolicy>,
    /// Extra preset rows; these win over the built-in table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<PresetEntry>,
}

impl Config {
    pub fn tempo_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".tempo"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::tempo_dir()?.join("tempo.toml"))
    }

    /// Load `~/.tempo/tempo.toml` (defaults when absent), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        tracing::debug!(
            profile = %config.profile,
            preemption = config.preemption_enabled,
            weighted = config.weighted_scheduling,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let tempo_dir = Self::tempo_dir()?;
        if !tempo_dir.exists() {
            tracing::debug!(dir = %tempo_dir.display(), "Creating tempo directory");
            fs::create_dir_all(&tempo_dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Apply `TEMPO_PREEMPTION`, `TEMPO_WEIGHTED_SCHEDULING` and
    /// `TEMPO_PROFILE`. Unparseable values are logged and ignored.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var("TEMPO_PREEMPTION") {
            match parse_flag(&value) {
                Some(flag) => self.preemption_enabled = flag,
                None => tracing::warn!(value = %value, "ignoring invalid TEMPO_PREEMPTION"),
            }
        }
        if let Some(value) = var("TEMPO_WEIGHTED_SCHEDULING") {
            match parse_flag(&value) {
                Some(flag) => self.weighted_scheduling = flag,
                None => {
                    tracing::warn!(value = %value, "ignoring invalid TEMPO_WEIGHTED_SCHEDULING")
                }
            }
        }
        if let Some(value) = var("TEMPO_PROFILE") {
            match value.parse() {
                Ok(profile) => self.profile = profile,
                Err(e) => tracing::warn!(error = %e, "ignoring invalid TEMPO_PROFILE"),
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::for_profile(self.profile))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
