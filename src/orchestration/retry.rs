//! Failure classification and retry backoff.
//!
//! A task-execution callback reports failures as [`TaskFailure`]. The
//! classifier maps each one to an [`OutcomeCode`] and a retry disposition;
//! [`BackoffConfig`] turns an attempt number into a delay.

use crate::config::Profile;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Default maximum length of a stored failure diagnostic.
pub const DEFAULT_DIAGNOSTIC_CHARS: usize = 500;

/// Failure reported by a task-execution callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskFailure {
    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error(
        "rate limited{}",
        .retry_after_ms.map(|ms| format!(" (retry after {}ms)", ms)).unwrap_or_default()
    )]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("empty output: {0}")]
    EmptyOutput(String),

    #[error("{0}")]
    Message(String),
}

impl TaskFailure {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Canonical outcome codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeCode {
    Success,
    PartialSuccess,
    Cancelled,
    Timeout,
    RateLimit,
    RetryableFailure,
    SchemaViolation,
    EmptyOutput,
    NonretryableFailure,
}

impl OutcomeCode {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeCode::Success => "SUCCESS",
            OutcomeCode::PartialSuccess => "PARTIAL_SUCCESS",
            OutcomeCode::Cancelled => "CANCELLED",
            OutcomeCode::Timeout => "TIMEOUT",
            OutcomeCode::RateLimit => "RATE_LIMIT",
            OutcomeCode::RetryableFailure => "RETRYABLE_FAILURE",
            OutcomeCode::SchemaViolation => "SCHEMA_VIOLATION",
            OutcomeCode::EmptyOutput => "EMPTY_OUTPUT",
            OutcomeCode::NonretryableFailure => "NONRETRYABLE_FAILURE",
        }
    }

    /// Whether a failure with this code is worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            OutcomeCode::Timeout
                | OutcomeCode::RateLimit
                | OutcomeCode::RetryableFailure
                | OutcomeCode::SchemaViolation
                | OutcomeCode::EmptyOutput
        )
    }

    /// Ordering used for aggregate outcomes; higher is more successful.
    pub fn success_rank(self) -> u8 {
        match self {
            OutcomeCode::Success => 3,
            OutcomeCode::PartialSuccess => 2,
            OutcomeCode::RetryableFailure => 1,
            _ => 0,
        }
    }
}

impl std::fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub code: OutcomeCode,
    pub retryable: bool,
}

impl From<OutcomeCode> for Classification {
    fn from(code: OutcomeCode) -> Self {
        Self {
            code,
            retryable: code.is_retryable(),
        }
    }
}

static CANCELLED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(cancell?ed|aborted)\b").unwrap());

static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\btimed?[ _-]?out\b|deadline exceeded|\betimedout\b)").unwrap()
});

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate[ _-]?limit|too many requests|\b429\b|quota exceeded)").unwrap()
});

static SCHEMA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(schema|invalid json|failed to parse|unexpected token|missing field)").unwrap()
});

/// Entity-specific empty-output sentinels, e.g. "no entities extracted".
static EMPTY_OUTPUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(empty (output|response|result)|returned nothing|no (output|content) (returned|produced)|no \w+ (were )?(extracted|returned|generated))",
    )
    .unwrap()
});

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(connection (reset|refused|closed)|temporarily unavailable|service unavailable|bad gateway|overloaded|try again|\b5\d\d\b)",
    )
    .unwrap()
});

/// Classify a failure into an outcome code and retry disposition.
pub fn classify(failure: &TaskFailure) -> Classification {
    let code = match failure {
        TaskFailure::Cancelled => OutcomeCode::Cancelled,
        TaskFailure::Timeout { .. } => OutcomeCode::Timeout,
        TaskFailure::RateLimited { .. } => OutcomeCode::RateLimit,
        TaskFailure::Http { status: 429, .. } => OutcomeCode::RateLimit,
        TaskFailure::Http { status, .. } if (500..600).contains(status) => {
            OutcomeCode::RetryableFailure
        }
        TaskFailure::Http { status, .. } if (400..500).contains(status) => {
            OutcomeCode::NonretryableFailure
        }
        TaskFailure::Http { message, .. } => classify_text(message),
        TaskFailure::SchemaViolation(_) => OutcomeCode::SchemaViolation,
        TaskFailure::EmptyOutput(_) => OutcomeCode::EmptyOutput,
        TaskFailure::Message(message) => classify_text(message),
    };
    code.into()
}

/// Classify free-form failure text. Unrecognised text is not retryable.
pub fn classify_text(text: &str) -> OutcomeCode {
    if CANCELLED_RE.is_match(text) {
        OutcomeCode::Cancelled
    } else if RATE_LIMIT_RE.is_match(text) {
        OutcomeCode::RateLimit
    } else if TIMEOUT_RE.is_match(text) {
        OutcomeCode::Timeout
    } else if SCHEMA_RE.is_match(text) {
        OutcomeCode::SchemaViolation
    } else if EMPTY_OUTPUT_RE.is_match(text) {
        OutcomeCode::EmptyOutput
    } else if TRANSIENT_RE.is_match(text) {
        OutcomeCode::RetryableFailure
    } else {
        OutcomeCode::NonretryableFailure
    }
}

/// Randomization applied on top of the exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    #[default]
    None,
    /// Uniform in `[delay / 2, delay]`.
    Partial,
    /// Uniform in `[0, delay]`.
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: JitterMode,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: JitterMode::None,
        }
    }
}

impl BackoffConfig {
    /// Deterministic delay for a 1-indexed attempt:
    /// `min(max, initial * multiplier^(attempt - 1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(0.0).powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay with jitter drawn from `rng`.
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        let ms = match self.jitter {
            JitterMode::None => base,
            JitterMode::Partial => {
                let half = base / 2;
                half + rng.gen_range(0..=base - half)
            }
            JitterMode::Full => rng.gen_range(0..=base),
        };
        Duration::from_millis(ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }
}

/// Retry budget plus backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_profile(Profile::Default)
    }
}

impl RetryPolicy {
    pub fn for_profile(profile: Profile) -> Self {
        match profile {
            Profile::Default => Self {
                max_retries: 3,
                backoff: BackoffConfig {
                    initial_delay_ms: 1000,
                    multiplier: 2.0,
                    max_delay_ms: 30_000,
                    jitter: JitterMode::Partial,
                },
            },
            Profile::Stable => Self {
                max_retries: 5,
                backoff: BackoffConfig {
                    initial_delay_ms: 2000,
                    multiplier: 2.0,
                    max_delay_ms: 60_000,
                    jitter: JitterMode::Full,
                },
            },
        }
    }

    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn should_retry(&self, classification: Classification, attempts: u32) -> bool {
        classification.retryable && attempts <= self.max_retries
    }

    /// Backoff before the next attempt, honoring a server-provided
    /// retry-after when it is longer.
    pub fn delay_for(&self, failure: &TaskFailure, attempt: u32) -> Duration {
        let backoff = self.backoff.delay(attempt);
        match failure {
            TaskFailure::RateLimited {
                retry_after_ms: Some(ms),
            } => backoff.max(Duration::from_millis(*ms)),
            _ => backoff,
        }
    }
}

/// Outcome of one entity in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Succeeded,
    Failed { retryable: bool },
}

impl From<Classification> for EntityOutcome {
    fn from(c: Classification) -> Self {
        EntityOutcome::Failed {
            retryable: c.retryable,
        }
    }
}

impl<T> From<&std::result::Result<T, TaskFailure>> for EntityOutcome {
    fn from(result: &std::result::Result<T, TaskFailure>) -> Self {
        match result {
            Ok(_) => EntityOutcome::Succeeded,
            Err(failure) => classify(failure).into(),
        }
    }
}

/// Aggregate a batch of entity outcomes.
///
/// An empty batch or a batch where everything succeeded is `SUCCESS`; any
/// success alongside a failure is `PARTIAL_SUCCESS`; an all-failed batch is
/// `RETRYABLE_FAILURE` if any failure is retryable and
/// `NONRETRYABLE_FAILURE` otherwise.
pub fn resolve_aggregate_outcome(results: &[EntityOutcome]) -> OutcomeCode {
    let succeeded = results
        .iter()
        .filter(|r| matches!(r, EntityOutcome::Succeeded))
        .count();
    if succeeded == results.len() {
        return OutcomeCode::Success;
    }
    if succeeded > 0 {
        return OutcomeCode::PartialSuccess;
    }
    let any_retryable = results
        .iter()
        .any(|r| matches!(r, EntityOutcome::Failed { retryable: true }));
    if any_retryable {
        OutcomeCode::RetryableFailure
    } else {
        OutcomeCode::NonretryableFailure
    }
}

/// Collapse whitespace and bound a diagnostic to `max_chars` characters.
pub fn trim_diagnostic(message: &str, max_chars: usize) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let keep = max_chars.saturating_sub(3);
    let mut trimmed: String = collapsed.chars().take(keep).collect();
    trimmed.push_str("...");
    trimmed
}
