//! Governor configuration.
//!
//! ## Responsibility
//! Parse and validate the TOML configuration surface consumed by the
//! control loop: complexity weights, memory thresholds, cache budgets,
//! breaker and retry tuning, health probing, and the backend endpoint.
//!
//! ## Guarantees
//! - Deterministic: the same TOML input always produces the same config
//! - Validated: semantic constraints are checked before a config is used
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Wiring components from config (that belongs to `governor`)
//! - Watching files for changes

use crate::complexity::ComplexityConfig;
use crate::GovernorError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

/// Default soft memory threshold: 80%.
fn default_soft_threshold() -> f64 {
    80.0
}

/// Default hard memory threshold: 90%.
fn default_hard_threshold() -> f64 {
    90.0
}

/// Default memory sampling interval: 15 000 ms.
fn default_sample_interval_ms() -> u64 {
    15_000
}

/// Default snapshot history length: 32 samples.
fn default_history_len() -> usize {
    32
}

/// Default pressure-trend threshold: 0.5 percentage points.
fn default_trend_threshold() -> f64 {
    0.5
}

/// Default cache entry budget: 256 entries.
fn default_cache_max_entries() -> usize {
    256
}

/// Default pressure shrink fraction: 0.5.
fn default_shrink_fraction() -> f64 {
    0.5
}

/// Default breaker failure threshold: 5 counted failures.
fn default_failure_threshold() -> usize {
    5
}

/// Default breaker failure window: 60 seconds.
fn default_breaker_window_s() -> u64 {
    60
}

/// Default breaker cooldown: 30 seconds.
fn default_breaker_cooldown_s() -> u64 {
    30
}

/// Default retry attempts: 3.
fn default_retry_attempts() -> usize {
    3
}

/// Default retry base delay: 100 ms.
fn default_retry_base_ms() -> u64 {
    100
}

/// Default retry maximum delay: 5000 ms.
fn default_retry_max_ms() -> u64 {
    5000
}

/// Default health probe timeout: 2000 ms.
fn default_probe_timeout_ms() -> u64 {
    2000
}

/// Default health check interval: 30 000 ms.
fn default_health_interval_ms() -> u64 {
    30_000
}

/// Default snapshot staleness factor: 3× the sampling interval.
fn default_staleness_factor() -> u32 {
    3
}

/// Default backend URL: local Ollama.
fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

/// Default model: llama3.
fn default_model() -> String {
    "llama3".to_string()
}

/// Default backend request timeout: 30 000 ms.
fn default_request_timeout_ms() -> u64 {
    30_000
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Memory monitoring and pressure thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MemoryConfig {
    /// Percent-used above which the tier is capped near the cheapest.
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold_percent: f64,
    /// Percent-used above which the cheapest tier is forced.
    #[serde(default = "default_hard_threshold")]
    pub hard_threshold_percent: f64,
    /// Sampling interval in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Snapshots retained in the ring (most-recent-N).
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Percent-used delta below which the trend reads stable.
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold_percent: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            soft_threshold_percent: default_soft_threshold(),
            hard_threshold_percent: default_hard_threshold(),
            sample_interval_ms: default_sample_interval_ms(),
            history_len: default_history_len(),
            trend_threshold_percent: default_trend_threshold(),
        }
    }
}

impl MemoryConfig {
    /// Sampling interval as a [`Duration`].
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Response cache budgets.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CacheConfig {
    /// Entry budget.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Optional byte budget. `None` disables the byte bound.
    pub max_bytes: Option<u64>,
    /// Fraction of the entry budget kept while above the hard memory
    /// threshold.
    #[serde(default = "default_shrink_fraction")]
    pub pressure_shrink_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_bytes: None,
            pressure_shrink_fraction: default_shrink_fraction(),
        }
    }
}

impl CacheConfig {
    /// Entry budget while under hard memory pressure.
    pub fn shrunk_entries(&self) -> usize {
        ((self.max_entries as f64) * self.pressure_shrink_fraction).floor() as usize
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BreakerConfig {
    /// Counted failures within the window before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// Sliding failure window in seconds.
    #[serde(default = "default_breaker_window_s")]
    pub window_s: u64,
    /// Seconds the circuit stays open before admitting a trial.
    #[serde(default = "default_breaker_cooldown_s")]
    pub cooldown_s: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_s: default_breaker_window_s(),
            cooldown_s: default_breaker_cooldown_s(),
        }
    }
}

impl BreakerConfig {
    /// Failure window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_s)
    }

    /// Cooldown as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_s)
    }
}

/// Retry tuning for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: usize,
    /// Base delay (ms) for exponential backoff.
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    /// Maximum delay (ms) cap for exponential backoff.
    #[serde(default = "default_retry_max_ms")]
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_ms: default_retry_base_ms(),
            max_ms: default_retry_max_ms(),
        }
    }
}

/// Health monitoring tuning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HealthConfig {
    /// Per-subsystem probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Periodic check interval in milliseconds.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Snapshot staleness bound as a multiple of the sampling interval.
    #[serde(default = "default_staleness_factor")]
    pub staleness_factor: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            interval_ms: default_health_interval_ms(),
            staleness_factor: default_staleness_factor(),
        }
    }
}

impl HealthConfig {
    /// Probe timeout as a [`Duration`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Check interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Inference backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendConfig {
    /// Server base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model name, optionally carrying a tag (`llama3:q4_0`).
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-request timeout in milliseconds; expiry counts as a backend
    /// failure.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BackendConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a governor instance.
///
/// Deserialized from TOML; every field has a documented default, so an
/// empty document is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GovernorConfig {
    /// Complexity estimator weights and scales.
    #[serde(default)]
    pub complexity: ComplexityConfig,
    /// Memory monitoring and pressure thresholds.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Response cache budgets.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Circuit breaker tuning.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Retry tuning.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Health monitoring tuning.
    #[serde(default)]
    pub health: HealthConfig,
    /// Inference backend endpoint.
    #[serde(default)]
    pub backend: BackendConfig,
}

impl GovernorConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// [`GovernorError::Config`] on parse failure. Call
    /// [`GovernorConfig::validate`] afterwards for semantic checks.
    pub fn from_toml_str(input: &str) -> Result<Self, GovernorError> {
        toml::from_str(input).map_err(|e| GovernorError::Config(format!("toml parse: {e}")))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// [`GovernorError::Config`] on I/O or parse failure.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, GovernorError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GovernorError::Config(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check semantic constraints the type system cannot express.
    ///
    /// # Errors
    ///
    /// [`GovernorError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), GovernorError> {
        let field = |name: &str, reason: String| {
            Err(GovernorError::Config(format!("{name}: {reason}")))
        };

        if !(0.0..=100.0).contains(&self.memory.soft_threshold_percent) {
            return field(
                "memory.soft_threshold_percent",
                format!("{} not in [0,100]", self.memory.soft_threshold_percent),
            );
        }
        if !(0.0..=100.0).contains(&self.memory.hard_threshold_percent) {
            return field(
                "memory.hard_threshold_percent",
                format!("{} not in [0,100]", self.memory.hard_threshold_percent),
            );
        }
        if self.memory.soft_threshold_percent >= self.memory.hard_threshold_percent {
            return field(
                "memory.soft_threshold_percent",
                format!(
                    "{} must be below hard threshold {}",
                    self.memory.soft_threshold_percent, self.memory.hard_threshold_percent
                ),
            );
        }
        if self.memory.sample_interval_ms == 0 {
            return field("memory.sample_interval_ms", "must be nonzero".to_string());
        }
        if self.memory.history_len == 0 {
            return field("memory.history_len", "must be nonzero".to_string());
        }
        if self.cache.max_entries == 0 {
            return field("cache.max_entries", "must be nonzero".to_string());
        }
        if !(0.0..=1.0).contains(&self.cache.pressure_shrink_fraction) {
            return field(
                "cache.pressure_shrink_fraction",
                format!("{} not in [0,1]", self.cache.pressure_shrink_fraction),
            );
        }
        if self.breaker.failure_threshold == 0 {
            return field("breaker.failure_threshold", "must be nonzero".to_string());
        }
        if self.retry.max_attempts == 0 {
            return field("retry.max_attempts", "must be nonzero".to_string());
        }
        if self.retry.base_ms > self.retry.max_ms {
            return field(
                "retry.base_ms",
                format!("{} exceeds retry.max_ms {}", self.retry.base_ms, self.retry.max_ms),
            );
        }
        if self.health.probe_timeout_ms == 0 {
            return field("health.probe_timeout_ms", "must be nonzero".to_string());
        }
        if self.backend.base_url.is_empty() {
            return field("backend.base_url", "must not be empty".to_string());
        }
        if self.backend.model.is_empty() {
            return field("backend.model", "must not be empty".to_string());
        }

        let w = &self.complexity;
        for (name, value) in [
            ("complexity.length_weight", w.length_weight),
            ("complexity.term_weight", w.term_weight),
            ("complexity.structural_weight", w.structural_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return field(name, format!("{value} not in [0,1]"));
            }
        }

        Ok(())
    }

    /// Snapshot staleness bound derived from the sampling interval.
    pub fn staleness_bound(&self) -> Duration {
        self.memory.sample_interval() * self.health.staleness_factor
    }
}

/// Export the JSON Schema for [`GovernorConfig`].
///
/// Enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(GovernorConfig);
    serde_json::to_string_pretty(&schema)
}
