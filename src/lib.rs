//! # tokio-inference-governor
//!
//! A resource-aware adaptive controller for local LLM inference over Tokio.
//!
//! ## Architecture
//!
//! One decision loop per request, one background sampling task:
//! ```text
//! InferenceRequest → complexity score → memory snapshot → tier decision
//!                  → fingerprint → cache (single-flight)
//!                  → retry( circuit-breaker( backend.infer ) ) → reply
//! ```
//! The [`resource::ResourceMonitor`] ticks independently and the governor
//! reacts to pressure by shrinking the cache and degrading the tier.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod complexity;
pub mod config;
pub mod governor;
pub mod health;
pub mod resilience;
pub mod resource;
pub mod tier;

// Re-exports for convenience
pub use backend::{EchoBackend, InferenceBackend, OllamaBackend};
pub use complexity::{ComplexityEstimator, ComplexityScore};
pub use config::GovernorConfig;
pub use governor::{GovernorHandles, InferenceGovernor};
pub use health::{HealthMonitor, HealthReport};
pub use resilience::{CircuitBreaker, CircuitStatus, ResponseCache, RetryPolicy};
pub use resource::{MemorySnapshot, PressureTrend, ResourceMonitor};
pub use tier::{QuantizationController, QuantizationTier};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`GovernorError::Config`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), GovernorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| GovernorError::Config(format!("tracing init failed: {e}")))
}

/// Top-level governor errors.
///
/// One variant per failure category so callers can distinguish a fast-fail
/// circuit rejection from a genuine backend error, and the circuit breaker
/// can tell counted (backend/transport) failures from caller mistakes.
///
/// The type is `Clone` because a single failure is fanned out to every
/// request coalesced onto the same in-flight cache computation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    /// The inference backend failed (transport error, server error, or a
    /// malformed response). Counts toward the circuit breaker.
    #[error("inference backend failed: {0}")]
    Backend(String),

    /// The inference call exceeded its deadline. Counts toward the circuit
    /// breaker.
    #[error("inference timed out after {0}ms")]
    Timeout(u64),

    /// The caller supplied invalid input (e.g. rejected generation
    /// parameters). Does NOT count toward the circuit breaker — it is not
    /// evidence of backend unhealthiness.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The circuit breaker is open; the backend was never reached.
    /// Distinguishable from [`GovernorError::Backend`] so callers can apply
    /// different user-facing messaging.
    #[error("circuit open: inference backend unavailable")]
    CircuitOpen,

    /// A quantization tier switch was rejected by the backend. The previous
    /// tier remains in effect; the request proceeds at the unchanged tier.
    #[error("tier reconfiguration rejected: {0}")]
    Reconfigure(String),

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first inference call.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GovernorError {
    /// Whether this failure counts toward the circuit breaker's threshold.
    ///
    /// Only backend/transport failures are evidence of backend
    /// unhealthiness; caller errors, fast-fail rejections, and tier-switch
    /// refusals are not.
    pub fn is_counted(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_))
    }
}

/// Unique session identifier for request tracking.
///
/// Sessions group related requests; the per-session tier sticks across
/// requests so tier movement stays rate-limited.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(
    /// The raw string ID, typically a UUID or user-provided token.
    pub String,
);

impl SessionId {
    /// Create a new [`SessionId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the session ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Generation parameters forwarded to the inference backend.
///
/// Part of the cache fingerprint: two requests with different parameters
/// never share a cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

impl GenerationParams {
    /// Canonical textual encoding used for fingerprinting.
    ///
    /// Floats are rendered with fixed precision so the same parameters
    /// always produce the same bytes.
    pub fn canonical(&self) -> String {
        format!(
            "max_tokens={};temperature={:.4};top_p={:.4}",
            self.max_tokens, self.temperature, self.top_p
        )
    }
}

/// A single inference request submitted to the governor.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Session this request belongs to.
    pub session: SessionId,
    /// Unique identifier for this individual request, used for trace
    /// correlation.
    pub request_id: String,
    /// The raw user-supplied prompt text.
    pub prompt: String,
    /// Generation parameters.
    pub params: GenerationParams,
}

/// The governor's reply to an [`InferenceRequest`].
#[derive(Debug, Clone, Serialize)]
pub struct InferenceReply {
    /// Request ID propagated from the originating request.
    pub request_id: String,
    /// Generated (or cached) response text.
    pub text: String,
    /// The quantization tier the decision loop selected for this request.
    pub tier: QuantizationTier,
    /// Whether the response was served from a completed cache entry.
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counted_classification() {
        assert!(GovernorError::Backend("boom".into()).is_counted());
        assert!(GovernorError::Timeout(500).is_counted());
        assert!(!GovernorError::InvalidRequest("bad".into()).is_counted());
        assert!(!GovernorError::CircuitOpen.is_counted());
        assert!(!GovernorError::Reconfigure("no tag".into()).is_counted());
        assert!(!GovernorError::Config("missing".into()).is_counted());
    }

    #[test]
    fn test_error_display_includes_message() {
        let err = GovernorError::Config("soft_threshold_percent out of range".to_string());
        assert!(err.to_string().contains("soft_threshold_percent"));
    }

    #[test]
    fn test_session_id_as_str_round_trips() {
        let session = SessionId::new("my-session");
        assert_eq!(session.as_str(), "my-session");
    }

    #[test]
    fn test_generation_params_canonical_is_deterministic() {
        let a = GenerationParams::default();
        let b = GenerationParams::default();
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_generation_params_canonical_distinguishes_values() {
        let a = GenerationParams::default();
        let b = GenerationParams {
            temperature: 0.8,
            ..GenerationParams::default()
        };
        assert_ne!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order.
        let _ = init_tracing();
        // Second call must not panic — it should return Err.
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
