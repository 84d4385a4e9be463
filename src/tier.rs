//! Quantization tiers and the adaptive tier controller.
//!
//! ## Responsibility
//! Combine a complexity score with the current memory snapshot into a
//! quantization tier decision, and drive backend reconfiguration when the
//! decision changes the tier.
//!
//! ## Guarantees
//! - Decisions are pure: same inputs, same tier
//! - Movement is rate-limited to one step per decision, except the
//!   hard-threshold override which jumps straight to the cheapest tier
//! - Reconfiguration failure never silently drifts the tier: the caller's
//!   bookkeeping keeps the previous tier
//!
//! ## NOT Responsible For
//! - Sampling memory (see: resource.rs)
//! - The quantization algorithms themselves (opaque backend tiers)

use crate::backend::InferenceBackend;
use crate::complexity::ComplexityScore;
use crate::resource::MemorySnapshot;
use crate::GovernorError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Precision/cost levels offered by the inference backend, cheapest first.
///
/// The ladder mirrors the llama.cpp-style quantization family exposed by
/// Ollama model tags.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[allow(non_camel_case_types)]
pub enum QuantizationTier {
    /// 4-bit, cheapest.
    Q4_0,
    /// 4-bit K-quant, medium quality.
    Q4KM,
    /// 5-bit K-quant.
    Q5KM,
    /// 8-bit.
    Q8_0,
    /// Half-precision floats, most precise and most expensive.
    F16,
}

/// The full ladder, cheapest → most precise.
pub const TIER_LADDER: [QuantizationTier; 5] = [
    QuantizationTier::Q4_0,
    QuantizationTier::Q4KM,
    QuantizationTier::Q5KM,
    QuantizationTier::Q8_0,
    QuantizationTier::F16,
];

impl QuantizationTier {
    /// Position on the ladder: 0 = cheapest.
    pub fn ordinal(self) -> usize {
        match self {
            Self::Q4_0 => 0,
            Self::Q4KM => 1,
            Self::Q5KM => 2,
            Self::Q8_0 => 3,
            Self::F16 => 4,
        }
    }

    /// Tier at the given ladder position, clamped to the ladder ends.
    pub fn from_ordinal(ordinal: usize) -> Self {
        TIER_LADDER[ordinal.min(TIER_LADDER.len() - 1)]
    }

    /// The cheapest tier on the ladder.
    pub fn cheapest() -> Self {
        TIER_LADDER[0]
    }

    /// The most precise tier on the ladder.
    pub fn most_precise() -> Self {
        TIER_LADDER[TIER_LADDER.len() - 1]
    }

    /// Move one step toward `target`. Already there: no movement.
    pub fn step_toward(self, target: Self) -> Self {
        use std::cmp::Ordering;
        match self.ordinal().cmp(&target.ordinal()) {
            Ordering::Less => Self::from_ordinal(self.ordinal() + 1),
            Ordering::Greater => Self::from_ordinal(self.ordinal() - 1),
            Ordering::Equal => self,
        }
    }

    /// Stable model-tag form, e.g. `"q4_k_m"`. Used in fingerprints and in
    /// `base:tag` backend model names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Q4_0 => "q4_0",
            Self::Q4KM => "q4_k_m",
            Self::Q5KM => "q5_k_m",
            Self::Q8_0 => "q8_0",
            Self::F16 => "f16",
        }
    }
}

impl std::fmt::Display for QuantizationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QuantizationTier {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TIER_LADDER
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| GovernorError::Config(format!("unknown quantization tag: {s}")))
    }
}

/// Memory thresholds governing tier decisions, in percent used.
#[derive(Debug, Clone, Copy)]
pub struct TierThresholds {
    /// Above this, the tier is capped at one step above cheapest.
    pub soft_percent: f64,
    /// Above this, the cheapest tier is forced regardless of complexity.
    pub hard_percent: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            soft_percent: 80.0,
            hard_percent: 90.0,
        }
    }
}

/// Adaptive quantization controller.
///
/// Holds no persistent entities — [`QuantizationController::decide`] is a
/// pure function over the snapshot it is given. The side-effecting
/// [`QuantizationController::select_tier`] additionally reconfigures the
/// backend when the decision moves the tier.
pub struct QuantizationController {
    backend: Arc<dyn InferenceBackend>,
    thresholds: TierThresholds,
}

impl std::fmt::Debug for QuantizationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizationController")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl QuantizationController {
    /// Create a controller over the given backend and thresholds.
    pub fn new(backend: Arc<dyn InferenceBackend>, thresholds: TierThresholds) -> Self {
        Self {
            backend,
            thresholds,
        }
    }

    /// Pure tier decision. Precedence:
    ///
    /// 1. Hard threshold exceeded → cheapest tier, jumping any distance.
    /// 2. Soft threshold exceeded → ceiling of one step above cheapest.
    /// 3. Complexity maps linearly onto the ladder, under any ceiling.
    /// 4. Movement is limited to one step from `current` per decision.
    pub fn decide(
        &self,
        complexity: &ComplexityScore,
        snapshot: &MemorySnapshot,
        current: QuantizationTier,
    ) -> QuantizationTier {
        if snapshot.percent_used > self.thresholds.hard_percent {
            debug!(
                percent_used = snapshot.percent_used,
                "critical memory pressure, forcing cheapest tier"
            );
            return QuantizationTier::cheapest();
        }

        let top = (TIER_LADDER.len() - 1) as f64;
        let mut target = (complexity.value.clamp(0.0, 1.0) * top).round() as usize;

        if snapshot.percent_used > self.thresholds.soft_percent {
            target = target.min(1);
        }

        let decided = current.step_toward(QuantizationTier::from_ordinal(target));
        debug!(
            complexity = complexity.value,
            percent_used = snapshot.percent_used,
            current = %current,
            decided = %decided,
            "tier decision"
        );
        decided
    }

    /// Decide a tier and, when it differs from `current`, reconfigure the
    /// backend before returning.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Reconfigure`] when the backend rejects the
    /// switch. The caller must keep `current` as its tier — no silent
    /// drift on failure.
    pub async fn select_tier(
        &self,
        complexity: &ComplexityScore,
        snapshot: &MemorySnapshot,
        current: QuantizationTier,
    ) -> Result<QuantizationTier, GovernorError> {
        let decided = self.decide(complexity, snapshot, current);
        if decided == current {
            return Ok(current);
        }

        match self.backend.reconfigure(decided).await {
            Ok(()) => {
                info!(from = %current, to = %decided, "tier reconfigured");
                Ok(decided)
            }
            Err(e) => {
                warn!(from = %current, to = %decided, error = %e, "tier reconfiguration failed");
                Err(GovernorError::Reconfigure(e.to_string()))
            }
        }
    }
}
