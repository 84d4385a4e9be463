//! Content complexity estimation.
//!
//! Scores a prompt's difficulty on a [0,1] scale from three normalized
//! factors: character length, technical-vocabulary hits, and structural
//! character density (braces, operators, digits). The score feeds the
//! quantization tier decision — complex prompts earn more precise tiers
//! when memory allows it.
//!
//! The scorer is pure and total: identical input always yields an identical
//! score, and no input (including empty) produces an error.

use serde::{Deserialize, Serialize};

/// Characters treated as structural: code, math, markup.
const STRUCTURAL_CHARS: &str = "{}[]()<>+-*/\\=^;:";

/// Default technical vocabulary used when the config supplies none.
const DEFAULT_TECHNICAL_TERMS: &[&str] = &[
    "algorithm",
    "function",
    "variable",
    "module",
    "tensor",
    "derivative",
    "integral",
    "matrix",
    "vector",
    "quantum",
    "regression",
    "neural network",
    "transformer",
    "attention",
    "parameter",
    "coefficient",
    "theorem",
    "equation",
];

/// A computed complexity score plus the raw factor values behind it.
///
/// `value` is the weighted combination of the three factors, clipped to
/// [0,1]. The factors are each normalized to [0,1] before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComplexityScore {
    /// Combined score in [0,1].
    pub value: f64,
    /// Normalized character-length factor.
    pub length_factor: f64,
    /// Normalized technical-term factor.
    pub term_factor: f64,
    /// Normalized structural-character factor.
    pub structural_factor: f64,
}

impl ComplexityScore {
    /// The minimum score, returned for empty input.
    pub fn minimum() -> Self {
        Self {
            value: 0.0,
            length_factor: 0.0,
            term_factor: 0.0,
            structural_factor: 0.0,
        }
    }
}

/// Tunable weights and normalization scales for the estimator.
///
/// The exact weighting is configuration, not a fixed formula; these
/// defaults are the tuned production values.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema, PartialEq)]
pub struct ComplexityConfig {
    /// Weight of the length factor.
    #[serde(default = "default_length_weight")]
    pub length_weight: f64,
    /// Weight of the technical-term factor.
    #[serde(default = "default_term_weight")]
    pub term_weight: f64,
    /// Weight of the structural-character factor.
    #[serde(default = "default_structural_weight")]
    pub structural_weight: f64,
    /// Character count at which the length factor saturates to 1.0.
    #[serde(default = "default_length_scale")]
    pub length_scale: usize,
    /// Technical-term hit count at which the term factor saturates.
    #[serde(default = "default_term_scale")]
    pub term_scale: usize,
    /// Structural-character count at which the structural factor saturates.
    #[serde(default = "default_structural_scale")]
    pub structural_scale: usize,
    /// Technical vocabulary matched case-insensitively as substrings.
    /// Empty means "use the built-in list".
    #[serde(default)]
    pub technical_terms: Vec<String>,
}

/// Default weight of the length factor: 0.4.
fn default_length_weight() -> f64 {
    0.4
}

/// Default weight of the technical-term factor: 0.4.
fn default_term_weight() -> f64 {
    0.4
}

/// Default weight of the structural factor: 0.2.
fn default_structural_weight() -> f64 {
    0.2
}

/// Default length saturation point: 10 000 characters.
fn default_length_scale() -> usize {
    10_000
}

/// Default term saturation point: 10 hits.
fn default_term_scale() -> usize {
    10
}

/// Default structural saturation point: 100 characters.
fn default_structural_scale() -> usize {
    100
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            length_weight: default_length_weight(),
            term_weight: default_term_weight(),
            structural_weight: default_structural_weight(),
            length_scale: default_length_scale(),
            term_scale: default_term_scale(),
            structural_scale: default_structural_scale(),
            technical_terms: Vec::new(),
        }
    }
}

/// Pure complexity scorer over UTF-8 text.
#[derive(Debug, Clone)]
pub struct ComplexityEstimator {
    config: ComplexityConfig,
    terms: Vec<String>,
}

impl Default for ComplexityEstimator {
    fn default() -> Self {
        Self::new(ComplexityConfig::default())
    }
}

impl ComplexityEstimator {
    /// Build an estimator from config. An empty term list selects the
    /// built-in vocabulary; terms are lowercased once here so scoring does
    /// not re-normalize them per call.
    pub fn new(config: ComplexityConfig) -> Self {
        let terms = if config.technical_terms.is_empty() {
            DEFAULT_TECHNICAL_TERMS
                .iter()
                .map(|t| (*t).to_string())
                .collect()
        } else {
            config
                .technical_terms
                .iter()
                .map(|t| t.to_lowercase())
                .collect()
        };
        Self { config, terms }
    }

    /// Score a text payload.
    ///
    /// Deterministic, side-effect free, never errors. Empty input returns
    /// [`ComplexityScore::minimum`]. The score is non-decreasing in input
    /// length, term hits, and structural-character count.
    pub fn score(&self, text: &str) -> ComplexityScore {
        if text.is_empty() {
            return ComplexityScore::minimum();
        }

        let length_factor = normalize(text.chars().count(), self.config.length_scale);

        let lowered = text.to_lowercase();
        let term_hits = self.terms.iter().filter(|t| lowered.contains(t.as_str())).count();
        let term_factor = normalize(term_hits, self.config.term_scale);

        let structural_count = text
            .chars()
            .filter(|c| STRUCTURAL_CHARS.contains(*c) || c.is_ascii_digit())
            .count();
        let structural_factor = normalize(structural_count, self.config.structural_scale);

        let value = (self.config.length_weight * length_factor
            + self.config.term_weight * term_factor
            + self.config.structural_weight * structural_factor)
            .clamp(0.0, 1.0);

        tracing::debug!(
            value,
            length_factor,
            term_factor,
            structural_factor,
            "complexity scored"
        );

        ComplexityScore {
            value,
            length_factor,
            term_factor,
            structural_factor,
        }
    }
}

/// `min(1, count / scale)`, tolerating a zero scale.
fn normalize(count: usize, scale: usize) -> f64 {
    if scale == 0 {
        return if count == 0 { 0.0 } else { 1.0 };
    }
    (count as f64 / scale as f64).min(1.0)
}
