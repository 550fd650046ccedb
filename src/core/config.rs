//! Per-query configuration for the technique and evaluator pipelines.
//!
//! Requests carry a JSON mapping of recognized keys; unknown keys are
//! ignored silently so older clients can keep sending leaner configs.
//! Values are clamped into their legal ranges at access time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default final context size.
pub const DEFAULT_TOP_K: usize = 5;
/// Default fan-out concurrency bound.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
/// Fan-out concurrency ceiling.
pub const MAX_CONCURRENCY_CEILING: usize = 10;
/// Default per-technique timeout in seconds.
pub const DEFAULT_TECHNIQUE_TIMEOUT_S: f64 = 120.0;
/// Default number of decompose sub-queries.
pub const DEFAULT_NUM_SUBQUERIES: usize = 3;
/// Default cosine-distance threshold for diversity selection.
pub const DEFAULT_DIVERSITY_THETA: f64 = 0.15;
/// Default temperature for hypothetical-document generation.
pub const DEFAULT_HYDE_TEMPERATURE: f32 = 0.7;
/// Minimum reranker candidate pool.
pub const RERANK_CANDIDATE_FLOOR: usize = 20;
/// Default evaluation concurrency bound.
pub const DEFAULT_EVAL_CONCURRENCY: usize = 2;
/// Evaluation concurrency ceiling.
pub const MAX_EVAL_CONCURRENCY: usize = 5;
/// Default reference-metric evaluation timeout in seconds.
pub const DEFAULT_REFERENCE_TIMEOUT_S: u64 = 300;

/// Sub-mode of the query-transformation technique.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformationType {
    /// Rewrite the query to be more specific (one LLM call).
    #[default]
    Rewrite,
    /// Produce one broader query.
    Stepback,
    /// Produce N sub-queries retrieved independently.
    Decompose,
}

impl TransformationType {
    /// Returns the lowercase string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rewrite => "rewrite",
            Self::Stepback => "stepback",
            Self::Decompose => "decompose",
        }
    }
}

/// Recognized per-query configuration, shared by all techniques.
///
/// Deserialized from the request's config mapping; any key not listed
/// here is dropped by serde without error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Final context size.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Fan-out concurrency bound (clamped to 1..=10).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-technique timeout, seconds.
    #[serde(default = "default_technique_timeout")]
    pub per_technique_timeout_s: f64,
    /// Reranker candidate pool override (default `4 * top_k`, floor 20).
    #[serde(default)]
    pub rerank_candidates: Option<usize>,
    /// Fusion weight for the vector component.
    #[serde(default = "default_half")]
    pub vector_weight: f64,
    /// Fusion weight for the lexical component.
    #[serde(default = "default_half")]
    pub lexical_weight: f64,
    /// Sub-mode for the query-transformation technique.
    #[serde(default)]
    pub transformation_type: TransformationType,
    /// Number of decompose sub-queries.
    #[serde(default = "default_num_subqueries")]
    pub num_subqueries: usize,
    /// Minimum composite score for a self-reflective answer candidate to
    /// be eligible; the best candidate is used regardless when none pass.
    #[serde(default)]
    pub min_support_score: Option<f64>,
    /// Cosine-distance threshold for diversity-biased selection.
    #[serde(default = "default_diversity_theta")]
    pub diversity_theta: f64,
    /// Temperature for hypothetical-document generation.
    #[serde(default = "default_hyde_temperature")]
    pub hyde_temperature: f32,
}

const fn default_top_k() -> usize {
    DEFAULT_TOP_K
}
const fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
const fn default_technique_timeout() -> f64 {
    DEFAULT_TECHNIQUE_TIMEOUT_S
}
const fn default_half() -> f64 {
    0.5
}
const fn default_num_subqueries() -> usize {
    DEFAULT_NUM_SUBQUERIES
}
const fn default_diversity_theta() -> f64 {
    DEFAULT_DIVERSITY_THETA
}
const fn default_hyde_temperature() -> f32 {
    DEFAULT_HYDE_TEMPERATURE
}

impl Default for RagConfig {
    fn default() -> Self {
        // A default-constructed Value deserializes to all defaults.
        Self::from_value(&serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl RagConfig {
    /// Parses a config mapping, ignoring unknown keys.
    ///
    /// Malformed values fall back to their defaults rather than failing
    /// the request; a request-level config is advisory, not load-bearing.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
            top_k: DEFAULT_TOP_K,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            per_technique_timeout_s: DEFAULT_TECHNIQUE_TIMEOUT_S,
            rerank_candidates: None,
            vector_weight: 0.5,
            lexical_weight: 0.5,
            transformation_type: TransformationType::default(),
            num_subqueries: DEFAULT_NUM_SUBQUERIES,
            min_support_score: None,
            diversity_theta: DEFAULT_DIVERSITY_THETA,
            hyde_temperature: DEFAULT_HYDE_TEMPERATURE,
        })
    }

    /// Fan-out concurrency clamped to its legal range.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        clamp(self.max_concurrency, 1, MAX_CONCURRENCY_CEILING)
    }

    /// Per-technique timeout as a [`Duration`].
    #[must_use]
    pub fn technique_timeout(&self) -> Duration {
        if self.per_technique_timeout_s <= 0.0 {
            Duration::from_secs_f64(DEFAULT_TECHNIQUE_TIMEOUT_S)
        } else {
            Duration::from_secs_f64(self.per_technique_timeout_s)
        }
    }

    /// Effective reranker candidate pool for this `top_k`.
    #[must_use]
    pub fn rerank_pool(&self) -> usize {
        self.rerank_candidates
            .unwrap_or(self.top_k.saturating_mul(4))
            .max(RERANK_CANDIDATE_FLOOR)
    }

    /// Effective fusion candidate width: `max(top_k, 10)`.
    #[must_use]
    pub const fn fusion_width(&self) -> usize {
        if self.top_k > 10 { self.top_k } else { 10 }
    }
}

/// Configuration for the evaluation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Evaluation concurrency bound (clamped to 1..=5).
    #[serde(default = "default_eval_concurrency")]
    pub eval_concurrency: usize,
    /// Per-evaluation timeout for the reference track, seconds.
    #[serde(default = "default_reference_timeout")]
    pub reference_timeout_s: u64,
    /// Run the LLM dimensional judge.
    #[serde(default = "default_true")]
    pub use_llm: bool,
    /// Run the reference-metric track.
    #[serde(default = "default_true")]
    pub use_reference: bool,
}

const fn default_eval_concurrency() -> usize {
    DEFAULT_EVAL_CONCURRENCY
}
const fn default_reference_timeout() -> u64 {
    DEFAULT_REFERENCE_TIMEOUT_S
}
const fn default_true() -> bool {
    true
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            eval_concurrency: DEFAULT_EVAL_CONCURRENCY,
            reference_timeout_s: DEFAULT_REFERENCE_TIMEOUT_S,
            use_llm: true,
            use_reference: true,
        }
    }
}

impl EvalConfig {
    /// Evaluation concurrency clamped to its legal range.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        clamp(self.eval_concurrency, 1, MAX_EVAL_CONCURRENCY)
    }

    /// Reference-track timeout as a [`Duration`].
    #[must_use]
    pub const fn reference_timeout(&self) -> Duration {
        Duration::from_secs(self.reference_timeout_s)
    }
}

const fn clamp(value: usize, lo: usize, hi: usize) -> usize {
    if value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    }
}
