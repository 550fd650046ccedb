//! Core domain types shared across the pipeline.
//!
//! These types flow between the technique layer, the fan-out dispatcher,
//! the evaluators, and storage. They are deliberately flat and
//! serde-friendly: the trace and the retrieved-chunk list are persisted
//! as JSON columns on the QA record.

pub mod config;
pub mod trace;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

pub use config::{EvalConfig, RagConfig, TransformationType};
pub use trace::{TraceEvent, TraceRecorder};

/// A semantic unit of a document, produced at ingest.
///
/// `(document_id, ordinal)` is unique across the corpus. Chunks are
/// immutable once ingested and removed only by document deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier, unique across the index.
    pub chunk_id: String,
    /// Document this chunk belongs to.
    pub document_id: String,
    /// Position within the document (0-based).
    pub ordinal: usize,
    /// Chunk text.
    pub text: String,
    /// Optional metadata (filename, section).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// A [`Chunk`] paired with its embedding vector.
///
/// All vectors in an index share one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    /// The underlying chunk.
    pub chunk: Chunk,
    /// Fixed-length embedding.
    pub vector: Vec<f32>,
}

/// A chunk reference produced by a retrieval step.
///
/// Request-scoped: the set is attached to a [`TechniqueResult`], never
/// persisted as a separate entity. `score` means whatever the producing
/// retriever says it means; secondary scores (vector, lexical, rerank)
/// live in `sub_scores`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// Identifier of the underlying chunk.
    pub chunk_id: String,
    /// Snapshot of the chunk text at retrieval time.
    pub text: String,
    /// Snapshot of the chunk metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Primary score assigned by the producing retriever.
    pub score: f64,
    /// Secondary scores keyed by component (`vector_score`, `lexical_score`,
    /// `rerank_score`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_scores: BTreeMap<String, f64>,
}

impl RetrievedChunk {
    /// Records a secondary score component.
    pub fn with_sub_score(mut self, name: &str, value: f64) -> Self {
        self.sub_scores.insert(name.to_string(), value);
        self
    }
}

/// The outcome of one technique on one query.
///
/// Invariant: `error_kind.is_none()` implies `answer` is non-empty.
/// Produced by one technique run; persisted as a QA record row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechniqueResult {
    /// Registry name of the technique that produced this result.
    pub technique: String,
    /// Generated answer. Empty when `error_kind` is set.
    pub answer: String,
    /// Ordered evidence the answer is grounded on (not intermediate
    /// candidates).
    pub retrieved_chunks: Vec<RetrievedChunk>,
    /// Ordered execution trace.
    pub trace: Vec<TraceEvent>,
    /// Wall clock between the first and last retrieval call that
    /// contributed to the final context.
    #[serde(with = "duration_secs")]
    pub retrieval_time: Duration,
    /// Wall clock of the completion that produced `answer`.
    #[serde(with = "duration_secs")]
    pub generation_time: Duration,
    /// Wall clock of the whole run.
    #[serde(with = "duration_secs")]
    pub total_time: Duration,
    /// Failure classification. Absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl TechniqueResult {
    /// Whether the run completed without a recorded failure.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error_kind.is_none()
    }
}

/// Duration as fractional seconds in JSON, for readable persisted traces.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// A conversation thread grouping QA records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Row id.
    pub id: i64,
    /// Human-readable title.
    pub title: String,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds, touched when new QA records land.
    pub updated_at: i64,
}

/// A persisted [`TechniqueResult`] plus its session linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaRecord {
    /// Row id.
    pub id: i64,
    /// Owning session. Always references an existing session.
    pub session_id: i64,
    /// Query text the techniques ran against.
    pub query: String,
    /// The technique outcome.
    #[serde(flatten)]
    pub result: TechniqueResult,
    /// Unix seconds.
    pub created_at: i64,
}

/// Origin of an evaluation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreType {
    /// LLM dimensional judge (0-10 per dimension).
    LlmDimensional,
    /// Reference metrics (0-1 per metric).
    ReferenceMetric,
    /// Manually entered.
    Human,
}

impl ScoreType {
    /// Returns the `snake_case` string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LlmDimensional => "llm_dimensional",
            Self::ReferenceMetric => "reference_metric",
            Self::Human => "human",
        }
    }

    /// Parses the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llm_dimensional" => Some(Self::LlmDimensional),
            "reference_metric" => Some(Self::ReferenceMetric),
            "human" => Some(Self::Human),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evaluation of one QA record by one evaluator.
///
/// For a given `(qa_record_id, score_type, evaluator)` the latest row
/// wins; earlier rows remain as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationScore {
    /// Row id (0 before insert).
    #[serde(default)]
    pub id: i64,
    /// The evaluated QA record.
    pub qa_record_id: i64,
    /// Which track produced this row.
    pub score_type: ScoreType,
    /// Evaluator identifier (e.g. model name).
    pub evaluator: String,
    /// Dimension name to score. Range [0, 10] for the LLM judge,
    /// [0, 1] for reference metrics.
    pub dimensions: BTreeMap<String, f64>,
    /// Unweighted mean of present dimensions, when meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall: Option<f64>,
    /// Free-form carrier for secondary scores and evaluator feedback.
    /// Reference metrics land under `reference_scores.*`.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Unix seconds.
    #[serde(default)]
    pub created_at: i64,
}

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
