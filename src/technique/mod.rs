//! RAG technique registry and execution pipeline.
//!
//! A technique is one retrieval+generation strategy over the shared
//! capability set (vector index, LLM, embedder). All techniques are
//! constructed per request by the [`TechniqueRegistry`], run through
//! [`execute`], and produce a [`TechniqueResult`] whether they succeed
//! or fail: stage errors are caught here and folded into `error_kind`,
//! never propagated to the dispatcher.
//!
//! # Architecture
//!
//! ```text
//! Query ->  dispatcher
//!   |- registry.construct(name) per technique
//!   |- execute(technique)           one per fan-out slot
//!   |    |- technique.run()         embeds / searches / completes
//!   |    |     (trace events at every decision point)
//!   |    '- fold Ok/Err into TechniqueResult
//!   '- results in request order
//! ```

pub mod adaptive;
pub mod baseline;
pub mod fusion;
pub mod hyde;
pub mod prompt;
pub mod reranker;
pub mod self_reflective;
pub mod transform;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::{
    Completion, CompletionRequest, DocumentFilter, EmbeddingClient, IndexHit, LlmClient,
    VectorIndex,
};
use crate::core::trace::{TraceRecorder, preview, round4};
use crate::core::{RagConfig, RetrievedChunk, TechniqueResult};
use crate::error::{ErrorKind, RequestError, StageError};

pub use adaptive::Adaptive;
pub use baseline::Baseline;
pub use fusion::Fusion;
pub use hyde::Hyde;
pub use reranker::Reranker;
pub use self_reflective::SelfReflective;
pub use transform::QueryTransform;

/// Registry names, in catalog order.
pub const TECHNIQUE_NAMES: [&str; 7] = [
    "baseline",
    "reranker",
    "fusion",
    "hyde",
    "query_transform",
    "adaptive",
    "self_reflective",
];

/// The shared capability set every technique operates over.
///
/// All three collaborators are concurrency-safe; the index is read-only
/// for the duration of a request.
#[derive(Clone)]
pub struct Capabilities {
    /// Vector index collaborator.
    pub index: Arc<dyn VectorIndex>,
    /// Language model client.
    pub llm: Arc<dyn LlmClient>,
    /// Embedding client.
    pub embedder: Arc<dyn EmbeddingClient>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("llm", &self.llm.name())
            .finish_non_exhaustive()
    }
}

/// Timing measured across one technique run.
#[derive(Debug, Default, Clone, Copy)]
struct RunMetrics {
    retrieval_first: Option<Instant>,
    retrieval_last: Option<Instant>,
    generation: Duration,
}

/// Request-scoped state observed by one technique run.
///
/// Owns the trace recorder and the cancellation signal. The dispatcher
/// keeps a clone of the containing [`Arc`] so partial traces survive
/// timeouts and cancellation.
#[derive(Debug)]
pub struct RunContext {
    recorder: TraceRecorder,
    cancel: CancellationToken,
    filter: DocumentFilter,
    metrics: Mutex<RunMetrics>,
}

impl RunContext {
    /// Creates a context scoped to `filter`, observing `cancel`.
    #[must_use]
    pub fn new(filter: DocumentFilter, cancel: CancellationToken) -> Self {
        Self {
            recorder: TraceRecorder::new(),
            cancel,
            filter,
            metrics: Mutex::new(RunMetrics::default()),
        }
    }

    /// The run's trace recorder.
    #[must_use]
    pub const fn recorder(&self) -> &TraceRecorder {
        &self.recorder
    }

    /// The request's document scope.
    #[must_use]
    pub const fn filter(&self) -> &DocumentFilter {
        &self.filter
    }

    /// Observes the cancellation signal; called between outbound calls.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Canceled`] once the caller has canceled.
    pub fn checkpoint(&self, stage: &'static str) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(StageError::Canceled { stage });
        }
        Ok(())
    }

    fn mark_retrieval(&self, start: Instant, end: Instant) {
        if let Ok(mut metrics) = self.metrics.lock() {
            if metrics.retrieval_first.is_none() {
                metrics.retrieval_first = Some(start);
            }
            metrics.retrieval_last = Some(end);
        }
    }

    fn set_generation(&self, elapsed: Duration) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.generation = elapsed;
        }
    }

    /// Wall clock between the first and last retrieval-side call so far.
    #[must_use]
    pub fn retrieval_time(&self) -> Duration {
        self.metrics.lock().map_or(Duration::ZERO, |m| {
            match (m.retrieval_first, m.retrieval_last) {
                (Some(first), Some(last)) => last.saturating_duration_since(first),
                _ => Duration::ZERO,
            }
        })
    }

    /// Wall clock of the completion that produced the current answer.
    #[must_use]
    pub fn generation_time(&self) -> Duration {
        self.metrics.lock().map_or(Duration::ZERO, |m| m.generation)
    }
}

/// A technique's successful output before it is folded into a
/// [`TechniqueResult`].
#[derive(Debug, Clone)]
pub struct Draft {
    /// Generated answer text.
    pub answer: String,
    /// Ordered evidence the answer is grounded on.
    pub retrieved_chunks: Vec<RetrievedChunk>,
}

/// Trait implemented by every RAG technique.
///
/// Implementations are request-scoped and cheap to construct: all heavy
/// state lives behind the shared [`Capabilities`]. A technique's `run`
/// returns [`StageError`] freely; [`execute`] owns the catch-and-fold.
#[async_trait]
pub trait Technique: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Config keys this technique honors, echoed in the `init` event.
    fn config_keys(&self) -> &'static [&'static str] {
        &["top_k"]
    }

    /// Produces an answer and its supporting context for `query`.
    async fn run(&self, query: &str, top_k: usize, cx: &RunContext)
    -> Result<Draft, StageError>;
}

/// Catalog of techniques; constructs instances per request.
///
/// Construction is allocation-only. Unknown config keys were already
/// dropped when the [`RagConfig`] was parsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TechniqueRegistry;

impl TechniqueRegistry {
    /// Names of every available technique.
    #[must_use]
    pub const fn available() -> &'static [&'static str] {
        &TECHNIQUE_NAMES
    }

    /// Whether `name` is a known technique.
    #[must_use]
    pub fn contains(name: &str) -> bool {
        TECHNIQUE_NAMES.contains(&name)
    }

    /// Constructs the named technique over `caps` with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::UnknownTechnique`] for names outside the
    /// catalog.
    pub fn construct(
        name: &str,
        caps: &Capabilities,
        config: &RagConfig,
    ) -> Result<Box<dyn Technique>, RequestError> {
        match name {
            "baseline" => Ok(Box::new(Baseline::new(caps.clone()))),
            "reranker" => Ok(Box::new(Reranker::new(caps.clone(), config))),
            "fusion" => Ok(Box::new(Fusion::new(caps.clone(), config))),
            "hyde" => Ok(Box::new(Hyde::new(caps.clone(), config))),
            "query_transform" => Ok(Box::new(QueryTransform::new(caps.clone(), config))),
            "adaptive" => Ok(Box::new(Adaptive::new(caps.clone(), config))),
            "self_reflective" => Ok(Box::new(SelfReflective::new(caps.clone(), config))),
            other => Err(RequestError::UnknownTechnique {
                name: other.to_string(),
            }),
        }
    }
}

/// Runs one technique to completion, folding any failure into the result.
///
/// This is the only place a technique's errors are observed: the
/// dispatcher treats the absence of a returned result as an
/// infrastructure fault.
pub async fn execute(
    technique: &dyn Technique,
    query: &str,
    top_k: usize,
    cx: &RunContext,
) -> TechniqueResult {
    let started = Instant::now();

    let mut details = serde_json::Map::new();
    details.insert("top_k".to_string(), serde_json::json!(top_k));
    details.insert(
        "config_keys".to_string(),
        serde_json::json!(technique.config_keys()),
    );
    cx.recorder()
        .log_with("init", preview(query, 100), details);

    let outcome = technique.run(query, top_k, cx).await;

    let (answer, retrieved_chunks, error_kind) = match outcome {
        Ok(draft) if draft.answer.trim().is_empty() => {
            // Success with an empty answer violates the result invariant;
            // surface it as an LLM failure instead.
            cx.recorder()
                .log("generate_error", "model returned an empty answer");
            (String::new(), draft.retrieved_chunks, Some(ErrorKind::LlmFailed))
        }
        Ok(draft) => (draft.answer, draft.retrieved_chunks, None),
        Err(err) => {
            cx.recorder()
                .log(&format!("{}_error", err.stage()), err.to_string());
            tracing::warn!(technique = technique.name(), error = %err, "technique failed");
            (String::new(), Vec::new(), Some(err.error_kind()))
        }
    };

    TechniqueResult {
        technique: technique.name().to_string(),
        answer,
        retrieved_chunks,
        trace: cx.recorder().snapshot(),
        retrieval_time: cx.retrieval_time(),
        generation_time: cx.generation_time(),
        total_time: started.elapsed(),
        error_kind,
    }
}

/// Builds a result for a run the dispatcher interrupted (timeout or
/// request-level cancellation), preserving the partial trace.
#[must_use]
pub fn interrupted_result(
    name: &str,
    cx: &RunContext,
    kind: ErrorKind,
    started: Instant,
) -> TechniqueResult {
    TechniqueResult {
        technique: name.to_string(),
        answer: String::new(),
        retrieved_chunks: Vec::new(),
        trace: cx.recorder().snapshot(),
        retrieval_time: cx.retrieval_time(),
        generation_time: cx.generation_time(),
        total_time: started.elapsed(),
        error_kind: Some(kind),
    }
}

// ==================== Shared pipeline steps ====================
//
// Every outbound call goes through one of these helpers so cancellation
// is observed uniformly and the retrieval/generation clocks stay honest.

/// Runs a completion at `stage`, observing cancellation first.
pub(crate) async fn complete_at(
    llm: &dyn LlmClient,
    cx: &RunContext,
    stage: &'static str,
    request: &CompletionRequest,
) -> Result<Completion, StageError> {
    cx.checkpoint(stage)?;
    llm.complete(request)
        .await
        .map_err(|e| StageError::llm(stage, &e))
}

/// Embeds a batch at `stage`; counted toward the retrieval window.
pub(crate) async fn embed_at(
    embedder: &dyn EmbeddingClient,
    cx: &RunContext,
    stage: &'static str,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, StageError> {
    cx.checkpoint(stage)?;
    let start = Instant::now();
    let vectors = embedder
        .embed(texts)
        .await
        .map_err(|e| StageError::retrieval(stage, &e))?;
    cx.mark_retrieval(start, Instant::now());
    Ok(vectors)
}

/// Embeds one text at `stage`.
pub(crate) async fn embed_one(
    embedder: &dyn EmbeddingClient,
    cx: &RunContext,
    stage: &'static str,
    text: &str,
) -> Result<Vec<f32>, StageError> {
    let texts = [text.to_string()];
    let mut vectors = embed_at(embedder, cx, stage, &texts).await?;
    vectors.pop().ok_or(StageError::Retrieval {
        stage,
        message: "embedding client returned no vector".to_string(),
    })
}

/// Runs a similarity search at `stage`; counted toward the retrieval
/// window.
pub(crate) async fn search_at(
    index: &dyn VectorIndex,
    cx: &RunContext,
    stage: &'static str,
    query_vector: &[f32],
    k: usize,
) -> Result<Vec<IndexHit>, StageError> {
    cx.checkpoint(stage)?;
    let start = Instant::now();
    let hits = index
        .similarity_search(query_vector, k, cx.filter())
        .await
        .map_err(|e| StageError::retrieval(stage, &e))?;
    cx.mark_retrieval(start, Instant::now());
    Ok(hits)
}

/// Embed-then-search convenience: the plain retrieval flow shared by the
/// baseline-shaped paths. `k = 0` yields an empty context without
/// skipping the (still measured) embedding call.
pub(crate) async fn retrieve_for(
    caps: &Capabilities,
    cx: &RunContext,
    stage: &'static str,
    text: &str,
    k: usize,
) -> Result<Vec<RetrievedChunk>, StageError> {
    let vector = embed_one(&*caps.embedder, cx, stage, text).await?;
    let hits = search_at(&*caps.index, cx, stage, &vector, k).await?;
    Ok(hits.into_iter().map(hit_to_chunk).collect())
}

/// Ungrounded-generation tail for the self-reflective no-retrieve path:
/// answers from the model alone, still recording the generation bracket.
pub(crate) async fn generate_direct(
    llm: &dyn LlmClient,
    cx: &RunContext,
    query: &str,
    temperature: f32,
) -> Result<String, StageError> {
    let mut details = serde_json::Map::new();
    details.insert("doc_count".to_string(), serde_json::json!(0));
    details.insert("total_context_length".to_string(), serde_json::json!(0));
    cx.recorder()
        .log_with("generate_prepare_context", "no retrieved context", details);

    let request = CompletionRequest::new(prompt::DIRECT_ANSWER_SYSTEM_PROMPT, query)
        .with_temperature(temperature);

    cx.recorder().log("generate_llm_call", "calling model");
    let started = Instant::now();
    let completion = complete_at(llm, cx, "generate", &request).await?;
    cx.set_generation(started.elapsed());

    let mut details = serde_json::Map::new();
    details.insert(
        "answer_length".to_string(),
        serde_json::json!(completion.text.len()),
    );
    details.insert(
        "answer_preview".to_string(),
        serde_json::json!(preview(&completion.text, 150)),
    );
    cx.recorder()
        .log_with("generate_complete", "answer generated", details);

    Ok(completion.text)
}

/// Converts an index hit into a retrieved chunk carrying the vector
/// score both as the primary score and as a sub-score.
pub(crate) fn hit_to_chunk(hit: IndexHit) -> RetrievedChunk {
    let score = hit.score;
    RetrievedChunk {
        chunk_id: hit.chunk_id,
        text: hit.text,
        metadata: hit.metadata,
        score,
        sub_scores: std::iter::once(("vector_score".to_string(), score)).collect(),
    }
}

/// Emits the `retrieve_complete` event for the final-context retrieval.
pub(crate) fn log_retrieve_complete(cx: &RunContext, chunks: &[RetrievedChunk]) {
    let top_scores: Vec<f64> = chunks.iter().take(3).map(|c| round4(c.score)).collect();
    let mut details = serde_json::Map::new();
    details.insert("result_count".to_string(), serde_json::json!(chunks.len()));
    details.insert("top_scores".to_string(), serde_json::json!(top_scores));
    cx.recorder().log_with(
        "retrieve_complete",
        format!("{} chunks in final context", chunks.len()),
        details,
    );
}

/// Grounded-generation tail shared by most techniques: prepares the
/// context block, calls the LLM once, and records the bracketing events.
pub(crate) async fn generate_answer(
    llm: &dyn LlmClient,
    cx: &RunContext,
    query: &str,
    chunks: &[RetrievedChunk],
    temperature: f32,
) -> Result<String, StageError> {
    let total_context_length: usize = chunks.iter().map(|c| c.text.len()).sum();
    let mut details = serde_json::Map::new();
    details.insert("doc_count".to_string(), serde_json::json!(chunks.len()));
    details.insert(
        "total_context_length".to_string(),
        serde_json::json!(total_context_length),
    );
    cx.recorder()
        .log_with("generate_prepare_context", "assembling context", details);

    let request = CompletionRequest::new(
        prompt::ANSWER_SYSTEM_PROMPT,
        prompt::build_answer_prompt(query, chunks),
    )
    .with_temperature(temperature);

    cx.recorder().log("generate_llm_call", "calling model");
    let started = Instant::now();
    let completion = complete_at(llm, cx, "generate", &request).await?;
    cx.set_generation(started.elapsed());

    let mut details = serde_json::Map::new();
    details.insert(
        "answer_length".to_string(),
        serde_json::json!(completion.text.len()),
    );
    details.insert(
        "answer_preview".to_string(),
        serde_json::json!(preview(&completion.text, 150)),
    );
    details.insert(
        "total_tokens".to_string(),
        serde_json::json!(completion.usage.total_tokens),
    );
    cx.recorder()
        .log_with("generate_complete", "answer generated", details);

    Ok(completion.text)
}
