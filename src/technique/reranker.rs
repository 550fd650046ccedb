//! Reranker technique: wide retrieval, point-wise LLM scoring.
//!
//! Retrieves a candidate pool wider than the final context, scores each
//! candidate against the query on a 0-10 scale with the LLM, and keeps
//! the best `top_k`. A candidate whose scoring call fails keeps its
//! vector score normalized onto the same 0-10 scale, so one bad call
//! never sinks the run.

use async_trait::async_trait;

use super::prompt::{RERANK_SYSTEM_PROMPT, build_rerank_prompt, extract_rating};
use super::{
    Capabilities, Draft, RunContext, Technique, complete_at, generate_answer,
    log_retrieve_complete, retrieve_for,
};
use crate::client::CompletionRequest;
use crate::core::trace::round4;
use crate::core::{RagConfig, RetrievedChunk};
use crate::error::StageError;
use crate::search::min_max_normalize;

/// Two-pass retrieval with an LLM scorer.
pub struct Reranker {
    caps: Capabilities,
    pool: usize,
}

impl Reranker {
    /// Creates the technique; the candidate pool size comes from config
    /// (`rerank_candidates`, default `4 * top_k`, floor 20).
    #[must_use]
    pub fn new(caps: Capabilities, config: &RagConfig) -> Self {
        Self {
            caps,
            pool: config.rerank_pool(),
        }
    }

    /// Scores one candidate, falling back to its normalized vector score
    /// when the call or the parse fails. Cancellation still propagates.
    async fn score_candidate(
        &self,
        query: &str,
        candidate: &RetrievedChunk,
        fallback: f64,
        cx: &RunContext,
    ) -> Result<(f64, bool), StageError> {
        let request = CompletionRequest::new(
            RERANK_SYSTEM_PROMPT,
            build_rerank_prompt(query, &candidate.text),
        )
        .with_max_tokens(16);

        match complete_at(&*self.caps.llm, cx, "rerank", &request).await {
            Ok(completion) => Ok(extract_rating(&completion.text, 10.0)
                .map_or((fallback, true), |score| (score, false))),
            Err(err @ StageError::Canceled { .. }) => Err(err),
            Err(err) => {
                cx.recorder().log(
                    "rerank_candidate_error",
                    format!("{}: {err}", candidate.chunk_id),
                );
                Ok((fallback, true))
            }
        }
    }
}

#[async_trait]
impl Technique for Reranker {
    fn name(&self) -> &'static str {
        "reranker"
    }

    fn config_keys(&self) -> &'static [&'static str] {
        &["top_k", "rerank_candidates"]
    }

    async fn run(
        &self,
        query: &str,
        top_k: usize,
        cx: &RunContext,
    ) -> Result<Draft, StageError> {
        cx.recorder().log(
            "retrieve_prepare",
            format!("retrieving {} candidates for reranking", self.pool),
        );
        let candidates = retrieve_for(&self.caps, cx, "retrieve", query, self.pool).await?;

        // Vector scores mapped onto 0-10 as the per-candidate fallback.
        let vector_scores: Vec<f64> = candidates.iter().map(|c| c.score).collect();
        let fallbacks: Vec<f64> = min_max_normalize(&vector_scores)
            .into_iter()
            .map(|v| v * 10.0)
            .collect();

        let mut scored: Vec<(RetrievedChunk, f64)> = Vec::with_capacity(candidates.len());
        let mut fallback_count = 0usize;
        for (candidate, fallback) in candidates.into_iter().zip(fallbacks) {
            let (score, fell_back) = self
                .score_candidate(query, &candidate, fallback, cx)
                .await?;
            if fell_back {
                fallback_count += 1;
            }
            scored.push((candidate, score));
        }

        // Rerank score descending, ties by original vector score descending.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.0.score
                        .partial_cmp(&a.0.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        let chunks: Vec<RetrievedChunk> = scored
            .into_iter()
            .take(top_k)
            .map(|(chunk, rerank_score)| {
                let mut chunk = chunk.with_sub_score("rerank_score", rerank_score);
                chunk.score = rerank_score;
                chunk
            })
            .collect();

        let mut details = serde_json::Map::new();
        details.insert("pool".to_string(), serde_json::json!(self.pool));
        details.insert(
            "fallback_count".to_string(),
            serde_json::json!(fallback_count),
        );
        details.insert(
            "top_scores".to_string(),
            serde_json::json!(
                chunks
                    .iter()
                    .take(3)
                    .map(|c| round4(c.score))
                    .collect::<Vec<_>>()
            ),
        );
        cx.recorder()
            .log_with("rerank_after", "candidates rescored", details);
        log_retrieve_complete(cx, &chunks);

        let answer = generate_answer(&*self.caps.llm, cx, query, &chunks, 0.0).await?;
        Ok(Draft {
            answer,
            retrieved_chunks: chunks,
        })
    }
}
