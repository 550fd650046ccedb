//! Adaptive technique: classify the query, dispatch a strategy.
//!
//! One LLM call labels the query as factual, analytical, opinion, or
//! contextual. Factual queries get a rewrite step before the baseline
//! flow; analytical queries decompose into sub-queries; opinion queries
//! retrieve with a diversity bias; contextual queries run the plain
//! baseline.

use async_trait::async_trait;

use super::prompt::{CLASSIFY_SYSTEM_PROMPT, REWRITE_SYSTEM_PROMPT};
use super::transform::{decompose_union, transform_query};
use super::{
    Capabilities, Draft, RunContext, Technique, complete_at, embed_at, generate_answer,
    log_retrieve_complete, retrieve_for,
};
use crate::client::CompletionRequest;
use crate::core::{RagConfig, RetrievedChunk};
use crate::error::StageError;
use crate::search::cosine_similarity;

/// Candidate multiplier for the diversity-biased branch.
const DIVERSITY_POOL_FACTOR: usize = 3;

/// Query class produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryClass {
    Factual,
    Analytical,
    Opinion,
    Contextual,
}

impl QueryClass {
    /// Tolerant parse of the classifier output; unclear output falls
    /// back to the plain baseline flow.
    fn parse(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("factual") {
            Self::Factual
        } else if lower.contains("analytical") {
            Self::Analytical
        } else if lower.contains("opinion") {
            Self::Opinion
        } else {
            Self::Contextual
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Factual => "factual",
            Self::Analytical => "analytical",
            Self::Opinion => "opinion",
            Self::Contextual => "contextual",
        }
    }

    const fn strategy(self) -> &'static str {
        match self {
            Self::Factual => "rewrite_baseline",
            Self::Analytical => "decompose",
            Self::Opinion => "diversity",
            Self::Contextual => "baseline",
        }
    }
}

/// Route-by-query-class retrieval.
pub struct Adaptive {
    caps: Capabilities,
    num_subqueries: usize,
    diversity_theta: f64,
}

impl Adaptive {
    /// Creates the technique; `diversity_theta` bounds the cosine
    /// distance for the opinion branch (default 0.15).
    #[must_use]
    pub const fn new(caps: Capabilities, config: &RagConfig) -> Self {
        Self {
            caps,
            num_subqueries: config.num_subqueries,
            diversity_theta: config.diversity_theta,
        }
    }

    /// Diversity-biased retrieval: over-fetch, then greedily keep chunks
    /// whose cosine distance to every already-kept chunk exceeds theta.
    async fn retrieve_diverse(
        &self,
        query: &str,
        top_k: usize,
        cx: &RunContext,
    ) -> Result<Vec<RetrievedChunk>, StageError> {
        let pool = top_k.saturating_mul(DIVERSITY_POOL_FACTOR).max(top_k);
        let candidates = retrieve_for(&self.caps, cx, "retrieve", query, pool).await?;
        if candidates.len() <= 1 || top_k == 0 {
            let mut out = candidates;
            out.truncate(top_k);
            return Ok(out);
        }

        // The index hands back text only, so re-embed the candidates to
        // measure pairwise distance.
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_at(&*self.caps.embedder, cx, "diversity_embed", &texts).await?;

        let mut selected: Vec<usize> = Vec::with_capacity(top_k);
        for i in 0..candidates.len() {
            if selected.len() >= top_k {
                break;
            }
            let diverse = selected.iter().all(|&j| {
                1.0 - cosine_similarity(&vectors[i], &vectors[j]) > self.diversity_theta
            });
            if selected.is_empty() || diverse {
                selected.push(i);
            }
        }

        let mut details = serde_json::Map::new();
        details.insert("pool".to_string(), serde_json::json!(candidates.len()));
        details.insert("selected".to_string(), serde_json::json!(selected.len()));
        details.insert("theta".to_string(), serde_json::json!(self.diversity_theta));
        cx.recorder()
            .log_with("adaptive_diversity", "diversity selection applied", details);

        let mut keep: Vec<RetrievedChunk> = Vec::with_capacity(selected.len());
        let mut candidates = candidates;
        // Drain in reverse so earlier indices stay valid.
        for &i in selected.iter().rev() {
            keep.push(candidates.swap_remove(i));
        }
        keep.reverse();
        Ok(keep)
    }
}

#[async_trait]
impl Technique for Adaptive {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn config_keys(&self) -> &'static [&'static str] {
        &["top_k", "num_subqueries", "diversity_theta"]
    }

    async fn run(
        &self,
        query: &str,
        top_k: usize,
        cx: &RunContext,
    ) -> Result<Draft, StageError> {
        let request = CompletionRequest::new(CLASSIFY_SYSTEM_PROMPT, query).with_max_tokens(8);
        let label = complete_at(&*self.caps.llm, cx, "adaptive_classify", &request)
            .await?
            .text;
        let class = QueryClass::parse(&label);

        let mut details = serde_json::Map::new();
        details.insert("class".to_string(), serde_json::json!(class.as_str()));
        details.insert("strategy".to_string(), serde_json::json!(class.strategy()));
        cx.recorder().log_with(
            "adaptive_strategy_select",
            format!("classified as {}", class.as_str()),
            details,
        );

        let chunks = match class {
            QueryClass::Factual => {
                let rewritten = transform_query(
                    &self.caps,
                    cx,
                    "adaptive_rewrite",
                    REWRITE_SYSTEM_PROMPT,
                    query,
                )
                .await?;
                cx.recorder()
                    .log("retrieve_prepare", "retrieving with rewritten query");
                let chunks = retrieve_for(&self.caps, cx, "retrieve", &rewritten, top_k).await?;
                log_retrieve_complete(cx, &chunks);
                chunks
            }
            QueryClass::Analytical => {
                cx.recorder()
                    .log("retrieve_prepare", "retrieving per sub-query");
                let chunks =
                    decompose_union(&self.caps, cx, query, self.num_subqueries, top_k).await?;
                log_retrieve_complete(cx, &chunks);
                chunks
            }
            QueryClass::Opinion => {
                cx.recorder()
                    .log("retrieve_prepare", "retrieving with diversity bias");
                let chunks = self.retrieve_diverse(query, top_k, cx).await?;
                log_retrieve_complete(cx, &chunks);
                chunks
            }
            QueryClass::Contextual => {
                cx.recorder()
                    .log("retrieve_prepare", "embedding query for similarity search");
                let chunks = retrieve_for(&self.caps, cx, "retrieve", query, top_k).await?;
                log_retrieve_complete(cx, &chunks);
                chunks
            }
        };

        let answer = generate_answer(&*self.caps.llm, cx, query, &chunks, 0.0).await?;
        Ok(Draft {
            answer,
            retrieved_chunks: chunks,
        })
    }
}
