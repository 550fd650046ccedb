//! Self-reflective technique (Self-RAG style).
//!
//! Decides whether retrieval is needed at all, filters retrieved
//! passages by relevance, generates multiple candidate answers, and
//! keeps the one with the best support+utility composite. Losing
//! candidates are recorded in the trace.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::prompt::{
    ANSWER_SYSTEM_PROMPT, RELEVANCE_LABEL_SYSTEM_PROMPT, RETRIEVAL_DECISION_SYSTEM_PROMPT,
    SUPPORT_SYSTEM_PROMPT, UTILITY_SYSTEM_PROMPT, build_answer_prompt, build_relevance_prompt,
    build_support_prompt, build_utility_prompt, extract_rating, parse_yes_no,
};
use super::{
    Capabilities, Draft, RunContext, Technique, complete_at, generate_direct,
    log_retrieve_complete, retrieve_for,
};
use crate::client::CompletionRequest;
use crate::core::trace::preview;
use crate::core::{RagConfig, RetrievedChunk};
use crate::error::StageError;

/// Number of candidate answers generated.
const NUM_CANDIDATES: usize = 2;
/// Sampling temperature for candidate generation.
const CANDIDATE_TEMPERATURE: f32 = 0.7;
/// Composite weight of the support grade.
const SUPPORT_WEIGHT: f64 = 5.0;
/// Utility assumed when the grader output cannot be parsed.
const DEFAULT_UTILITY: f64 = 3.0;

/// One generated answer candidate with its grades.
struct Candidate {
    answer: String,
    support: f64,
    utility: f64,
    elapsed: Duration,
}

impl Candidate {
    fn composite(&self) -> f64 {
        SUPPORT_WEIGHT.mul_add(self.support, self.utility)
    }
}

/// Retrieval-on-demand with reflective answer selection.
pub struct SelfReflective {
    caps: Capabilities,
    min_support_score: Option<f64>,
}

impl SelfReflective {
    /// Creates the technique; `min_support_score` optionally gates
    /// candidate eligibility by composite score.
    #[must_use]
    pub const fn new(caps: Capabilities, config: &RagConfig) -> Self {
        Self {
            caps,
            min_support_score: config.min_support_score,
        }
    }

    /// Labels each retrieved passage, dropping the not-relevant ones.
    async fn filter_relevant(
        &self,
        query: &str,
        chunks: Vec<RetrievedChunk>,
        cx: &RunContext,
    ) -> Result<Vec<RetrievedChunk>, StageError> {
        let total = chunks.len();
        let mut kept = Vec::with_capacity(total);
        for chunk in chunks {
            let request = CompletionRequest::new(
                RELEVANCE_LABEL_SYSTEM_PROMPT,
                build_relevance_prompt(query, &chunk.text),
            )
            .with_max_tokens(8);
            let label = complete_at(&*self.caps.llm, cx, "self_rag_relevance", &request)
                .await?
                .text
                .to_lowercase();
            // Unparseable labels keep the passage; dropping evidence on a
            // grader glitch is the worse failure mode.
            if !label.contains("not_relevant") && !label.contains("not relevant") {
                kept.push(chunk);
            }
        }

        let mut details = serde_json::Map::new();
        details.insert("retrieved".to_string(), serde_json::json!(total));
        details.insert("kept".to_string(), serde_json::json!(kept.len()));
        details.insert(
            "dropped".to_string(),
            serde_json::json!(total - kept.len()),
        );
        cx.recorder().log_with(
            "self_rag_relevance_filter",
            "passages labeled for relevance",
            details,
        );
        Ok(kept)
    }

    /// Generates and grades one candidate answer.
    async fn generate_candidate(
        &self,
        query: &str,
        chunks: &[RetrievedChunk],
        cx: &RunContext,
    ) -> Result<Candidate, StageError> {
        let request = CompletionRequest::new(
            ANSWER_SYSTEM_PROMPT,
            build_answer_prompt(query, chunks),
        )
        .with_temperature(CANDIDATE_TEMPERATURE);

        cx.recorder().log("generate_llm_call", "calling model");
        let started = Instant::now();
        let answer = complete_at(&*self.caps.llm, cx, "generate", &request)
            .await?
            .text;
        let elapsed = started.elapsed();

        let support_request = CompletionRequest::new(
            SUPPORT_SYSTEM_PROMPT,
            build_support_prompt(&answer, chunks),
        )
        .with_max_tokens(8);
        let support_label = complete_at(&*self.caps.llm, cx, "self_rag_support", &support_request)
            .await?
            .text;
        let support = parse_support(&support_label);

        let utility_request = CompletionRequest::new(
            UTILITY_SYSTEM_PROMPT,
            build_utility_prompt(query, &answer),
        )
        .with_max_tokens(8);
        let utility_label = complete_at(&*self.caps.llm, cx, "self_rag_utility", &utility_request)
            .await?
            .text;
        let utility = extract_rating(&utility_label, 5.0)
            .filter(|&u| u >= 1.0)
            .unwrap_or(DEFAULT_UTILITY);

        Ok(Candidate {
            answer,
            support,
            utility,
            elapsed,
        })
    }
}

#[async_trait]
impl Technique for SelfReflective {
    fn name(&self) -> &'static str {
        "self_reflective"
    }

    fn config_keys(&self) -> &'static [&'static str] {
        &["top_k", "min_support_score"]
    }

    async fn run(
        &self,
        query: &str,
        top_k: usize,
        cx: &RunContext,
    ) -> Result<Draft, StageError> {
        // Stage (a): does this query need retrieval at all?
        let request =
            CompletionRequest::new(RETRIEVAL_DECISION_SYSTEM_PROMPT, query).with_max_tokens(4);
        let decision_text = complete_at(&*self.caps.llm, cx, "retrieval_decision", &request)
            .await?
            .text;
        let retrieve = parse_yes_no(&decision_text);

        let mut details = serde_json::Map::new();
        details.insert(
            "decision".to_string(),
            serde_json::json!(if retrieve { "yes" } else { "no" }),
        );
        cx.recorder().log_with(
            "retrieval_decision",
            if retrieve { "yes" } else { "no" },
            details,
        );

        if !retrieve {
            let answer = generate_direct(&*self.caps.llm, cx, query, 0.0).await?;
            return Ok(Draft {
                answer,
                retrieved_chunks: Vec::new(),
            });
        }

        // Stage (b): retrieve and filter by relevance.
        cx.recorder()
            .log("retrieve_prepare", "embedding query for similarity search");
        let candidates = retrieve_for(&self.caps, cx, "retrieve", query, top_k).await?;
        let chunks = self.filter_relevant(query, candidates, cx).await?;
        log_retrieve_complete(cx, &chunks);

        // Stage (c): generate candidates and keep the best composite.
        let total_context_length: usize = chunks.iter().map(|c| c.text.len()).sum();
        let mut details = serde_json::Map::new();
        details.insert("doc_count".to_string(), serde_json::json!(chunks.len()));
        details.insert(
            "total_context_length".to_string(),
            serde_json::json!(total_context_length),
        );
        cx.recorder()
            .log_with("generate_prepare_context", "assembling context", details);

        let mut generated: Vec<Candidate> = Vec::with_capacity(NUM_CANDIDATES);
        for _ in 0..NUM_CANDIDATES {
            generated.push(self.generate_candidate(query, &chunks, cx).await?);
        }

        let eligible: Vec<usize> = match self.min_support_score {
            Some(min) => (0..generated.len())
                .filter(|&i| generated[i].composite() >= min)
                .collect(),
            None => (0..generated.len()).collect(),
        };
        // When nothing clears the bar, judge the full field anyway.
        let field: Vec<usize> = if eligible.is_empty() {
            (0..generated.len()).collect()
        } else {
            eligible
        };

        // Max composite; ties go to the shorter answer.
        let winner = field
            .into_iter()
            .max_by(|&a, &b| {
                generated[a]
                    .composite()
                    .partial_cmp(&generated[b].composite())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        generated[b]
                            .answer
                            .len()
                            .cmp(&generated[a].answer.len())
                    })
            })
            .unwrap_or(0);

        let mut details = serde_json::Map::new();
        details.insert(
            "composites".to_string(),
            serde_json::json!(
                generated
                    .iter()
                    .map(Candidate::composite)
                    .collect::<Vec<_>>()
            ),
        );
        details.insert("chosen".to_string(), serde_json::json!(winner));
        details.insert(
            "losing_previews".to_string(),
            serde_json::json!(
                generated
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| i != winner)
                    .map(|(_, c)| preview(&c.answer, 100))
                    .collect::<Vec<_>>()
            ),
        );
        cx.recorder()
            .log_with("self_rag_answer_eval", "candidates graded", details);

        let chosen = generated.swap_remove(winner);
        cx.set_generation(chosen.elapsed);

        let mut details = serde_json::Map::new();
        details.insert(
            "answer_length".to_string(),
            serde_json::json!(chosen.answer.len()),
        );
        details.insert(
            "answer_preview".to_string(),
            serde_json::json!(preview(&chosen.answer, 150)),
        );
        cx.recorder()
            .log_with("generate_complete", "answer selected", details);

        Ok(Draft {
            answer: chosen.answer,
            retrieved_chunks: chunks,
        })
    }
}

/// Maps the support grade onto its numeric value: fully 3, partially 1,
/// none 0. Unparseable output grades partial.
fn parse_support(text: &str) -> f64 {
    let lower = text.to_lowercase();
    if lower.contains("fully") {
        3.0
    } else if lower.contains("none") || lower.contains("no support") {
        0.0
    } else {
        1.0
    }
}
