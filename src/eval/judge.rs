//! LLM dimensional evaluator.
//!
//! Scores an (answer, contexts, query) tuple on the fixed dimension set
//! with one completion per dimension. Parsing is tolerant; a dimension
//! whose call or parse fails is recorded as 0 and noted, never raised.
//! When the context list is empty the faithfulness dimension is skipped
//! entirely and excluded from the mean, not silently zeroed.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::{CompletionRequest, LlmClient};
use crate::core::{EvaluationScore, ScoreType, unix_now};
use crate::technique::prompt::extract_rating;

use super::{DIMENSIONS, EvalInput};

const JUDGE_SYSTEM_PROMPT: &str = "You are a strict evaluator of question-answering quality. \
Rate the requested dimension with an integer from 0 (worst) to 10 (best), \
then give a one-sentence justification. \
Format: the number first, then the sentence.";

/// What each dimension asks the judge to measure.
fn dimension_instruction(dimension: &str) -> &'static str {
    match dimension {
        "relevance" => "how directly the answer addresses the question",
        "faithfulness" => "how well every claim in the answer is supported by the context passages",
        "coherence" => "how logically structured and internally consistent the answer is",
        "fluency" => "how natural and grammatical the answer's language is",
        _ => "how concise the answer is while remaining complete",
    }
}

/// Per-dimension LLM scorer.
pub struct DimensionalJudge {
    llm: Arc<dyn LlmClient>,
    evaluator: String,
}

impl DimensionalJudge {
    /// Creates a judge; `evaluator` names the row (usually the model id).
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, evaluator: impl Into<String>) -> Self {
        Self {
            llm,
            evaluator: evaluator.into(),
        }
    }

    /// Scores one record on every applicable dimension.
    ///
    /// Always returns a score row: per-dimension failures are folded in
    /// as 0 with a note under `metadata.failures`.
    pub async fn evaluate(&self, qa_record_id: i64, input: &EvalInput) -> EvaluationScore {
        let mut dimensions: BTreeMap<String, f64> = BTreeMap::new();
        let mut feedback: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        for dimension in DIMENSIONS {
            // A pure-LLM answer has no context to be faithful to.
            if dimension == "faithfulness" && input.contexts.is_empty() {
                tracing::debug!(qa_record_id, "skipping faithfulness: empty context");
                continue;
            }

            let request = CompletionRequest::new(
                JUDGE_SYSTEM_PROMPT,
                build_dimension_prompt(dimension, input),
            )
            .with_max_tokens(128);

            match self.llm.complete(&request).await {
                Ok(completion) => match extract_rating(&completion.text, 10.0) {
                    Some(score) => {
                        dimensions.insert(dimension.to_string(), score);
                        feedback.push(format!("{dimension}: {}", completion.text.trim()));
                    }
                    None => {
                        tracing::warn!(qa_record_id, dimension, "no score in judge output");
                        dimensions.insert(dimension.to_string(), 0.0);
                        failures.push(format!("{dimension}: unparseable judge output"));
                    }
                },
                Err(err) => {
                    tracing::warn!(qa_record_id, dimension, error = %err, "judge call failed");
                    dimensions.insert(dimension.to_string(), 0.0);
                    failures.push(format!("{dimension}: {err}"));
                }
            }
        }

        let overall = if dimensions.is_empty() {
            None
        } else {
            Some(dimensions.values().sum::<f64>() / dimensions.len() as f64)
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "feedback".to_string(),
            serde_json::json!(feedback.join("\n")),
        );
        if !failures.is_empty() {
            metadata.insert("failures".to_string(), serde_json::json!(failures));
        }

        EvaluationScore {
            id: 0,
            qa_record_id,
            score_type: ScoreType::LlmDimensional,
            evaluator: self.evaluator.clone(),
            dimensions,
            overall,
            metadata,
            created_at: unix_now(),
        }
    }
}

impl std::fmt::Debug for DimensionalJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DimensionalJudge")
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}

fn build_dimension_prompt(dimension: &str, input: &EvalInput) -> String {
    let context_section = if input.contexts.is_empty() {
        "Context: (none)\n".to_string()
    } else {
        format!("Context:\n{}", input.context_block())
    };
    format!(
        "Dimension: {dimension} - rate {}.\n\n{context_section}\nQuestion: {}\n\nAnswer:\n{}\n\nScore (0-10):",
        dimension_instruction(dimension),
        input.query,
        input.answer,
    )
}
