//! Automatic scoring of persisted QA records.
//!
//! Two independent tracks: the LLM dimensional judge scores answers on
//! a fixed 0-10 dimension set, and the reference-metric evaluator
//! computes Ragas-style metrics on [0, 1] inside an isolated worker.
//! The evaluation dispatcher runs both across a batch of records under
//! its own concurrency bound.

pub mod dispatch;
pub mod judge;
pub mod reference;

use crate::core::QaRecord;

pub use dispatch::{EvalDispatcher, EvalOutcome};
pub use judge::DimensionalJudge;
pub use reference::ReferenceEvaluator;

/// The fixed quality dimensions scored by the LLM judge.
pub const DIMENSIONS: [&str; 5] = [
    "relevance",
    "faithfulness",
    "coherence",
    "fluency",
    "conciseness",
];

/// The (query, answer, contexts) tuple both evaluators consume.
#[derive(Debug, Clone)]
pub struct EvalInput {
    /// The original user query.
    pub query: String,
    /// The generated answer under evaluation.
    pub answer: String,
    /// Ordered retrieved chunk texts; may be empty for pure-LLM answers.
    pub contexts: Vec<String>,
    /// Ground-truth answer, when the caller has one.
    pub reference_answer: Option<String>,
}

impl EvalInput {
    /// Builds the tuple from a persisted QA record.
    #[must_use]
    pub fn from_record(record: &QaRecord, reference_answer: Option<String>) -> Self {
        Self {
            query: record.query.clone(),
            answer: record.result.answer.clone(),
            contexts: record
                .result
                .retrieved_chunks
                .iter()
                .map(|c| c.text.clone())
                .collect(),
            reference_answer,
        }
    }

    /// Formats the contexts as a numbered block for evaluator prompts.
    #[must_use]
    pub fn context_block(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (i, context) in self.contexts.iter().enumerate() {
            let _ = writeln!(out, "[{}] {}", i + 1, context);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_set() {
        assert_eq!(DIMENSIONS.len(), 5);
        assert!(DIMENSIONS.contains(&"faithfulness"));
    }

    #[test]
    fn test_context_block_numbering() {
        let input = EvalInput {
            query: "q".to_string(),
            answer: "a".to_string(),
            contexts: vec!["first".to_string(), "second".to_string()],
            reference_answer: None,
        };
        let block = input.context_block();
        assert!(block.contains("[1] first"));
        assert!(block.contains("[2] second"));
    }
}
