//! System prompts and template builders for the technique pipeline.
//!
//! Prompts are the fixed instructions behind each LLM decision point;
//! template builders format user messages with query and chunk data.
//! The tolerant output parsers live here too, next to the formats they
//! parse.

use std::fmt::Write;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::RetrievedChunk;

/// System prompt for grounded answer generation.
pub const ANSWER_SYSTEM_PROMPT: &str = "You are a precise assistant that answers strictly from the provided context. \
Use only the numbered context passages to answer the question. \
If the context does not contain the answer, say so plainly. \
Do not invent facts, citations, or sources. Answer concisely.";

/// System prompt for answering without retrieval (chit-chat and
/// self-contained questions).
pub const DIRECT_ANSWER_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer the user's question directly and concisely \
from general knowledge. Do not fabricate citations.";

/// System prompt for the point-wise reranker scorer.
pub const RERANK_SYSTEM_PROMPT: &str = "You rate how relevant a passage is to a question. \
Respond with a single integer from 0 (irrelevant) to 10 (directly answers the question). \
Output only the number.";

/// System prompt for hypothetical-document generation.
pub const HYDE_SYSTEM_PROMPT: &str = "Write a short, plausible encyclopedia-style paragraph that would answer the \
user's question. Invent nothing beyond what a typical reference text would \
state. One paragraph, at most 120 words. Output only the paragraph.";

/// System prompt for the `rewrite` transformation.
pub const REWRITE_SYSTEM_PROMPT: &str = "Rewrite the user's search query to be more specific and self-contained, \
preserving its intent. Output only the rewritten query.";

/// System prompt for the `stepback` transformation.
pub const STEPBACK_SYSTEM_PROMPT: &str = "Produce one broader, more general question whose answer would help answer \
the user's question. Output only the broader question.";

/// System prompt for the `decompose` transformation.
pub const DECOMPOSE_SYSTEM_PROMPT: &str = "Decompose the user's question into simpler sub-questions that can be \
researched independently. Output one sub-question per line, nothing else.";

/// System prompt for adaptive query classification.
pub const CLASSIFY_SYSTEM_PROMPT: &str = "Classify the user's question into exactly one category:\n\
factual - asks for a specific fact or definition\n\
analytical - requires reasoning over multiple pieces of information\n\
opinion - asks for viewpoints, arguments, or subjective judgment\n\
contextual - refers to prior conversation or ambient context\n\
Output only the category word.";

/// System prompt for the self-reflective retrieval decision.
pub const RETRIEVAL_DECISION_SYSTEM_PROMPT: &str = "Decide whether answering the user's question requires looking up documents. \
Greetings, small talk, and questions about yourself need no retrieval. \
Output only 'yes' or 'no'.";

/// System prompt for self-reflective passage relevance labeling.
pub const RELEVANCE_LABEL_SYSTEM_PROMPT: &str = "Label how relevant the passage is to the question. \
Output exactly one of: fully_relevant, partially_relevant, not_relevant.";

/// System prompt for self-reflective answer support scoring.
pub const SUPPORT_SYSTEM_PROMPT: &str = "Judge how well the answer is supported by the provided passages. \
Output exactly one of: fully, partially, none.";

/// System prompt for self-reflective answer utility scoring.
pub const UTILITY_SYSTEM_PROMPT: &str = "Rate how useful the answer is to the question on a scale of 1 to 5. \
Output only the number.";

/// Formats the grounded-generation user message: numbered context
/// passages followed by the original question.
#[must_use]
pub fn build_answer_prompt(query: &str, chunks: &[RetrievedChunk]) -> String {
    let mut out = String::new();
    if chunks.is_empty() {
        let _ = writeln!(out, "Context: (no passages retrieved)");
    } else {
        let _ = writeln!(out, "Context:");
        for (i, chunk) in chunks.iter().enumerate() {
            let _ = writeln!(out, "[{}] {}", i + 1, chunk.text);
        }
    }
    let _ = write!(out, "\nQuestion: {query}\n\nAnswer:");
    out
}

/// Formats the point-wise rerank scoring message.
#[must_use]
pub fn build_rerank_prompt(query: &str, passage: &str) -> String {
    format!("Question: {query}\n\nPassage:\n{passage}\n\nRelevance (0-10):")
}

/// Formats the decompose message, bounding the number of sub-questions.
#[must_use]
pub fn build_decompose_prompt(query: &str, n: usize) -> String {
    format!("Produce at most {n} sub-questions.\n\nQuestion: {query}")
}

/// Formats the relevance-labeling message for one passage.
#[must_use]
pub fn build_relevance_prompt(query: &str, passage: &str) -> String {
    format!("Question: {query}\n\nPassage:\n{passage}\n\nLabel:")
}

/// Formats the support-scoring message for one candidate answer.
#[must_use]
pub fn build_support_prompt(answer: &str, chunks: &[RetrievedChunk]) -> String {
    let mut out = String::from("Passages:\n");
    for (i, chunk) in chunks.iter().enumerate() {
        let _ = writeln!(out, "[{}] {}", i + 1, chunk.text);
    }
    let _ = write!(out, "\nAnswer:\n{answer}\n\nSupport:");
    out
}

/// Formats the utility-scoring message for one candidate answer.
#[must_use]
pub fn build_utility_prompt(query: &str, answer: &str) -> String {
    format!("Question: {query}\n\nAnswer:\n{answer}\n\nUtility (1-5):")
}

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    // The pattern is a literal and always compiles.
    Regex::new(r"-?\d+(?:\.\d+)?").unwrap_or_else(|_| unreachable!())
});

/// Extracts the first number in `[0, max]` from model output.
///
/// Tolerates prose around the number ("I'd rate this 7/10"). Returns
/// `None` when no in-range number appears.
#[must_use]
pub fn extract_rating(text: &str, max: f64) -> Option<f64> {
    NUMBER_RE
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .find(|&v| (0.0..=max).contains(&v))
}

/// Parses a yes/no answer, defaulting to `yes` (retrieve) when unclear.
#[must_use]
pub fn parse_yes_no(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    !(lower.starts_with("no") || lower.contains("\nno") || lower == "n")
}

/// Splits decompose output into at most `n` non-empty sub-queries.
#[must_use]
pub fn parse_subqueries(text: &str, n: usize) -> Vec<String> {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')' || c == '-')
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .take(n)
        .collect()
}
