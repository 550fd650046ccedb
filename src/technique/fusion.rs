//! Fusion technique: vector search blended with BM25.
//!
//! One vector search produces the candidate set; a request-scoped BM25
//! index built from those same candidates produces the lexical signal.
//! Both distributions are min-max normalized and combined as
//! `w_vec * norm_vec + w_lex * norm_lex`.

use async_trait::async_trait;

use super::{
    Capabilities, Draft, RunContext, Technique, generate_answer, log_retrieve_complete,
    retrieve_for,
};
use crate::core::{RagConfig, RetrievedChunk};
use crate::error::StageError;
use crate::search::{Bm25Index, min_max_normalize};

/// Hybrid vector + lexical retrieval.
pub struct Fusion {
    caps: Capabilities,
    width: usize,
    vector_weight: f64,
    lexical_weight: f64,
}

impl Fusion {
    /// Creates the technique; weights default to 0.5 / 0.5 and the
    /// candidate width to `max(top_k, 10)`.
    #[must_use]
    pub fn new(caps: Capabilities, config: &RagConfig) -> Self {
        Self {
            caps,
            width: config.fusion_width(),
            vector_weight: config.vector_weight,
            lexical_weight: config.lexical_weight,
        }
    }
}

#[async_trait]
impl Technique for Fusion {
    fn name(&self) -> &'static str {
        "fusion"
    }

    fn config_keys(&self) -> &'static [&'static str] {
        &["top_k", "vector_weight", "lexical_weight"]
    }

    async fn run(
        &self,
        query: &str,
        top_k: usize,
        cx: &RunContext,
    ) -> Result<Draft, StageError> {
        cx.recorder().log(
            "retrieve_prepare",
            format!("retrieving {} candidates for fusion", self.width),
        );
        let candidates = retrieve_for(&self.caps, cx, "retrieve", query, self.width).await?;

        // Lexical index over the candidate set only; request-scoped,
        // never shared.
        let texts: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();
        let lexical_raw = Bm25Index::build(&texts).scores(query);

        let vector_raw: Vec<f64> = candidates.iter().map(|c| c.score).collect();
        let norm_vec = min_max_normalize(&vector_raw);
        let norm_lex = min_max_normalize(&lexical_raw);

        let lexical_hits = lexical_raw.iter().filter(|&&s| s > 0.0).count();

        let mut fused: Vec<RetrievedChunk> = candidates
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let score = self
                    .vector_weight
                    .mul_add(norm_vec[i], self.lexical_weight * norm_lex[i]);
                let mut chunk = chunk.with_sub_score("lexical_score", lexical_raw[i]);
                chunk.score = score;
                chunk
            })
            .collect();

        fused.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        fused.truncate(top_k);

        let mut details = serde_json::Map::new();
        details.insert("candidates".to_string(), serde_json::json!(norm_vec.len()));
        details.insert("lexical_hits".to_string(), serde_json::json!(lexical_hits));
        details.insert(
            "vector_weight".to_string(),
            serde_json::json!(self.vector_weight),
        );
        details.insert(
            "lexical_weight".to_string(),
            serde_json::json!(self.lexical_weight),
        );
        cx.recorder()
            .log_with("fusion_merge", "vector and lexical rankings fused", details);
        log_retrieve_complete(cx, &fused);

        let answer = generate_answer(&*self.caps.llm, cx, query, &fused, 0.0).await?;
        Ok(Draft {
            answer,
            retrieved_chunks: fused,
        })
    }
}
