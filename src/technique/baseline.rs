//! Baseline technique: embed, search, generate.
//!
//! The reference point every other technique is compared against. One
//! embedding call, one similarity search filtered by the request's
//! document set, one grounded completion.

use async_trait::async_trait;

use super::{
    Capabilities, Draft, RunContext, Technique, generate_answer, log_retrieve_complete,
    retrieve_for,
};
use crate::error::StageError;

/// Single-pass retrieve-then-generate.
pub struct Baseline {
    caps: Capabilities,
}

impl Baseline {
    /// Creates the technique over the shared capability set.
    #[must_use]
    pub const fn new(caps: Capabilities) -> Self {
        Self { caps }
    }
}

#[async_trait]
impl Technique for Baseline {
    fn name(&self) -> &'static str {
        "baseline"
    }

    async fn run(
        &self,
        query: &str,
        top_k: usize,
        cx: &RunContext,
    ) -> Result<Draft, StageError> {
        cx.recorder()
            .log("retrieve_prepare", "embedding query for similarity search");
        let chunks = retrieve_for(&self.caps, cx, "retrieve", query, top_k).await?;
        log_retrieve_complete(cx, &chunks);

        let answer = generate_answer(&*self.caps.llm, cx, query, &chunks, 0.0).await?;
        Ok(Draft {
            answer,
            retrieved_chunks: chunks,
        })
    }
}
