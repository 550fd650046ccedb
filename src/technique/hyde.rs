//! Hypothetical-document-embedding technique.
//!
//! Asks the LLM for a plausible answer paragraph, embeds that paragraph
//! in place of the query, and retrieves against it. The final answer is
//! generated against the original query, not the hypothetical document.

use async_trait::async_trait;

use super::prompt::HYDE_SYSTEM_PROMPT;
use super::{
    Capabilities, Draft, RunContext, Technique, complete_at, generate_answer,
    log_retrieve_complete, retrieve_for,
};
use crate::client::CompletionRequest;
use crate::core::RagConfig;
use crate::core::trace::preview;
use crate::error::StageError;

/// Token budget for the hypothetical paragraph.
const HYDE_MAX_TOKENS: u32 = 256;

/// Retrieve by hypothetical answer, generate against the real query.
pub struct Hyde {
    caps: Capabilities,
    temperature: f32,
}

impl Hyde {
    /// Creates the technique; `hyde_temperature` controls the
    /// hypothetical generation (default 0.7).
    #[must_use]
    pub const fn new(caps: Capabilities, config: &RagConfig) -> Self {
        Self {
            caps,
            temperature: config.hyde_temperature,
        }
    }
}

#[async_trait]
impl Technique for Hyde {
    fn name(&self) -> &'static str {
        "hyde"
    }

    fn config_keys(&self) -> &'static [&'static str] {
        &["top_k", "hyde_temperature"]
    }

    async fn run(
        &self,
        query: &str,
        top_k: usize,
        cx: &RunContext,
    ) -> Result<Draft, StageError> {
        let request = CompletionRequest::new(HYDE_SYSTEM_PROMPT, query)
            .with_temperature(self.temperature)
            .with_max_tokens(HYDE_MAX_TOKENS);
        let hypothetical = complete_at(&*self.caps.llm, cx, "hyde_generate", &request)
            .await?
            .text;

        // An empty paragraph would embed to nothing useful; retrieve by
        // the original query instead.
        let anchor = if hypothetical.trim().is_empty() {
            query
        } else {
            hypothetical.as_str()
        };

        let mut details = serde_json::Map::new();
        details.insert(
            "hypothetical_preview".to_string(),
            serde_json::json!(preview(anchor, 150)),
        );
        cx.recorder()
            .log_with("hyde_generate", "hypothetical document produced", details);

        cx.recorder()
            .log("retrieve_prepare", "embedding hypothetical document");
        let chunks = retrieve_for(&self.caps, cx, "retrieve", anchor, top_k).await?;
        log_retrieve_complete(cx, &chunks);

        let answer = generate_answer(&*self.caps.llm, cx, query, &chunks, 0.0).await?;
        Ok(Draft {
            answer,
            retrieved_chunks: chunks,
        })
    }
}
