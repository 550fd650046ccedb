//! Query-transformation technique: rewrite, stepback, or decompose.
//!
//! All three sub-modes reshape the query before retrieval; generation
//! always runs against the original query with the assembled context.
//! Decompose retrieves each sub-query independently and unions the
//! results, deduplicated by chunk id with the max score kept.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use async_trait::async_trait;

use super::prompt::{
    DECOMPOSE_SYSTEM_PROMPT, REWRITE_SYSTEM_PROMPT, STEPBACK_SYSTEM_PROMPT,
    build_decompose_prompt, parse_subqueries,
};
use super::{
    Capabilities, Draft, RunContext, Technique, complete_at, generate_answer,
    log_retrieve_complete, retrieve_for,
};
use crate::client::CompletionRequest;
use crate::core::trace::preview;
use crate::core::{RagConfig, RetrievedChunk, TransformationType};
use crate::error::StageError;

/// Query reshaping before retrieval.
pub struct QueryTransform {
    caps: Capabilities,
    mode: TransformationType,
    num_subqueries: usize,
}

impl QueryTransform {
    /// Creates the technique; the sub-mode comes from
    /// `transformation_type` (default `rewrite`).
    #[must_use]
    pub const fn new(caps: Capabilities, config: &RagConfig) -> Self {
        Self {
            caps,
            mode: config.transformation_type,
            num_subqueries: config.num_subqueries,
        }
    }
}

#[async_trait]
impl Technique for QueryTransform {
    fn name(&self) -> &'static str {
        "query_transform"
    }

    fn config_keys(&self) -> &'static [&'static str] {
        &["top_k", "transformation_type", "num_subqueries"]
    }

    async fn run(
        &self,
        query: &str,
        top_k: usize,
        cx: &RunContext,
    ) -> Result<Draft, StageError> {
        let chunks = match self.mode {
            TransformationType::Rewrite => {
                let rewritten =
                    transform_query(&self.caps, cx, "transform_rewrite", REWRITE_SYSTEM_PROMPT, query)
                        .await?;
                cx.recorder()
                    .log("retrieve_prepare", "retrieving with rewritten query");
                let chunks = retrieve_for(&self.caps, cx, "retrieve", &rewritten, top_k).await?;
                log_retrieve_complete(cx, &chunks);
                chunks
            }
            TransformationType::Stepback => {
                let broader =
                    transform_query(&self.caps, cx, "transform_stepback", STEPBACK_SYSTEM_PROMPT, query)
                        .await?;
                cx.recorder()
                    .log("retrieve_prepare", "retrieving with stepback query");
                let chunks = retrieve_for(&self.caps, cx, "retrieve", &broader, top_k).await?;
                log_retrieve_complete(cx, &chunks);
                chunks
            }
            TransformationType::Decompose => {
                cx.recorder()
                    .log("retrieve_prepare", "retrieving per sub-query");
                let chunks =
                    decompose_union(&self.caps, cx, query, self.num_subqueries, top_k).await?;
                log_retrieve_complete(cx, &chunks);
                chunks
            }
        };

        // The user question stays the original query in every sub-mode.
        let answer = generate_answer(&*self.caps.llm, cx, query, &chunks, 0.0).await?;
        Ok(Draft {
            answer,
            retrieved_chunks: chunks,
        })
    }
}

/// One-call query reshaping shared by `rewrite`/`stepback` (and the
/// adaptive technique's factual branch). Falls back to the original
/// query when the model returns nothing.
pub(crate) async fn transform_query(
    caps: &Capabilities,
    cx: &RunContext,
    stage: &'static str,
    system: &str,
    query: &str,
) -> Result<String, StageError> {
    let request = CompletionRequest::new(system, query).with_max_tokens(128);
    let text = complete_at(&*caps.llm, cx, stage, &request).await?.text;
    let reshaped = text.trim();
    let effective = if reshaped.is_empty() { query } else { reshaped };

    let mut details = serde_json::Map::new();
    details.insert(
        "original_preview".to_string(),
        serde_json::json!(preview(query, 100)),
    );
    details.insert(
        "transformed_preview".to_string(),
        serde_json::json!(preview(effective, 100)),
    );
    cx.recorder().log_with(stage, "query transformed", details);
    Ok(effective.to_string())
}

/// Decompose-and-union retrieval shared with the adaptive technique's
/// analytical branch.
///
/// Each sub-query is retrieved independently; the union is deduplicated
/// by chunk id keeping the max score across sub-queries, ordered by that
/// score, and truncated to `top_k`.
pub(crate) async fn decompose_union(
    caps: &Capabilities,
    cx: &RunContext,
    query: &str,
    num_subqueries: usize,
    top_k: usize,
) -> Result<Vec<RetrievedChunk>, StageError> {
    let request = CompletionRequest::new(
        DECOMPOSE_SYSTEM_PROMPT,
        build_decompose_prompt(query, num_subqueries),
    )
    .with_max_tokens(256);
    let text = complete_at(&*caps.llm, cx, "transform_decompose", &request)
        .await?
        .text;

    let mut subqueries = parse_subqueries(&text, num_subqueries);
    if subqueries.is_empty() {
        subqueries.push(query.to_string());
    }

    let mut union: BTreeMap<String, RetrievedChunk> = BTreeMap::new();
    let mut total_retrieved = 0usize;
    for subquery in &subqueries {
        let chunks = retrieve_for(caps, cx, "retrieve", subquery, top_k).await?;
        total_retrieved += chunks.len();
        for chunk in chunks {
            match union.entry(chunk.chunk_id.clone()) {
                Entry::Occupied(mut slot) => {
                    if chunk.score > slot.get().score {
                        slot.insert(chunk);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(chunk);
                }
            }
        }
    }

    let mut merged: Vec<RetrievedChunk> = union.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    merged.truncate(top_k);

    let mut details = serde_json::Map::new();
    details.insert(
        "subqueries".to_string(),
        serde_json::json!(
            subqueries
                .iter()
                .map(|q| preview(q, 80))
                .collect::<Vec<_>>()
        ),
    );
    details.insert(
        "retrieved_total".to_string(),
        serde_json::json!(total_retrieved),
    );
    details.insert("after_dedup".to_string(), serde_json::json!(merged.len()));
    cx.recorder()
        .log_with("transform_decompose", "sub-query results merged", details);

    Ok(merged)
}
