//! Shared test doubles: scripted LLM, deterministic embedders, corpus
//! builders. No test in this suite touches the network.

// Each integration test binary compiles this module separately; not
// every binary uses every helper.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use rag_arena::client::{
    Completion, CompletionRequest, DocumentFilter, EmbeddingClient, IndexHit, LlmClient,
    MemoryVectorIndex, TokenUsage, VectorIndex,
};
use rag_arena::core::{Chunk, EmbeddedChunk};
use rag_arena::error::ClientError;
use rag_arena::technique::Capabilities;

/// What a matched rule does.
#[derive(Debug, Clone)]
enum Behavior {
    Respond(String),
    Fail,
}

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    behavior: Behavior,
    delay: Duration,
}

/// Scripted LLM: first rule whose needle appears in the system or user
/// message wins; otherwise the default response. Tracks the maximum
/// number of concurrent in-flight calls for concurrency assertions.
#[derive(Debug, Default)]
pub struct FakeLlm {
    rules: Mutex<Vec<Rule>>,
    default_response: Mutex<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeLlm {
    pub fn new() -> Self {
        let llm = Self::default();
        if let Ok(mut default_response) = llm.default_response.lock() {
            *default_response = "OK.".to_string();
        }
        llm
    }

    #[must_use]
    pub fn with_default(self, response: &str) -> Self {
        if let Ok(mut default_response) = self.default_response.lock() {
            *default_response = response.to_string();
        }
        self
    }

    #[must_use]
    pub fn rule(self, needle: &str, response: &str) -> Self {
        self.push_rule(needle, Behavior::Respond(response.to_string()), Duration::ZERO);
        self
    }

    #[must_use]
    pub fn rule_delayed(self, needle: &str, response: &str, delay: Duration) -> Self {
        self.push_rule(needle, Behavior::Respond(response.to_string()), delay);
        self
    }

    #[must_use]
    pub fn rule_fails(self, needle: &str) -> Self {
        self.push_rule(needle, Behavior::Fail, Duration::ZERO);
        self
    }

    fn push_rule(&self, needle: &str, behavior: Behavior, delay: Duration) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                needle: needle.to_string(),
                behavior,
                delay,
            });
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn matched(&self, request: &CompletionRequest) -> (Behavior, Duration) {
        let rules = self.rules.lock().map_or_else(|_| Vec::new(), |r| r.clone());
        for rule in rules {
            if request.system.contains(&rule.needle) || request.user.contains(&rule.needle) {
                return (rule.behavior, rule.delay);
            }
        }
        let default_response = self
            .default_response
            .lock()
            .map_or_else(|_| "OK.".to_string(), |s| s.clone());
        (Behavior::Respond(default_response), Duration::ZERO)
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (behavior, delay) = self.matched(request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match behavior {
            Behavior::Respond(text) => Ok(Completion {
                text,
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            }),
            Behavior::Fail => Err(ClientError::Permanent {
                message: "scripted failure".to_string(),
            }),
        }
    }
}

/// Deterministic embedder: component `i` counts occurrences of any word
/// in group `i` (case-insensitive). Texts sharing a group cluster
/// together under cosine similarity.
#[derive(Debug)]
pub struct KeywordEmbedder {
    groups: Vec<Vec<String>>,
}

impl KeywordEmbedder {
    pub fn new(groups: &[&[&str]]) -> Self {
        Self {
            groups: groups
                .iter()
                .map(|group| group.iter().map(|w| (*w).to_lowercase()).collect())
                .collect(),
        }
    }
}

#[async_trait]
impl EmbeddingClient for KeywordEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ClientError> {
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                self.groups
                    .iter()
                    .map(|group| {
                        group
                            .iter()
                            .map(|word| lower.matches(word.as_str()).count())
                            .sum::<usize>() as f32
                    })
                    .collect()
            })
            .collect())
    }
}

/// Embedder that answers from a (needle -> vector) script; unmatched
/// texts get the zero vector.
#[derive(Debug)]
pub struct ScriptedEmbedder {
    dimension: usize,
    rules: Vec<(String, Vec<f32>)>,
}

impl ScriptedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn rule(mut self, needle: &str, vector: Vec<f32>) -> Self {
        self.rules.push((needle.to_string(), vector));
        self
    }
}

#[async_trait]
impl EmbeddingClient for ScriptedEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ClientError> {
        Ok(texts
            .iter()
            .map(|text| {
                self.rules
                    .iter()
                    .find(|(needle, _)| text.contains(needle))
                    .map_or_else(|| vec![0.0; self.dimension], |(_, v)| v.clone())
            })
            .collect())
    }
}

/// Embedder whose every call fails; drives `retrieval_failed` paths.
#[derive(Debug)]
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingClient for FailingEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ClientError> {
        Err(ClientError::Permanent {
            message: "embedding service down".to_string(),
        })
    }
}

/// Vector index whose every search fails.
#[derive(Debug)]
pub struct FailingIndex;

#[async_trait]
impl VectorIndex for FailingIndex {
    async fn similarity_search(
        &self,
        _query_vector: &[f32],
        _k: usize,
        _filter: &DocumentFilter,
    ) -> Result<Vec<IndexHit>, ClientError> {
        Err(ClientError::Upstream {
            message: "index unavailable".to_string(),
            status: Some(503),
        })
    }

    async fn upsert(&self, _chunks: Vec<EmbeddedChunk>) -> Result<(), ClientError> {
        Err(ClientError::Permanent {
            message: "index unavailable".to_string(),
        })
    }

    async fn delete_by_document(&self, _document_id: &str) -> Result<usize, ClientError> {
        Ok(0)
    }

    async fn dimension(&self) -> Option<usize> {
        None
    }
}

/// Builds a chunk with `(document_id, ordinal)` identity.
pub fn chunk(document_id: &str, ordinal: usize, text: &str) -> Chunk {
    Chunk {
        chunk_id: format!("{document_id}:{ordinal}"),
        document_id: document_id.to_string(),
        ordinal,
        text: text.to_string(),
        metadata: BTreeMap::new(),
    }
}

/// Embeds `chunks` with `embedder` and hydrates an in-memory index.
pub async fn build_index(
    embedder: &dyn EmbeddingClient,
    chunks: Vec<Chunk>,
) -> MemoryVectorIndex {
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed(&texts).await.unwrap_or_default();
    let embedded: Vec<EmbeddedChunk> = chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
        .collect();
    MemoryVectorIndex::hydrate(embedded).unwrap_or_else(|_| MemoryVectorIndex::new())
}

/// The three-chunk France corpus used across scenarios.
pub fn paris_chunks() -> Vec<Chunk> {
    vec![
        chunk("doc1", 0, "Paris is the capital of France."),
        chunk("doc1", 1, "Berlin is in Germany."),
        chunk("doc1", 2, "The Seine runs through Paris."),
    ]
}

/// The keyword groups that cluster the France corpus sensibly.
pub fn paris_embedder() -> KeywordEmbedder {
    KeywordEmbedder::new(&[
        &["paris", "france", "capital", "seine"],
        &["berlin", "germany"],
    ])
}

/// Bundles fakes into the capability set techniques consume.
pub fn caps(
    index: Arc<dyn VectorIndex>,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn EmbeddingClient>,
) -> Capabilities {
    Capabilities {
        index,
        llm,
        embedder,
    }
}
