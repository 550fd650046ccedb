//! Capability boundaries for outbound collaborators.
//!
//! The pipeline talks to three external capabilities through traits:
//! the vector index, the language model, and the embedding service.
//! Implementations translate provider-agnostic request/response types
//! into SDK calls, keeping all technique and evaluator logic decoupled
//! from any particular vendor.

pub mod config;
pub mod memory;
pub mod openai;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::EmbeddedChunk;
use crate::error::ClientError;

pub use config::{ClientConfig, ClientConfigBuilder};
pub use memory::MemoryVectorIndex;
pub use openai::{OpenAiEmbedder, OpenAiLlm};

/// A text completion request (provider-agnostic).
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System instructions.
    pub system: String,
    /// User message.
    pub user: String,
    /// Sampling temperature (0.0 = deterministic).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Builds a deterministic request with the default token budget.
    #[must_use]
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.0,
            max_tokens: 1024,
        }
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the response token budget.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token usage statistics from a completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens generated in the completion.
    pub completion_tokens: u32,
    /// Total tokens used.
    pub total_tokens: u32,
}

/// A completed text generation.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Token usage for this call.
    pub usage: TokenUsage,
}

/// Trait for language-model backends.
///
/// Implementations own the transport layer including the retry policy:
/// `rate_limited` and `upstream_error` failures are retried with
/// exponential backoff (max 3 tries); completions are treated as
/// best-effort, so duplicate completions on retry are acceptable.
/// Implementations must be stateless across calls and safe for
/// concurrent use.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Client name for logging (e.g. `"openai"`).
    fn name(&self) -> &'static str;

    /// Executes a completion request.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when the client-level deadline
    /// passes, [`ClientError::Permanent`] when retries are exhausted or
    /// the failure is not retryable.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ClientError>;
}

/// Trait for embedding backends.
///
/// All vectors returned by one client share a single dimension; callers
/// assert that dimension against the vector index before use.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embeds a batch of texts into fixed-dimension vectors.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on transport failure or when the provider
    /// returns vectors of uneven dimension.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ClientError>;
}

/// Document-id scoping for a similarity search. Empty = whole index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFilter(BTreeSet<String>);

impl DocumentFilter {
    /// Matches every document.
    #[must_use]
    pub const fn all() -> Self {
        Self(BTreeSet::new())
    }

    /// Restricts to the given document ids.
    pub fn documents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }

    /// Whether `document_id` passes the filter.
    #[must_use]
    pub fn matches(&self, document_id: &str) -> bool {
        self.0.is_empty() || self.0.contains(document_id)
    }

    /// Whether this filter matches everything.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.0.is_empty()
    }
}

/// One similarity-search result from the vector index.
///
/// Scores are similarities `>= 0`, strictly descending in the returned
/// list, and stable across repeat calls against an unchanged index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    /// Identifier of the matched chunk.
    pub chunk_id: String,
    /// Chunk text.
    pub text: String,
    /// Chunk metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Similarity score.
    pub score: f64,
}

/// Trait for the vector index collaborator.
///
/// Read-concurrent; writes happen only at ingest. The index internals
/// are opaque to the pipeline.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Returns the `k` most similar chunks to `query_vector`, scoped by
    /// `filter`, ordered strictly descending by score.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DimensionMismatch`] when the query vector
    /// does not match the index dimension, or a transport error.
    async fn similarity_search(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &DocumentFilter,
    ) -> Result<Vec<IndexHit>, ClientError>;

    /// Inserts or replaces embedded chunks.
    async fn upsert(&self, chunks: Vec<EmbeddedChunk>) -> Result<(), ClientError>;

    /// Removes every chunk of `document_id`, returning the count removed.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize, ClientError>;

    /// The index dimension, once at least one vector has been inserted.
    async fn dimension(&self) -> Option<usize>;
}
