//! Client configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values, then environment
//! variables, then defaults.

use std::time::Duration;

use crate::error::ConfigError;

/// Default per-LLM-call timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// Default maximum attempts per outbound call.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default generation model.
const DEFAULT_GENERATION_MODEL: &str = "gpt-5-mini-2025-08-07";
/// Default judge model used by the evaluators.
const DEFAULT_JUDGE_MODEL: &str = "gpt-5.2-2025-12-11";
/// Default embedding model.
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Configuration for the outbound LLM and embedding clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key for the provider.
    pub api_key: String,
    /// Optional base URL override (for proxies or compatible APIs).
    pub base_url: Option<String>,
    /// Model used by the technique generation calls.
    pub generation_model: String,
    /// Model used by the evaluator calls.
    pub judge_model: String,
    /// Embedding model.
    pub embedding_model: String,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Maximum attempts per retryable call.
    pub max_retries: u32,
}

impl ClientConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ApiKeyMissing`] if no API key is found.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().from_env().build()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    generation_model: Option<String>,
    judge_model: Option<String>,
    embedding_model: Option<String>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl ClientConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.api_key.is_none() {
            self.api_key = std::env::var("OPENAI_API_KEY")
                .or_else(|_| std::env::var("RAG_ARENA_API_KEY"))
                .ok();
        }
        if self.base_url.is_none() {
            self.base_url = std::env::var("OPENAI_BASE_URL")
                .or_else(|_| std::env::var("RAG_ARENA_BASE_URL"))
                .ok();
        }
        if self.generation_model.is_none() {
            self.generation_model = std::env::var("RAG_ARENA_GENERATION_MODEL").ok();
        }
        if self.judge_model.is_none() {
            self.judge_model = std::env::var("RAG_ARENA_JUDGE_MODEL").ok();
        }
        if self.embedding_model.is_none() {
            self.embedding_model = std::env::var("RAG_ARENA_EMBEDDING_MODEL").ok();
        }
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL override.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the generation model.
    #[must_use]
    pub fn generation_model(mut self, model: impl Into<String>) -> Self {
        self.generation_model = Some(model.into());
        self
    }

    /// Sets the judge model.
    #[must_use]
    pub fn judge_model(mut self, model: impl Into<String>) -> Self {
        self.judge_model = Some(model.into());
        self
    }

    /// Sets the embedding model.
    #[must_use]
    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Sets the maximum attempts per retryable call.
    #[must_use]
    pub const fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Builds the [`ClientConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ApiKeyMissing`] if no API key was set.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let api_key = self.api_key.ok_or(ConfigError::ApiKeyMissing)?;

        Ok(ClientConfig {
            api_key,
            base_url: self.base_url,
            generation_model: self
                .generation_model
                .unwrap_or_else(|| DEFAULT_GENERATION_MODEL.to_string()),
            judge_model: self
                .judge_model
                .unwrap_or_else(|| DEFAULT_JUDGE_MODEL.to_string()),
            embedding_model: self
                .embedding_model
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            timeout: self
                .timeout
                .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        })
    }
}
