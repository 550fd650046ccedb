//! `OpenAI`-backed clients using the `async-openai` crate.
//!
//! Supports any `OpenAI`-compatible API (`OpenAI`, Azure, local proxies)
//! via the base URL override in [`ClientConfig`]. Both clients share the
//! retry policy: exponential backoff, up to `max_retries` attempts, only
//! for rate-limit and transient upstream failures. Completions are
//! best-effort, so a duplicate completion on retry is acceptable.

use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest, CreateEmbeddingRequest,
    EmbeddingInput,
};
use async_trait::async_trait;

use super::config::ClientConfig;
use super::{Completion, CompletionRequest, EmbeddingClient, LlmClient, TokenUsage};
use crate::error::ClientError;

/// Base delay for exponential backoff between retry attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// `OpenAI`-compatible language model client.
pub struct OpenAiLlm {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiLlm {
    /// Creates a client bound to an explicit model id.
    #[must_use]
    pub fn new(config: &ClientConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(sdk_config(config)),
            model: model.into(),
            timeout: config.timeout,
            max_retries: config.max_retries,
        }
    }

    /// Client for technique generation calls.
    #[must_use]
    pub fn generation(config: &ClientConfig) -> Self {
        Self::new(config, config.generation_model.clone())
    }

    /// Client for evaluator calls.
    #[must_use]
    pub fn judge(config: &ClientConfig) -> Self {
        Self::new(config, config.judge_model.clone())
    }

    fn build_request(&self, request: &CompletionRequest) -> CreateChatCompletionRequest {
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: ChatCompletionRequestSystemMessageContent::Text(request.system.clone()),
                name: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(request.user.clone()),
                name: None,
            }),
        ];

        CreateChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(request.temperature).filter(|&t| t != 0.0),
            max_completion_tokens: Some(request.max_tokens),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for OpenAiLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiLlm")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LlmClient for OpenAiLlm {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ClientError> {
        let openai_request = self.build_request(request);

        let response = retry(self.max_retries, self.timeout, || {
            let attempt_request = openai_request.clone();
            async move {
                self.client
                    .chat()
                    .create(attempt_request)
                    .await
                    .map_err(|e| classify(&e))
            }
        })
        .await?;

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .cloned()
            .unwrap_or_default();

        let usage = response
            .usage
            .map_or_else(TokenUsage::default, |u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });

        Ok(Completion { text, usage })
    }
}

/// `OpenAI`-compatible embedding client.
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiEmbedder {
    /// Creates an embedder from the shared client configuration.
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            client: Client::with_config(sdk_config(config)),
            model: config.embedding_model.clone(),
            timeout: config.timeout,
            max_retries: config.max_retries,
        }
    }
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ClientError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = CreateEmbeddingRequest {
            model: self.model.clone(),
            input: EmbeddingInput::StringArray(texts.to_vec()),
            ..Default::default()
        };

        let response = retry(self.max_retries, self.timeout, || {
            let attempt_request = request.clone();
            async move {
                self.client
                    .embeddings()
                    .create(attempt_request)
                    .await
                    .map_err(|e| classify(&e))
            }
        })
        .await?;

        let vectors: Vec<Vec<f32>> = response.data.into_iter().map(|d| d.embedding).collect();

        // The provider must return one uniform dimension per batch.
        if let Some(first) = vectors.first() {
            let expected = first.len();
            if let Some(odd) = vectors.iter().find(|v| v.len() != expected) {
                return Err(ClientError::DimensionMismatch {
                    expected,
                    actual: odd.len(),
                });
            }
        }

        Ok(vectors)
    }
}

fn sdk_config(config: &ClientConfig) -> OpenAIConfig {
    let mut openai_config = OpenAIConfig::new().with_api_key(&config.api_key);
    if let Some(ref base_url) = config.base_url {
        openai_config = openai_config.with_api_base(base_url);
    }
    openai_config
}

/// Maps SDK errors onto the client error taxonomy.
fn classify(err: &OpenAIError) -> ClientError {
    match err {
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default();
            let message = api.message.clone();
            if kind.contains("rate_limit") || message.to_lowercase().contains("rate limit") {
                ClientError::RateLimited { message }
            } else if kind.contains("server_error") || kind.contains("overloaded") {
                ClientError::Upstream {
                    message,
                    status: None,
                }
            } else {
                ClientError::Permanent { message }
            }
        }
        OpenAIError::Reqwest(e) => ClientError::Upstream {
            message: e.to_string(),
            status: e.status().map(|s| s.as_u16()),
        },
        other => ClientError::Permanent {
            message: other.to_string(),
        },
    }
}

/// Runs `attempt` up to `max_retries` times under a per-attempt deadline.
///
/// Only retryable failures are attempted again; a timeout or permanent
/// failure is surfaced immediately.
async fn retry<T, Fut>(
    max_retries: u32,
    deadline: Duration,
    mut attempt: impl FnMut() -> Fut,
) -> Result<T, ClientError>
where
    Fut: Future<Output = Result<T, ClientError>>,
{
    let attempts = max_retries.max(1);
    let mut last = None;

    for round in 0..attempts {
        match tokio::time::timeout(deadline, attempt()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if err.is_retryable() && round + 1 < attempts => {
                tracing::debug!(round, error = %err, "retrying outbound call");
                tokio::time::sleep(BACKOFF_BASE * 2u32.saturating_pow(round)).await;
                last = Some(err);
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(ClientError::Timeout {
                    seconds: deadline.as_secs(),
                });
            }
        }
    }

    Err(last.unwrap_or(ClientError::Permanent {
        message: "retry budget exhausted".to_string(),
    }))
}
