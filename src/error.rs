//! Error types for rag-arena.
//!
//! Errors are split by subsystem: [`ClientError`] for the capability
//! boundaries (LLM, embedding, vector index), [`StageError`] for failures
//! inside a technique run, [`RequestError`] for request-level rejection,
//! [`StorageError`] for persistence, and [`EvalError`] for the evaluator
//! pipeline. Technique failures never cross the dispatcher boundary as
//! errors; they are folded into an [`ErrorKind`] on the result row.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification surfaced on a technique result or evaluation row.
///
/// This is the only error shape that crosses the dispatcher boundary.
/// Serialized in `snake_case` to match the persisted `error_kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Technique name not present in the registry.
    UnknownTechnique,
    /// Vector index call failed after retries.
    RetrievalFailed,
    /// LLM call failed permanently.
    LlmFailed,
    /// Exceeded the per-technique budget.
    Timeout,
    /// Caller canceled the request.
    Canceled,
    /// Evaluator could not parse a score or its LLM call failed.
    EvaluatorFailed,
    /// Write to the store failed; results were still returned.
    PersistenceFailed,
    /// A bug: an unhandled error reached the dispatcher.
    InternalError,
}

impl ErrorKind {
    /// Returns the `snake_case` string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTechnique => "unknown_technique",
            Self::RetrievalFailed => "retrieval_failed",
            Self::LlmFailed => "llm_failed",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::EvaluatorFailed => "evaluator_failed",
            Self::PersistenceFailed => "persistence_failed",
            Self::InternalError => "internal_error",
        }
    }
}

impl ErrorKind {
    /// Parses the persisted `snake_case` form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown_technique" => Some(Self::UnknownTechnique),
            "retrieval_failed" => Some(Self::RetrievalFailed),
            "llm_failed" => Some(Self::LlmFailed),
            "timeout" => Some(Self::Timeout),
            "canceled" => Some(Self::Canceled),
            "evaluator_failed" => Some(Self::EvaluatorFailed),
            "persistence_failed" => Some(Self::PersistenceFailed),
            "internal_error" => Some(Self::InternalError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the outbound capability boundaries (C1-C3).
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The call exceeded the client-level timeout.
    #[error("request timed out after {seconds}s")]
    Timeout {
        /// Configured timeout that was exceeded.
        seconds: u64,
    },

    /// The provider rejected the call with a rate limit. Retried.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Provider-supplied detail.
        message: String,
    },

    /// Transient upstream failure. Retried up to the configured budget.
    #[error("upstream error{}: {message}", status.map_or_else(String::new, |s| format!(" (status {s})")))]
    Upstream {
        /// Provider-supplied detail.
        message: String,
        /// HTTP status, when one was observed.
        status: Option<u16>,
    },

    /// Permanent failure. Surfaced without retry.
    #[error("permanent error: {message}")]
    Permanent {
        /// Provider-supplied detail.
        message: String,
    },

    /// Embedding dimension disagrees with the vector index.
    #[error("embedding dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the index was built with.
        expected: usize,
        /// Dimension the embedding client returned.
        actual: usize,
    },
}

impl ClientError {
    /// Whether the retry policy may attempt this call again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Upstream { .. })
    }
}

/// A failure inside a technique run, tagged with the stage it occurred at.
///
/// Techniques return these from their internal pipeline; the run wrapper
/// catches them, records a `<stage>_error` trace event, and folds them
/// into the [`ErrorKind`] on the returned result.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// A vector search or embedding call failed.
    #[error("{stage}: retrieval failed: {message}")]
    Retrieval {
        /// Pipeline stage identifier (e.g. `"retrieve"`, `"hyde_embed"`).
        stage: &'static str,
        /// Underlying failure detail.
        message: String,
    },

    /// An LLM completion failed permanently.
    #[error("{stage}: LLM call failed: {message}")]
    Llm {
        /// Pipeline stage identifier.
        stage: &'static str,
        /// Underlying failure detail.
        message: String,
    },

    /// The cancellation signal was observed between outbound calls.
    #[error("{stage}: canceled")]
    Canceled {
        /// Pipeline stage identifier.
        stage: &'static str,
    },

    /// An invariant was violated. Always a bug.
    #[error("{stage}: internal error: {message}")]
    Internal {
        /// Pipeline stage identifier.
        stage: &'static str,
        /// Detail for the log.
        message: String,
    },
}

impl StageError {
    /// Builds a retrieval failure for `stage`.
    pub fn retrieval(stage: &'static str, err: &ClientError) -> Self {
        Self::Retrieval {
            stage,
            message: err.to_string(),
        }
    }

    /// Builds an LLM failure for `stage`.
    pub fn llm(stage: &'static str, err: &ClientError) -> Self {
        Self::Llm {
            stage,
            message: err.to_string(),
        }
    }

    /// The stage this error occurred at.
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::Retrieval { stage, .. }
            | Self::Llm { stage, .. }
            | Self::Canceled { stage }
            | Self::Internal { stage, .. } => stage,
        }
    }

    /// Maps this stage failure to the surfaced [`ErrorKind`].
    #[must_use]
    pub const fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Retrieval { .. } => ErrorKind::RetrievalFailed,
            Self::Llm { .. } => ErrorKind::LlmFailed,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::Internal { .. } => ErrorKind::InternalError,
        }
    }
}

/// Request-level rejection, reported before any technique runs.
#[derive(Debug, Error)]
pub enum RequestError {
    /// A requested technique name is not in the registry.
    #[error("unknown technique: {name}")]
    UnknownTechnique {
        /// The unrecognized name.
        name: String,
    },

    /// The referenced session does not exist.
    #[error("session not found: {id}")]
    SessionNotFound {
        /// The missing session id.
        id: i64,
    },

    /// The query text was empty after trimming.
    #[error("query cannot be empty")]
    EmptyQuery,

    /// The query exceeded the maximum accepted length.
    #[error("query exceeds maximum length ({len} bytes, max {max})")]
    QueryTooLong {
        /// Observed length.
        len: usize,
        /// Accepted maximum.
        max: usize,
    },

    /// A storage operation failed while validating the request.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persistence layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database file could not be opened.
    #[error("failed to open database: {message}")]
    Open {
        /// Underlying failure detail.
        message: String,
    },

    /// The schema has not been created yet. Run `rag-arena init`.
    #[error("database not initialized (run 'rag-arena init')")]
    NotInitialized,

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A persisted JSON column failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The referenced session does not exist.
    #[error("session not found: {id}")]
    SessionNotFound {
        /// The missing session id.
        id: i64,
    },

    /// The referenced QA record does not exist.
    #[error("QA record not found: {id}")]
    RecordNotFound {
        /// The missing record id.
        id: i64,
    },
}

/// Evaluator pipeline errors. Folded into `evaluator_failed` on the row.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The evaluator's LLM or embedding call failed.
    #[error("evaluator client call failed: {0}")]
    Client(#[from] ClientError),

    /// The evaluator could not extract a score from the model output.
    #[error("evaluator parse failure: {message}")]
    Parse {
        /// Detail including a response preview.
        message: String,
    },

    /// The isolated worker exceeded its per-evaluation budget.
    #[error("reference evaluation timed out after {seconds}s")]
    Timeout {
        /// Configured budget that was exceeded.
        seconds: u64,
    },

    /// The isolated worker is gone (its thread exited).
    #[error("reference evaluation worker unavailable")]
    WorkerGone,
}

/// Client construction errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API key was provided or found in the environment.
    #[error("no API key found (set OPENAI_API_KEY or RAG_ARENA_API_KEY)")]
    ApiKeyMissing,

    /// A configuration value was out of range or unparseable.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// What was wrong.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_strings() {
        assert_eq!(ErrorKind::RetrievalFailed.as_str(), "retrieval_failed");
        assert_eq!(ErrorKind::Timeout.as_str(), "timeout");
        assert_eq!(ErrorKind::InternalError.as_str(), "internal_error");
    }

    #[test]
    fn test_error_kind_serde_round_trip() {
        let json = serde_json::to_string(&ErrorKind::LlmFailed).unwrap_or_default();
        assert_eq!(json, "\"llm_failed\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap_or(ErrorKind::InternalError);
        assert_eq!(back, ErrorKind::LlmFailed);
    }

    #[test]
    fn test_client_error_retryable() {
        assert!(
            ClientError::RateLimited {
                message: "slow down".to_string()
            }
            .is_retryable()
        );
        assert!(
            ClientError::Upstream {
                message: "502".to_string(),
                status: Some(502)
            }
            .is_retryable()
        );
        assert!(!ClientError::Timeout { seconds: 60 }.is_retryable());
        assert!(
            !ClientError::Permanent {
                message: "bad request".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_stage_error_mapping() {
        let err = StageError::Retrieval {
            stage: "retrieve",
            message: "index down".to_string(),
        };
        assert_eq!(err.error_kind(), ErrorKind::RetrievalFailed);
        assert_eq!(err.stage(), "retrieve");

        let err = StageError::Canceled { stage: "generate" };
        assert_eq!(err.error_kind(), ErrorKind::Canceled);
    }
}
