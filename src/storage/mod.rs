//! Persistence layer: sessions, QA records, evaluations, vector store.
//!
//! The [`Storage`] trait is the sync, thread-bound seam between the
//! async pipeline and SQLite. Handles are not `Send`; callers load
//! before fanning out and persist after collecting, on their own
//! thread.

pub mod sqlite;

use crate::core::{EmbeddedChunk, EvaluationScore, QaRecord, ScoreType, Session, TechniqueResult};
use crate::error::StorageError;

pub use sqlite::SqliteStorage;

/// Persistent store for the evaluation pipeline.
pub trait Storage {
    /// Creates the schema if missing; idempotent.
    fn init(&mut self) -> Result<(), StorageError>;

    /// Whether the schema exists.
    fn is_initialized(&self) -> Result<bool, StorageError>;

    /// Creates a session with `title`.
    fn create_session(&self, title: &str) -> Result<Session, StorageError>;

    /// Loads one session.
    fn get_session(&self, id: i64) -> Result<Option<Session>, StorageError>;

    /// Lists sessions, most recently updated first.
    fn list_sessions(&self) -> Result<Vec<Session>, StorageError>;

    /// Writes one QA record per result inside a single transaction and
    /// touches the session's update time.
    ///
    /// Returns the new row ids, parallel to `results`.
    fn insert_qa_batch(
        &self,
        session_id: i64,
        query: &str,
        results: &[TechniqueResult],
    ) -> Result<Vec<i64>, StorageError>;

    /// Loads one QA record with its deserialized chunks and trace.
    fn get_qa_record(&self, id: i64) -> Result<Option<QaRecord>, StorageError>;

    /// Lists a session's QA records, oldest first.
    fn list_qa_records(&self, session_id: i64) -> Result<Vec<QaRecord>, StorageError>;

    /// Appends an evaluation row (history is kept; latest wins).
    fn insert_evaluation(&self, score: &EvaluationScore) -> Result<i64, StorageError>;

    /// Lists every evaluation of one record, newest first.
    fn list_evaluations(&self, qa_record_id: i64) -> Result<Vec<EvaluationScore>, StorageError>;

    /// The winning (latest) evaluation for one (record, type, evaluator).
    fn latest_evaluation(
        &self,
        qa_record_id: i64,
        score_type: ScoreType,
        evaluator: &str,
    ) -> Result<Option<EvaluationScore>, StorageError>;

    /// Inserts or replaces embedded chunks in the vector store.
    fn upsert_chunks(&self, chunks: &[EmbeddedChunk]) -> Result<(), StorageError>;

    /// Loads the whole vector store (used to hydrate the in-memory
    /// index at startup).
    fn load_chunks(&self) -> Result<Vec<EmbeddedChunk>, StorageError>;

    /// Deletes every chunk of one document, returning the count.
    fn delete_document(&self, document_id: &str) -> Result<usize, StorageError>;
}
