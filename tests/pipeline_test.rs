//! End-to-end pipeline scenarios over scripted fakes.
//!
//! Covers the fan-out ordering, isolation, and determinism contracts
//! plus the per-technique behavioral scenarios.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rag_arena::core::{RagConfig, Session, TechniqueResult};
use rag_arena::dispatch::{FanoutDispatcher, FanoutRequest};
use rag_arena::error::{ErrorKind, RequestError, StorageError};
use rag_arena::storage::{SqliteStorage, Storage};

use common::{
    FailingIndex, FakeLlm, ScriptedEmbedder, build_index, caps, chunk, paris_chunks,
    paris_embedder,
};

fn request(session_id: i64, query: &str, techniques: &[&str], config: serde_json::Value) -> FanoutRequest {
    FanoutRequest {
        session_id,
        query: query.to_string(),
        document_ids: Vec::new(),
        technique_names: techniques.iter().map(|s| (*s).to_string()).collect(),
        config: RagConfig::from_value(&config),
    }
}

fn storage_with_session() -> (SqliteStorage, Session) {
    let storage = SqliteStorage::open_in_memory().unwrap_or_else(|_| unreachable!());
    let session = storage
        .create_session("test")
        .unwrap_or_else(|_| unreachable!());
    (storage, session)
}

#[tokio::test]
async fn scenario_a_baseline_happy_path() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    let llm = Arc::new(FakeLlm::new().rule(
        "What is the capital of France?",
        "The capital of France is Paris.",
    ));
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "What is the capital of France?",
                &["baseline"],
                serde_json::json!({ "top_k": 2 }),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(report.results.len(), 1);
    let result = &report.results[0];
    assert!(result.is_success());
    assert!(result.answer.contains("Paris"));

    // Expected context: the direct answer chunk, then the related one.
    let ids: Vec<&str> = result
        .retrieved_chunks
        .iter()
        .map(|c| c.chunk_id.as_str())
        .collect();
    assert_eq!(ids, vec!["doc1:0", "doc1:2"]);

    // retrieve_complete carries the result count.
    let complete = result
        .trace
        .iter()
        .find(|e| e.step == "retrieve_complete")
        .unwrap_or_else(|| unreachable!());
    assert_eq!(complete.details["result_count"], serde_json::json!(2));

    // Trace sequence numbers form a strict monotonic sequence from 0.
    for (i, event) in result.trace.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }

    // Provenance: every final chunk came from the index.
    let corpus_ids: Vec<String> = paris_chunks().into_iter().map(|c| c.chunk_id).collect();
    for retrieved in &result.retrieved_chunks {
        assert!(corpus_ids.contains(&retrieved.chunk_id));
    }

    // Persisted and linked to the session.
    assert!(!report.persistence_failed);
    assert_eq!(report.record_ids.len(), 1);
    let record = storage
        .get_qa_record(report.record_ids[0])
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(record.session_id, session.id);
    assert_eq!(record.result.answer, result.answer);
}

#[tokio::test]
async fn scenario_b_fanout_preserves_input_order() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    // The middle technique is the slowest; ordering must not change.
    let llm = Arc::new(
        FakeLlm::new()
            .rule_delayed(
                "You rate how relevant a passage",
                "7",
                Duration::from_millis(200),
            )
            .rule_delayed(
                "encyclopedia-style",
                "Paris, the capital of France, lies on the Seine.",
                Duration::from_millis(50),
            )
            .with_default("Paris."),
    );
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "What is the capital of France?",
                &["baseline", "reranker", "hyde"],
                serde_json::json!({ "top_k": 2 }),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    let order: Vec<&str> = report.results.iter().map(|r| r.technique.as_str()).collect();
    assert_eq!(order, vec!["baseline", "reranker", "hyde"]);
    assert!(report.results.iter().all(TechniqueResult::is_success));
}

#[tokio::test]
async fn scenario_c_timeout_isolation() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    // Reranker scoring stalls far past the per-technique budget.
    let llm = Arc::new(
        FakeLlm::new()
            .rule_delayed(
                "You rate how relevant a passage",
                "7",
                Duration::from_secs(5),
            )
            .with_default("Paris."),
    );
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "What is the capital of France?",
                &["baseline", "reranker"],
                serde_json::json!({ "top_k": 2, "per_technique_timeout_s": 0.3 }),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    let baseline = &report.results[0];
    assert!(baseline.is_success());

    let slow = &report.results[1];
    assert_eq!(slow.error_kind, Some(ErrorKind::Timeout));
    assert!(slow.answer.is_empty());
    // The partial trace recorded before the deadline survives.
    assert!(slow.trace.iter().any(|e| e.step == "init"));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn scenario_d_self_reflective_skips_retrieval() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    let llm = Arc::new(
        FakeLlm::new()
            .rule("requires looking up documents", "no")
            .rule(
                "Answer the user's question directly",
                "I am the rag-arena assistant.",
            ),
    );
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "Hello, who are you?",
                &["self_reflective"],
                serde_json::json!({}),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    let result = &report.results[0];
    assert!(result.is_success());
    assert!(!result.answer.is_empty());
    assert!(result.retrieved_chunks.is_empty());

    let decision = result
        .trace
        .iter()
        .find(|e| e.step.contains("retrieval_decision"))
        .unwrap_or_else(|| unreachable!());
    assert_eq!(decision.details["decision"], serde_json::json!("no"));
}

#[tokio::test]
async fn scenario_e_fusion_ranks_dual_match_first() {
    let embedder = Arc::new(
        ScriptedEmbedder::new(2)
            .rule("alpha beta facts", vec![0.9, 0.1])
            .rule("semantic cousin", vec![1.0, 0.0])
            .rule("alpha beta unrelated", vec![0.0, 1.0])
            .rule("alpha beta", vec![1.0, 0.0]),
    );
    let corpus = vec![
        chunk("d1", 0, "alpha beta facts about the topic."),
        chunk("d1", 1, "semantic cousin content with different words."),
        chunk("d1", 2, "alpha beta unrelated list of things."),
    ];
    let index = Arc::new(build_index(&*embedder, corpus).await);
    let llm = Arc::new(FakeLlm::new().with_default("Summary answer."));
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "alpha beta",
                &["fusion"],
                serde_json::json!({ "top_k": 2, "vector_weight": 0.5, "lexical_weight": 0.5 }),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    let result = &report.results[0];
    assert!(result.is_success());
    // The chunk matching both signals must win.
    assert_eq!(result.retrieved_chunks[0].chunk_id, "d1:0");
    assert!(
        result
            .trace
            .iter()
            .any(|e| e.step == "fusion_merge" && e.details["lexical_hits"] == serde_json::json!(2))
    );
}

#[tokio::test]
async fn concurrency_stays_under_bound() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    let llm = Arc::new(
        FakeLlm::new()
            .rule_delayed("Question:", "Paris.", Duration::from_millis(40))
            .with_default("Paris."),
    );
    let llm_probe = Arc::clone(&llm);
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "What is the capital of France?",
                &["baseline", "baseline", "baseline", "baseline", "baseline"],
                serde_json::json!({ "top_k": 2, "max_concurrency": 2 }),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(report.results.len(), 5);
    assert!(report.results.iter().all(TechniqueResult::is_success));
    assert!(
        llm_probe.max_in_flight() <= 2,
        "observed {} concurrent LLM calls under max_concurrency=2",
        llm_probe.max_in_flight()
    );
}

#[tokio::test]
async fn baseline_is_deterministic_on_frozen_index() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    let llm = Arc::new(FakeLlm::new().with_default("Paris."));
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let run = || async {
        dispatcher
            .run(
                &storage,
                &request(
                    session.id,
                    "What is the capital of France?",
                    &["baseline"],
                    serde_json::json!({ "top_k": 3 }),
                ),
                &CancellationToken::new(),
            )
            .await
            .unwrap_or_else(|_| unreachable!())
    };

    let first = run().await;
    let second = run().await;
    assert_eq!(
        first.results[0].retrieved_chunks,
        second.results[0].retrieved_chunks
    );
}

#[tokio::test]
async fn top_k_zero_still_generates() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    let llm = Arc::new(FakeLlm::new().with_default("No context needed."));
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "What is the capital of France?",
                &["baseline"],
                serde_json::json!({ "top_k": 0 }),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    let result = &report.results[0];
    assert!(result.is_success());
    assert!(result.retrieved_chunks.is_empty());
    assert!(!result.answer.is_empty());
}

#[tokio::test]
async fn retrieval_failure_is_isolated() {
    let embedder = Arc::new(paris_embedder());
    let llm = Arc::new(FakeLlm::new().with_default("Paris."));
    let dispatcher = FanoutDispatcher::new(caps(Arc::new(FailingIndex), llm, embedder));

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "What is the capital of France?",
                &["baseline"],
                serde_json::json!({}),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    let result = &report.results[0];
    assert_eq!(result.error_kind, Some(ErrorKind::RetrievalFailed));
    assert!(result.answer.is_empty());
    assert!(result.retrieved_chunks.is_empty());
    assert!(result.trace.iter().any(|e| e.step.ends_with("_error")));
}

#[tokio::test]
async fn unknown_technique_rejected_at_entry() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    let llm = Arc::new(FakeLlm::new());
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let err = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "query",
                &["baseline", "definitely_not_a_technique"],
                serde_json::json!({}),
            ),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(
        err,
        Err(RequestError::UnknownTechnique { name }) if name == "definitely_not_a_technique"
    ));
}

#[tokio::test]
async fn missing_session_rejected_at_entry() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    let dispatcher = FanoutDispatcher::new(caps(index, Arc::new(FakeLlm::new()), embedder));

    let storage = SqliteStorage::open_in_memory().unwrap_or_else(|_| unreachable!());
    let err = dispatcher
        .run(
            &storage,
            &request(777, "query", &["baseline"], serde_json::json!({})),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(err, Err(RequestError::SessionNotFound { id: 777 })));
}

#[tokio::test]
async fn cancellation_preserves_traces_and_persists() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    let llm = Arc::new(FakeLlm::new().with_default("Paris."));
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let cancel = CancellationToken::new();
    cancel.cancel();

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "What is the capital of France?",
                &["baseline", "fusion"],
                serde_json::json!({}),
            ),
            &cancel,
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    for result in &report.results {
        assert_eq!(result.error_kind, Some(ErrorKind::Canceled));
        // The trace up to the cancel point is preserved.
        assert!(result.trace.iter().any(|e| e.step == "init"));
    }

    // Canceled outcomes still land in the store.
    assert!(!report.persistence_failed);
    let records = storage
        .list_qa_records(session.id)
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(records.len(), 2);
}

/// Storage whose batch write always fails; everything else is benign.
struct WriteFailStorage {
    session: Session,
}

impl Storage for WriteFailStorage {
    fn init(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
    fn is_initialized(&self) -> Result<bool, StorageError> {
        Ok(true)
    }
    fn create_session(&self, _title: &str) -> Result<Session, StorageError> {
        Ok(self.session.clone())
    }
    fn get_session(&self, id: i64) -> Result<Option<Session>, StorageError> {
        Ok((id == self.session.id).then(|| self.session.clone()))
    }
    fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        Ok(vec![self.session.clone()])
    }
    fn insert_qa_batch(
        &self,
        _session_id: i64,
        _query: &str,
        _results: &[TechniqueResult],
    ) -> Result<Vec<i64>, StorageError> {
        Err(StorageError::Open {
            message: "disk full".to_string(),
        })
    }
    fn get_qa_record(
        &self,
        id: i64,
    ) -> Result<Option<rag_arena::core::QaRecord>, StorageError> {
        Err(StorageError::RecordNotFound { id })
    }
    fn list_qa_records(
        &self,
        _session_id: i64,
    ) -> Result<Vec<rag_arena::core::QaRecord>, StorageError> {
        Ok(Vec::new())
    }
    fn insert_evaluation(
        &self,
        _score: &rag_arena::core::EvaluationScore,
    ) -> Result<i64, StorageError> {
        Err(StorageError::Open {
            message: "disk full".to_string(),
        })
    }
    fn list_evaluations(
        &self,
        _qa_record_id: i64,
    ) -> Result<Vec<rag_arena::core::EvaluationScore>, StorageError> {
        Ok(Vec::new())
    }
    fn latest_evaluation(
        &self,
        _qa_record_id: i64,
        _score_type: rag_arena::core::ScoreType,
        _evaluator: &str,
    ) -> Result<Option<rag_arena::core::EvaluationScore>, StorageError> {
        Ok(None)
    }
    fn upsert_chunks(
        &self,
        _chunks: &[rag_arena::core::EmbeddedChunk],
    ) -> Result<(), StorageError> {
        Ok(())
    }
    fn load_chunks(&self) -> Result<Vec<rag_arena::core::EmbeddedChunk>, StorageError> {
        Ok(Vec::new())
    }
    fn delete_document(&self, _document_id: &str) -> Result<usize, StorageError> {
        Ok(0)
    }
}

#[tokio::test]
async fn persistence_failure_flags_but_returns_results() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    let llm = Arc::new(FakeLlm::new().with_default("Paris."));
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let storage = WriteFailStorage {
        session: Session {
            id: 1,
            title: "s".to_string(),
            created_at: 0,
            updated_at: 0,
        },
    };
    let report = dispatcher
        .run(
            &storage,
            &request(
                1,
                "What is the capital of France?",
                &["baseline"],
                serde_json::json!({ "top_k": 2 }),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    assert!(report.persistence_failed);
    assert!(report.record_ids.is_empty());
    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].is_success());
}

#[tokio::test]
async fn decompose_deduplicates_across_subqueries() {
    let embedder = Arc::new(paris_embedder());
    let index = Arc::new(build_index(&*embedder, paris_chunks()).await);
    // Both sub-queries hit the same France cluster, so the union must
    // dedup by chunk id.
    let llm = Arc::new(
        FakeLlm::new()
            .rule(
                "Decompose the user's question",
                "What is the capital of France?\nWhich river runs through Paris?",
            )
            .with_default("Paris, on the Seine."),
    );
    let dispatcher = FanoutDispatcher::new(caps(index, llm, embedder));

    let (storage, session) = storage_with_session();
    let report = dispatcher
        .run(
            &storage,
            &request(
                session.id,
                "Tell me about the capital of France and its river.",
                &["query_transform"],
                serde_json::json!({ "top_k": 3, "transformation_type": "decompose" }),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    let result = &report.results[0];
    assert!(result.is_success());
    let ids: Vec<&str> = result
        .retrieved_chunks
        .iter()
        .map(|c| c.chunk_id.as_str())
        .collect();
    let unique: std::collections::BTreeSet<&str> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len(), "duplicate chunk ids in final context");
    assert!(
        result
            .trace
            .iter()
            .any(|e| e.step == "transform_decompose")
    );
}
