//! Evaluator pipeline tests: dimensional judge behavior, reference
//! metric computation on isolated workers, and batch dispatch.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rag_arena::core::ScoreType;
use rag_arena::error::{ErrorKind, EvalError};
use rag_arena::eval::{DimensionalJudge, EvalDispatcher, EvalInput, ReferenceEvaluator};
use rag_arena::core::EvalConfig;
use rag_arena::storage::{SqliteStorage, Storage};

use common::{FakeLlm, KeywordEmbedder};

fn grounded_input() -> EvalInput {
    EvalInput {
        query: "What is the capital of France?".to_string(),
        answer: "The capital of France is Paris.".to_string(),
        contexts: vec!["Paris is the capital of France.".to_string()],
        reference_answer: None,
    }
}

fn judge_llm() -> FakeLlm {
    FakeLlm::new().rule("strict evaluator", "8 - solid answer grounded in the context.")
}

#[tokio::test]
async fn judge_scores_all_dimensions_with_context() {
    let judge = DimensionalJudge::new(Arc::new(judge_llm()), "test-judge");
    let score = judge.evaluate(1, &grounded_input()).await;

    assert_eq!(score.score_type, ScoreType::LlmDimensional);
    assert_eq!(score.dimensions.len(), 5);
    for dimension in rag_arena::eval::DIMENSIONS {
        assert!((score.dimensions[dimension] - 8.0).abs() < f64::EPSILON);
    }
    assert_eq!(score.overall, Some(8.0));
    let feedback = score.metadata["feedback"].as_str().unwrap_or_default();
    assert!(feedback.contains("relevance"));
}

#[tokio::test]
async fn judge_skips_faithfulness_without_context() {
    let judge = DimensionalJudge::new(Arc::new(judge_llm()), "test-judge");
    let input = EvalInput {
        contexts: Vec::new(),
        ..grounded_input()
    };
    let score = judge.evaluate(1, &input).await;

    assert_eq!(score.dimensions.len(), 4);
    assert!(!score.dimensions.contains_key("faithfulness"));
    // The mean covers only the present dimensions.
    assert_eq!(score.overall, Some(8.0));
}

#[tokio::test]
async fn judge_records_zero_on_unparseable_output() {
    let llm = FakeLlm::new().rule("strict evaluator", "no number here at all");
    let judge = DimensionalJudge::new(Arc::new(llm), "test-judge");
    let score = judge.evaluate(1, &grounded_input()).await;

    assert!(score.dimensions.values().all(|&v| v.abs() < f64::EPSILON));
    assert!(score.metadata.contains_key("failures"));
}

#[tokio::test]
async fn judge_tolerates_prose_around_score() {
    let llm = FakeLlm::new().rule("strict evaluator", "I would rate this 7/10 overall.");
    let judge = DimensionalJudge::new(Arc::new(llm), "test-judge");
    let score = judge.evaluate(1, &grounded_input()).await;
    assert!((score.dimensions["relevance"] - 7.0).abs() < f64::EPSILON);
}

fn reference_llm() -> FakeLlm {
    FakeLlm::new()
        .rule(
            "atomic factual claims",
            "Paris is the capital of France.\nParis is in France.",
        )
        .rule("decide whether it is supported", "1. yes\n2. yes")
        .rule(
            "questions that the given answer",
            "What is the capital of France?\nWhich city is France's capital?\nWhere is Paris?",
        )
        .rule("useful for arriving at the reference", "yes")
}

fn reference_embedder() -> KeywordEmbedder {
    KeywordEmbedder::new(&[&["paris", "france", "capital"], &["unrelated"]])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reference_metrics_computed_on_isolated_worker() {
    let evaluator = ReferenceEvaluator::new(
        Arc::new(reference_llm()),
        Arc::new(reference_embedder()),
        1,
        Duration::from_secs(5),
    );

    let metrics = evaluator
        .evaluate(grounded_input())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert!((metrics["faithfulness"] - 1.0).abs() < f64::EPSILON);
    let relevancy = metrics["answer_relevancy"];
    assert!(relevancy > 0.5, "expected high relevancy, got {relevancy}");
    // No reference answer: precision/recall are absent, not errors.
    assert!(!metrics.contains_key("context_precision"));
    assert!(!metrics.contains_key("context_recall"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reference_metrics_with_ground_truth() {
    let evaluator = ReferenceEvaluator::new(
        Arc::new(reference_llm()),
        Arc::new(reference_embedder()),
        1,
        Duration::from_secs(5),
    );

    let input = EvalInput {
        reference_answer: Some("Paris.".to_string()),
        ..grounded_input()
    };
    let metrics = evaluator
        .evaluate(input)
        .await
        .unwrap_or_else(|_| unreachable!());

    assert!((metrics["context_precision"] - 1.0).abs() < f64::EPSILON);
    assert!(metrics.contains_key("context_recall"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reference_worker_times_out() {
    let llm = FakeLlm::new().rule_delayed(
        "atomic factual claims",
        "claim",
        Duration::from_secs(10),
    );
    let evaluator = ReferenceEvaluator::new(
        Arc::new(llm),
        Arc::new(reference_embedder()),
        1,
        Duration::from_millis(100),
    );

    let result = evaluator.evaluate(grounded_input()).await;
    assert!(matches!(result, Err(EvalError::Timeout { .. })));
}

/// Scenario F analogue: saturate the worker pool while the host runtime
/// keeps making progress; nothing deadlocks.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_runtime_stays_live_while_workers_saturated() {
    let llm = FakeLlm::new()
        .rule_delayed(
            "atomic factual claims",
            "Paris is the capital of France.",
            Duration::from_millis(30),
        )
        .rule("decide whether it is supported", "1. yes")
        .rule("questions that the given answer", "What is the capital?");
    let evaluator = Arc::new(ReferenceEvaluator::new(
        Arc::new(llm),
        Arc::new(reference_embedder()),
        2,
        Duration::from_secs(5),
    ));

    // A host-side heartbeat that must keep ticking throughout.
    let ticks = Arc::new(AtomicUsize::new(0));
    let heartbeat_ticks = Arc::clone(&ticks);
    let heartbeat = tokio::spawn(async move {
        for _ in 0..20 {
            heartbeat_ticks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let mut jobs = Vec::new();
    for _ in 0..10 {
        let evaluator = Arc::clone(&evaluator);
        jobs.push(tokio::spawn(async move {
            evaluator.evaluate(grounded_input()).await
        }));
    }

    for job in jobs {
        let result = job.await.unwrap_or_else(|_| unreachable!());
        assert!(result.is_ok());
    }
    heartbeat.await.unwrap_or_else(|_| unreachable!());
    assert_eq!(ticks.load(Ordering::SeqCst), 20);
}

fn seeded_storage() -> (SqliteStorage, Vec<i64>) {
    let storage = SqliteStorage::open_in_memory().unwrap_or_else(|_| unreachable!());
    let session = storage
        .create_session("eval")
        .unwrap_or_else(|_| unreachable!());

    let result = rag_arena::core::TechniqueResult {
        technique: "baseline".to_string(),
        answer: "The capital of France is Paris.".to_string(),
        retrieved_chunks: vec![rag_arena::core::RetrievedChunk {
            chunk_id: "doc1:0".to_string(),
            text: "Paris is the capital of France.".to_string(),
            metadata: BTreeMap::new(),
            score: 0.9,
            sub_scores: BTreeMap::new(),
        }],
        trace: Vec::new(),
        retrieval_time: Duration::from_millis(5),
        generation_time: Duration::from_millis(50),
        total_time: Duration::from_millis(60),
        error_kind: None,
    };
    let ids = storage
        .insert_qa_batch(
            session.id,
            "What is the capital of France?",
            &[result.clone(), result],
        )
        .unwrap_or_else(|_| unreachable!());
    (storage, ids)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatcher_runs_both_tracks_and_persists() {
    let (storage, ids) = seeded_storage();

    let judge = Arc::new(DimensionalJudge::new(
        Arc::new(judge_llm()),
        "test-judge",
    ));
    let config = EvalConfig::default();
    let reference = Arc::new(ReferenceEvaluator::new(
        Arc::new(reference_llm()),
        Arc::new(reference_embedder()),
        config.concurrency(),
        config.reference_timeout(),
    ));
    let dispatcher = EvalDispatcher::new(judge, reference, config);

    let outcomes = dispatcher
        .evaluate_batch(&storage, &ids, &BTreeMap::new())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert!(outcome.error_kind.is_none());
        assert_eq!(outcome.scores.len(), 2);
    }

    // Both rows landed per record, retrievable by (type, evaluator).
    let llm_row = storage
        .latest_evaluation(ids[0], ScoreType::LlmDimensional, "test-judge")
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(llm_row.dimensions.len(), 5);

    let reference_row = storage
        .latest_evaluation(ids[0], ScoreType::ReferenceMetric, "reference_metrics")
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    let reference_scores = reference_row.metadata["reference_scores"]
        .as_object()
        .unwrap_or_else(|| unreachable!());
    assert!(reference_scores.contains_key("faithfulness"));
    assert!(reference_scores.contains_key("answer_relevancy"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_failed_track_does_not_sink_the_other() {
    let (storage, ids) = seeded_storage();

    let judge = Arc::new(DimensionalJudge::new(
        Arc::new(judge_llm()),
        "test-judge",
    ));
    // The reference track's claim extraction always fails.
    let broken_reference_llm = FakeLlm::new().rule_fails("atomic factual claims");
    let config = EvalConfig::default();
    let reference = Arc::new(ReferenceEvaluator::new(
        Arc::new(broken_reference_llm),
        Arc::new(reference_embedder()),
        config.concurrency(),
        config.reference_timeout(),
    ));
    let dispatcher = EvalDispatcher::new(judge, reference, config);

    let outcomes = dispatcher
        .evaluate_batch(&storage, &[ids[0]], &BTreeMap::new())
        .await
        .unwrap_or_else(|_| unreachable!());

    let outcome = &outcomes[0];
    assert_eq!(outcome.error_kind, Some(ErrorKind::EvaluatorFailed));
    // The judge's row survived and was persisted.
    assert_eq!(outcome.scores.len(), 1);
    assert_eq!(outcome.scores[0].score_type, ScoreType::LlmDimensional);
    assert!(
        storage
            .latest_evaluation(ids[0], ScoreType::LlmDimensional, "test-judge")
            .unwrap_or_else(|_| unreachable!())
            .is_some()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeat_evaluation_keeps_history_latest_wins() {
    let (storage, ids) = seeded_storage();

    let judge = Arc::new(DimensionalJudge::new(
        Arc::new(judge_llm()),
        "test-judge",
    ));
    let config = EvalConfig {
        use_reference: false,
        ..EvalConfig::default()
    };
    let reference = Arc::new(ReferenceEvaluator::new(
        Arc::new(FakeLlm::new()),
        Arc::new(reference_embedder()),
        1,
        Duration::from_secs(1),
    ));
    let dispatcher = EvalDispatcher::new(judge, reference, config);

    for _ in 0..2 {
        dispatcher
            .evaluate_batch(&storage, &[ids[0]], &BTreeMap::new())
            .await
            .unwrap_or_else(|_| unreachable!());
    }

    let history = storage
        .list_evaluations(ids[0])
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(history.len(), 2);
    let latest = storage
        .latest_evaluation(ids[0], ScoreType::LlmDimensional, "test-judge")
        .unwrap_or_else(|_| unreachable!());
    assert!(latest.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_record_reported_per_record() {
    let (storage, ids) = seeded_storage();

    let judge = Arc::new(DimensionalJudge::new(
        Arc::new(judge_llm()),
        "test-judge",
    ));
    let config = EvalConfig {
        use_reference: false,
        ..EvalConfig::default()
    };
    let reference = Arc::new(ReferenceEvaluator::new(
        Arc::new(FakeLlm::new()),
        Arc::new(reference_embedder()),
        1,
        Duration::from_secs(1),
    ));
    let dispatcher = EvalDispatcher::new(judge, reference, config);

    let outcomes = dispatcher
        .evaluate_batch(&storage, &[ids[0], 9999], &BTreeMap::new())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].error_kind.is_none());
    assert_eq!(outcomes[1].qa_record_id, 9999);
    assert_eq!(outcomes[1].error_kind, Some(ErrorKind::EvaluatorFailed));
}
