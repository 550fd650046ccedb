//! Evaluation dispatcher: batch scoring under bounded concurrency.
//!
//! Loads the requested QA records, runs the two evaluator tracks per
//! record (each independent; one failing never fails the other), and
//! persists every successful evaluation per-record-atomically. The
//! reference track is served by the isolated worker pool; this
//! dispatcher's semaphore matches that pool's size.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::core::{EvalConfig, EvaluationScore, QaRecord, ScoreType, unix_now};
use crate::error::{ErrorKind, StorageError};
use crate::storage::Storage;

use super::{DimensionalJudge, EvalInput, ReferenceEvaluator};

/// Scores and status for one evaluated QA record.
#[derive(Debug, serde::Serialize)]
pub struct EvalOutcome {
    /// The evaluated record.
    pub qa_record_id: i64,
    /// Evaluations produced for this record (0, 1, or 2 rows).
    pub scores: Vec<EvaluationScore>,
    /// Set when a whole track failed for this record.
    pub error_kind: Option<ErrorKind>,
    /// Human-readable failure notes, parallel to `error_kind`.
    pub errors: Vec<String>,
}

/// Bounded-concurrency executor for evaluating QA record batches.
pub struct EvalDispatcher {
    judge: Arc<DimensionalJudge>,
    reference: Arc<ReferenceEvaluator>,
    config: EvalConfig,
}

impl EvalDispatcher {
    /// Creates a dispatcher over the two evaluator tracks.
    #[must_use]
    pub const fn new(
        judge: Arc<DimensionalJudge>,
        reference: Arc<ReferenceEvaluator>,
        config: EvalConfig,
    ) -> Self {
        Self {
            judge,
            reference,
            config,
        }
    }

    /// Evaluates a batch of persisted QA records.
    ///
    /// No cross-record ordering is guaranteed beyond the returned list
    /// mirroring `qa_record_ids`. Records that cannot be loaded get an
    /// outcome with `error_kind` set rather than failing the batch.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] only for persistence-layer failures
    /// while writing results; evaluation failures stay per-record.
    #[allow(clippy::future_not_send)]
    pub async fn evaluate_batch(
        &self,
        storage: &dyn Storage,
        qa_record_ids: &[i64],
        reference_answers: &BTreeMap<i64, String>,
    ) -> Result<Vec<EvalOutcome>, StorageError> {
        // rusqlite handles are thread-bound: load everything up front,
        // evaluate concurrently, persist at the end on this thread.
        let mut loaded: Vec<(i64, Option<QaRecord>)> = Vec::with_capacity(qa_record_ids.len());
        for &id in qa_record_ids {
            loaded.push((id, storage.get_qa_record(id)?));
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency()));
        let mut handles = Vec::with_capacity(loaded.len());

        for (id, record) in loaded {
            let Some(record) = record else {
                handles.push(TaskSlot::Missing(id));
                continue;
            };
            let input = EvalInput::from_record(&record, reference_answers.get(&id).cloned());
            let judge = Arc::clone(&self.judge);
            let reference = Arc::clone(&self.reference);
            let sem = Arc::clone(&semaphore);
            let use_llm = self.config.use_llm;
            let use_reference = self.config.use_reference;

            handles.push(TaskSlot::Running(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return EvalOutcome {
                        qa_record_id: id,
                        scores: Vec::new(),
                        error_kind: Some(ErrorKind::EvaluatorFailed),
                        errors: vec!["evaluation pool shut down".to_string()],
                    };
                };

                let mut scores = Vec::new();
                let mut errors = Vec::new();

                if use_llm {
                    // The judge absorbs its own per-dimension failures.
                    scores.push(judge.evaluate(id, &input).await);
                }

                if use_reference {
                    match reference.evaluate(input.clone()).await {
                        Ok(metrics) => scores.push(reference_score(id, &metrics)),
                        Err(err) => {
                            tracing::warn!(qa_record_id = id, error = %err, "reference track failed");
                            errors.push(err.to_string());
                        }
                    }
                }

                EvalOutcome {
                    qa_record_id: id,
                    scores,
                    error_kind: if errors.is_empty() {
                        None
                    } else {
                        Some(ErrorKind::EvaluatorFailed)
                    },
                    errors,
                }
            })));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for slot in handles {
            match slot {
                TaskSlot::Missing(id) => outcomes.push(EvalOutcome {
                    qa_record_id: id,
                    scores: Vec::new(),
                    error_kind: Some(ErrorKind::EvaluatorFailed),
                    errors: vec!["QA record not found".to_string()],
                }),
                TaskSlot::Running(handle) => match handle.await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(join_err) => {
                        tracing::error!(error = %join_err, "evaluation task died");
                        outcomes.push(EvalOutcome {
                            qa_record_id: 0,
                            scores: Vec::new(),
                            error_kind: Some(ErrorKind::InternalError),
                            errors: vec![join_err.to_string()],
                        });
                    }
                },
            }
        }

        // Per-record-atomic persistence; a failed write flags only its
        // own record.
        for outcome in &mut outcomes {
            let mut persisted = Vec::with_capacity(outcome.scores.len());
            for score in outcome.scores.drain(..) {
                match storage.insert_evaluation(&score) {
                    Ok(id) => persisted.push(EvaluationScore { id, ..score }),
                    Err(err) => {
                        tracing::error!(
                            qa_record_id = outcome.qa_record_id,
                            error = %err,
                            "failed to persist evaluation"
                        );
                        outcome.error_kind = Some(ErrorKind::PersistenceFailed);
                        outcome.errors.push(err.to_string());
                        persisted.push(score);
                    }
                }
            }
            outcome.scores = persisted;
        }

        Ok(outcomes)
    }
}

impl std::fmt::Debug for EvalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum TaskSlot {
    Missing(i64),
    Running(tokio::task::JoinHandle<EvalOutcome>),
}

/// Wraps reference metrics into an evaluation row. The fixed dimensional
/// columns stay empty; the metrics ride in `metadata.reference_scores`.
fn reference_score(qa_record_id: i64, metrics: &BTreeMap<String, f64>) -> EvaluationScore {
    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "reference_scores".to_string(),
        serde_json::json!(metrics),
    );

    EvaluationScore {
        id: 0,
        qa_record_id,
        score_type: ScoreType::ReferenceMetric,
        evaluator: "reference_metrics".to_string(),
        dimensions: BTreeMap::new(),
        overall: None,
        metadata,
        created_at: unix_now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_score_metadata_layout() {
        let mut metrics = BTreeMap::new();
        metrics.insert("faithfulness".to_string(), 0.8);
        metrics.insert("answer_relevancy".to_string(), 0.9);
        let score = reference_score(7, &metrics);

        assert_eq!(score.qa_record_id, 7);
        assert_eq!(score.score_type, ScoreType::ReferenceMetric);
        let reference_scores = &score.metadata["reference_scores"];
        assert!(
            (reference_scores["faithfulness"].as_f64().unwrap_or(0.0) - 0.8).abs() < f64::EPSILON
        );
        assert!(
            (reference_scores["answer_relevancy"].as_f64().unwrap_or(0.0) - 0.9).abs()
                < f64::EPSILON
        );
    }
}
