//! Reference-metric evaluator with an isolated worker pool.
//!
//! Implements Ragas-style metrics on [0, 1]: `faithfulness` (fraction of
//! atomic answer claims supported by the contexts) and `answer_relevancy`
//! (mean cosine similarity between the query and back-questions derived
//! from the answer). `context_precision` and `context_recall` run only
//! when a reference answer is supplied; their absence is normal.
//!
//! # Isolation
//!
//! The metric stack assumes exclusive control of its scheduler, so each
//! evaluation runs on a dedicated worker thread that owns a private
//! current-thread runtime, reused across calls. A naive inline call on
//! the host runtime would corrupt its event dispatch under load. Each
//! worker serializes its own jobs; the pool is sized by the caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::client::{CompletionRequest, EmbeddingClient, LlmClient};
use crate::error::EvalError;
use crate::search::cosine_similarity;

use super::EvalInput;

/// Number of back-questions generated for answer relevancy.
const NUM_BACK_QUESTIONS: usize = 3;
/// Cap on extracted claims per answer.
const MAX_CLAIMS: usize = 20;

const CLAIM_EXTRACT_SYSTEM_PROMPT: &str = "Break the given text into its atomic factual claims. \
Output one claim per line, nothing else. Skip greetings and hedges.";

const CLAIM_VERDICT_SYSTEM_PROMPT: &str = "For each numbered claim, decide whether it is supported by the context \
passages. Output one line per claim: the claim number, then 'yes' or 'no'.";

const BACK_QUESTION_SYSTEM_PROMPT: &str = "Write questions that the given answer would directly answer. \
Output one question per line, nothing else.";

const CONTEXT_PRECISION_SYSTEM_PROMPT: &str = "Decide whether the passage is useful for arriving at the reference \
answer. Output only 'yes' or 'no'.";

/// A job submitted to one isolated worker.
struct Job {
    input: EvalInput,
    reply: oneshot::Sender<Result<BTreeMap<String, f64>, EvalError>>,
}

/// Reference-metric evaluator backed by a pool of isolated workers.
///
/// Process-scoped and reused across requests; submissions round-robin
/// over the pool.
pub struct ReferenceEvaluator {
    senders: Vec<mpsc::Sender<Job>>,
    next: AtomicUsize,
}

impl ReferenceEvaluator {
    /// Spawns `pool_size` workers, each owning a private current-thread
    /// runtime and enforcing `timeout` per evaluation.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
        pool_size: usize,
        timeout: Duration,
    ) -> Self {
        let pool_size = pool_size.max(1);
        let mut senders = Vec::with_capacity(pool_size);

        for worker_id in 0..pool_size {
            let (tx, rx) = mpsc::channel::<Job>();
            let llm = Arc::clone(&llm);
            let embedder = Arc::clone(&embedder);

            let spawned = std::thread::Builder::new()
                .name(format!("ref-eval-{worker_id}"))
                .spawn(move || worker_loop(&rx, &*llm, &*embedder, timeout));
            if spawned.is_ok() {
                senders.push(tx);
            }
        }

        Self {
            senders,
            next: AtomicUsize::new(0),
        }
    }

    /// Evaluates one record on an isolated worker.
    ///
    /// The host task only awaits a oneshot; the metric work never runs
    /// on the host scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::WorkerGone`] when the pool is unavailable,
    /// [`EvalError::Timeout`] when the per-evaluation budget passes, or
    /// the metric computation's own failure.
    pub async fn evaluate(&self, input: EvalInput) -> Result<BTreeMap<String, f64>, EvalError> {
        if self.senders.is_empty() {
            return Err(EvalError::WorkerGone);
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.senders[slot]
            .send(Job {
                input,
                reply: reply_tx,
            })
            .map_err(|_| EvalError::WorkerGone)?;

        reply_rx.await.map_err(|_| EvalError::WorkerGone)?
    }
}

impl std::fmt::Debug for ReferenceEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceEvaluator")
            .field("pool_size", &self.senders.len())
            .finish_non_exhaustive()
    }
}

/// One worker: a private runtime draining its own job queue.
fn worker_loop(
    rx: &mpsc::Receiver<Job>,
    llm: &dyn LlmClient,
    embedder: &dyn EmbeddingClient,
    timeout: Duration,
) {
    let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    else {
        tracing::error!("reference evaluation worker failed to build its runtime");
        return;
    };

    while let Ok(job) = rx.recv() {
        let result = runtime.block_on(async {
            match tokio::time::timeout(timeout, compute_metrics(llm, embedder, &job.input)).await {
                Ok(result) => result,
                Err(_) => Err(EvalError::Timeout {
                    seconds: timeout.as_secs(),
                }),
            }
        });
        // The caller may have given up; a dead oneshot is fine.
        let _ = job.reply.send(result);
    }
}

/// Computes every applicable metric for one input.
async fn compute_metrics(
    llm: &dyn LlmClient,
    embedder: &dyn EmbeddingClient,
    input: &EvalInput,
) -> Result<BTreeMap<String, f64>, EvalError> {
    let mut metrics = BTreeMap::new();

    if !input.contexts.is_empty() {
        if let Some(score) = faithfulness(llm, input).await? {
            metrics.insert("faithfulness".to_string(), score);
        }
    }

    if let Some(score) = answer_relevancy(llm, embedder, input).await? {
        metrics.insert("answer_relevancy".to_string(), score);
    }

    // The precision/recall pair needs ground truth; skipping is normal.
    if let Some(reference) = input.reference_answer.as_deref()
        && !input.contexts.is_empty()
    {
        if let Some(score) = context_precision(llm, input, reference).await? {
            metrics.insert("context_precision".to_string(), score);
        }
        if let Some(score) = context_recall(llm, input, reference).await? {
            metrics.insert("context_recall".to_string(), score);
        }
    }

    Ok(metrics)
}

/// Fraction of atomic answer claims supported by the contexts.
/// `None` when the answer yields no claims to judge.
async fn faithfulness(llm: &dyn LlmClient, input: &EvalInput) -> Result<Option<f64>, EvalError> {
    let claims = extract_claims(llm, &input.answer).await?;
    if claims.is_empty() {
        return Ok(None);
    }
    let supported = judge_claims(llm, &claims, &input.context_block()).await?;
    Ok(Some(supported as f64 / claims.len() as f64))
}

/// Mean cosine similarity between the query and generated back-questions.
async fn answer_relevancy(
    llm: &dyn LlmClient,
    embedder: &dyn EmbeddingClient,
    input: &EvalInput,
) -> Result<Option<f64>, EvalError> {
    let request = CompletionRequest::new(
        BACK_QUESTION_SYSTEM_PROMPT,
        format!(
            "Write {NUM_BACK_QUESTIONS} questions.\n\nAnswer:\n{}",
            input.answer
        ),
    )
    .with_max_tokens(256);
    let text = llm.complete(&request).await?.text;

    let questions: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(NUM_BACK_QUESTIONS)
        .map(str::to_string)
        .collect();
    if questions.is_empty() {
        return Ok(None);
    }

    let mut texts = vec![input.query.clone()];
    texts.extend(questions);
    let vectors = embedder.embed(&texts).await?;
    let Some((query_vector, question_vectors)) = vectors.split_first() else {
        return Ok(None);
    };
    if question_vectors.is_empty() {
        return Ok(None);
    }

    let mean = question_vectors
        .iter()
        .map(|v| cosine_similarity(query_vector, v).clamp(0.0, 1.0))
        .sum::<f64>()
        / question_vectors.len() as f64;
    Ok(Some(mean))
}

/// Fraction of contexts judged useful for reaching the reference answer.
async fn context_precision(
    llm: &dyn LlmClient,
    input: &EvalInput,
    reference: &str,
) -> Result<Option<f64>, EvalError> {
    let mut useful = 0usize;
    for context in &input.contexts {
        let request = CompletionRequest::new(
            CONTEXT_PRECISION_SYSTEM_PROMPT,
            format!("Reference answer:\n{reference}\n\nPassage:\n{context}\n\nUseful:"),
        )
        .with_max_tokens(4);
        let verdict = llm.complete(&request).await?.text;
        if verdict.trim().to_lowercase().starts_with('y') {
            useful += 1;
        }
    }
    Ok(Some(useful as f64 / input.contexts.len() as f64))
}

/// Fraction of reference-answer claims attributable to the contexts.
async fn context_recall(
    llm: &dyn LlmClient,
    input: &EvalInput,
    reference: &str,
) -> Result<Option<f64>, EvalError> {
    let claims = extract_claims(llm, reference).await?;
    if claims.is_empty() {
        return Ok(None);
    }
    let supported = judge_claims(llm, &claims, &input.context_block()).await?;
    Ok(Some(supported as f64 / claims.len() as f64))
}

/// Splits a text into atomic claims via the LLM.
async fn extract_claims(llm: &dyn LlmClient, text: &str) -> Result<Vec<String>, EvalError> {
    let request =
        CompletionRequest::new(CLAIM_EXTRACT_SYSTEM_PROMPT, text).with_max_tokens(512);
    let output = llm.complete(&request).await?.text;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MAX_CLAIMS)
        .map(str::to_string)
        .collect())
}

/// Counts how many claims the verdict call marks supported.
async fn judge_claims(
    llm: &dyn LlmClient,
    claims: &[String],
    context_block: &str,
) -> Result<usize, EvalError> {
    use std::fmt::Write;
    let mut user = format!("Context passages:\n{context_block}\nClaims:\n");
    for (i, claim) in claims.iter().enumerate() {
        let _ = writeln!(user, "{}. {claim}", i + 1);
    }
    let request = CompletionRequest::new(CLAIM_VERDICT_SYSTEM_PROMPT, user).with_max_tokens(256);
    let output = llm.complete(&request).await?.text;

    let verdicts: Vec<bool> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_lowercase().contains("yes"))
        .collect();
    if verdicts.is_empty() {
        let preview: String = output.chars().take(120).collect();
        return Err(EvalError::Parse {
            message: format!("no verdict lines in claim judgment (output preview: {preview:?})"),
        });
    }
    Ok(verdicts.iter().filter(|&&supported| supported).count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_question_count_constant() {
        assert_eq!(NUM_BACK_QUESTIONS, 3);
    }
}
