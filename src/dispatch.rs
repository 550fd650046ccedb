//! Fan-out dispatcher for techniques-per-query.
//!
//! Runs the selected techniques concurrently under a bounded semaphore,
//! isolates their failures, enforces the per-technique timeout, and
//! persists one QA record per result in a single transaction. Output
//! order always equals the input `technique_names` order regardless of
//! finish order.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::{RagConfig, TechniqueResult};
use crate::client::DocumentFilter;
use crate::error::{ErrorKind, RequestError};
use crate::storage::Storage;
use crate::technique::{
    Capabilities, RunContext, TechniqueRegistry, execute, interrupted_result,
};

/// Queries longer than this are rejected at entry.
const MAX_QUERY_LEN: usize = 10_000;

/// One fan-out request: a query to run through several techniques.
#[derive(Debug, Clone)]
pub struct FanoutRequest {
    /// Session the QA records will be linked to.
    pub session_id: i64,
    /// The user query.
    pub query: String,
    /// Document scope; empty means the whole corpus.
    pub document_ids: Vec<String>,
    /// Techniques to run, in the order results must be returned.
    pub technique_names: Vec<String>,
    /// Per-query configuration.
    pub config: RagConfig,
}

/// The outcome of one fan-out, with persistence status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FanoutReport {
    /// One result per requested technique, in request order.
    pub results: Vec<TechniqueResult>,
    /// Row ids of the persisted QA records, parallel to `results`.
    /// Empty when persistence failed.
    pub record_ids: Vec<i64>,
    /// Set when the batch write failed; the results are still valid.
    pub persistence_failed: bool,
}

impl FanoutReport {
    /// Exit taxonomy for the run command: 0 all succeeded, 1 at least
    /// one technique failed but the request completed.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.results.iter().all(TechniqueResult::is_success))
    }
}

/// Bounded-concurrency executor for one query across many techniques.
pub struct FanoutDispatcher {
    caps: Capabilities,
}

impl FanoutDispatcher {
    /// Creates a dispatcher over the shared capability set.
    #[must_use]
    pub const fn new(caps: Capabilities) -> Self {
        Self { caps }
    }

    /// Runs every requested technique and persists the results.
    ///
    /// Technique failures never surface as errors here; they come back
    /// as results with `error_kind` set. Only request-level problems
    /// (unknown technique, missing session, invalid query) are returned
    /// as [`RequestError`].
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when the request is rejected at entry.
    #[allow(clippy::future_not_send)]
    pub async fn run(
        &self,
        storage: &dyn Storage,
        request: &FanoutRequest,
        cancel: &CancellationToken,
    ) -> Result<FanoutReport, RequestError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(RequestError::EmptyQuery);
        }
        if query.len() > MAX_QUERY_LEN {
            return Err(RequestError::QueryTooLong {
                len: query.len(),
                max: MAX_QUERY_LEN,
            });
        }

        // Reject unknown techniques before any work starts.
        if let Some(unknown) = request
            .technique_names
            .iter()
            .find(|name| !TechniqueRegistry::contains(name.as_str()))
        {
            return Err(RequestError::UnknownTechnique {
                name: unknown.clone(),
            });
        }

        storage
            .get_session(request.session_id)?
            .ok_or(RequestError::SessionNotFound {
                id: request.session_id,
            })?;

        let results = self.fan_out(query, request, cancel).await;

        // One transaction covers the whole batch; on failure the caller
        // still gets the results, flagged.
        let (record_ids, persistence_failed) =
            match storage.insert_qa_batch(request.session_id, query, &results) {
                Ok(ids) => (ids, false),
                Err(err) => {
                    tracing::error!(error = %err, "failed to persist fan-out results");
                    (Vec::new(), true)
                }
            };

        Ok(FanoutReport {
            results,
            record_ids,
            persistence_failed,
        })
    }

    /// Spawns one task per technique under the concurrency bound and
    /// collects results in request order.
    async fn fan_out(
        &self,
        query: &str,
        request: &FanoutRequest,
        cancel: &CancellationToken,
    ) -> Vec<TechniqueResult> {
        let config = &request.config;
        let semaphore = Arc::new(Semaphore::new(config.concurrency()));
        let timeout = config.technique_timeout();
        let top_k = config.top_k;
        let filter = if request.document_ids.is_empty() {
            DocumentFilter::all()
        } else {
            DocumentFilter::documents(request.document_ids.iter().cloned())
        };

        let mut handles = Vec::with_capacity(request.technique_names.len());

        for name in &request.technique_names {
            // Validated above; an unknown name here is unreachable, but
            // fold it into a per-result failure rather than panicking.
            let technique = match TechniqueRegistry::construct(name, &self.caps, config) {
                Ok(technique) => technique,
                Err(_) => {
                    handles.push(SlotHandle::Rejected(name.clone()));
                    continue;
                }
            };

            let cx = Arc::new(RunContext::new(filter.clone(), cancel.child_token()));
            let sem = Arc::clone(&semaphore);
            let query = query.to_string();
            let cx_task = Arc::clone(&cx);

            let handle = tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    // Semaphore closed: the request is being torn down.
                    return interrupted_result(
                        technique.name(),
                        &cx_task,
                        ErrorKind::Canceled,
                        Instant::now(),
                    );
                };

                let started = Instant::now();
                match tokio::time::timeout(timeout, execute(&*technique, &query, top_k, &cx_task))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        // Partial trace survives via the shared context.
                        interrupted_result(
                            technique.name(),
                            &cx_task,
                            ErrorKind::Timeout,
                            started,
                        )
                    }
                }
            });

            handles.push(SlotHandle::Running {
                name: name.clone(),
                cx,
                handle,
            });
        }

        // Await in request order; finish order is irrelevant.
        let mut results = Vec::with_capacity(handles.len());
        for slot in handles {
            match slot {
                SlotHandle::Rejected(name) => {
                    results.push(unknown_result(&name));
                }
                SlotHandle::Running { name, cx, handle } => match handle.await {
                    Ok(result) => results.push(result),
                    Err(join_err) => {
                        // A panicking worker is itself a bug to be logged.
                        tracing::error!(technique = %name, error = %join_err, "technique task died");
                        results.push(interrupted_result(
                            &name,
                            &cx,
                            ErrorKind::InternalError,
                            Instant::now(),
                        ));
                    }
                },
            }
        }
        results
    }
}

impl std::fmt::Debug for FanoutDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutDispatcher")
            .field("caps", &self.caps)
            .finish()
    }
}

enum SlotHandle {
    Rejected(String),
    Running {
        name: String,
        cx: Arc<RunContext>,
        handle: tokio::task::JoinHandle<TechniqueResult>,
    },
}

fn unknown_result(name: &str) -> TechniqueResult {
    TechniqueResult {
        technique: name.to_string(),
        answer: String::new(),
        retrieved_chunks: Vec::new(),
        trace: Vec::new(),
        retrieval_time: std::time::Duration::ZERO,
        generation_time: std::time::Duration::ZERO,
        total_time: std::time::Duration::ZERO,
        error_kind: Some(ErrorKind::UnknownTechnique),
    }
}
