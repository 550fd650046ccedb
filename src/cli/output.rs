//! CLI output formatting.
//!
//! Every command renders either a human-readable text block or the
//! equivalent JSON document, selected by `--format`.

use std::fmt::Write;

use crate::core::{QaRecord, Session};
use crate::dispatch::FanoutReport;
use crate::eval::EvalOutcome;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Machine-readable JSON.
    Json,
}

impl OutputFormat {
    /// Parses the `--format` flag; anything unrecognized is text.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Renders a fan-out report.
#[must_use]
pub fn format_report(report: &FanoutReport, query: &str, format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return serde_json::to_string_pretty(report).unwrap_or_default();
    }

    let mut out = String::new();
    let _ = writeln!(out, "Query: {query}");
    if report.persistence_failed {
        let _ = writeln!(out, "WARNING: persistence failed; results not recorded");
    }
    for (i, result) in report.results.iter().enumerate() {
        let _ = writeln!(out, "\n=== {} ===", result.technique);
        match result.error_kind {
            Some(kind) => {
                let _ = writeln!(out, "Status: failed ({kind})");
            }
            None => {
                let _ = writeln!(out, "Answer: {}", result.answer);
            }
        }
        let _ = writeln!(
            out,
            "Chunks: {}  |  retrieval {:.0} ms, generation {:.0} ms, total {:.0} ms",
            result.retrieved_chunks.len(),
            result.retrieval_time.as_secs_f64() * 1000.0,
            result.generation_time.as_secs_f64() * 1000.0,
            result.total_time.as_secs_f64() * 1000.0,
        );
        if let Some(&record_id) = report.record_ids.get(i) {
            let _ = writeln!(out, "Record: #{record_id}");
        }
    }
    out
}

/// Renders the session list.
#[must_use]
pub fn format_sessions(sessions: &[Session], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return serde_json::to_string_pretty(sessions).unwrap_or_default();
    }

    if sessions.is_empty() {
        return "No sessions.".to_string();
    }
    let mut out = String::new();
    for session in sessions {
        let _ = writeln!(
            out,
            "#{}  {}  (updated {})",
            session.id, session.title, session.updated_at
        );
    }
    out
}

/// Renders a session's QA records.
#[must_use]
pub fn format_records(records: &[QaRecord], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return serde_json::to_string_pretty(records).unwrap_or_default();
    }

    if records.is_empty() {
        return "No QA records.".to_string();
    }
    let mut out = String::new();
    for record in records {
        let status = record
            .result
            .error_kind
            .map_or_else(|| "ok".to_string(), |kind| kind.to_string());
        let _ = writeln!(
            out,
            "#{}  [{}]  {}  ({} chunks, {status})",
            record.id,
            record.result.technique,
            crate::core::trace::preview(&record.query, 60),
            record.result.retrieved_chunks.len(),
        );
    }
    out
}

/// Renders evaluation outcomes.
#[must_use]
pub fn format_eval_outcomes(outcomes: &[EvalOutcome], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return serde_json::to_string_pretty(outcomes).unwrap_or_default();
    }

    let mut out = String::new();
    for outcome in outcomes {
        let _ = writeln!(out, "Record #{}:", outcome.qa_record_id);
        for score in &outcome.scores {
            let _ = writeln!(
                out,
                "  {} ({}): overall {}",
                score.score_type,
                score.evaluator,
                score
                    .overall
                    .map_or_else(|| "-".to_string(), |v| format!("{v:.2}")),
            );
            for (dimension, value) in &score.dimensions {
                let _ = writeln!(out, "    {dimension}: {value:.2}");
            }
            if let Some(reference_scores) = score
                .metadata
                .get("reference_scores")
                .and_then(|v| v.as_object())
            {
                for (metric, value) in reference_scores {
                    let _ = writeln!(
                        out,
                        "    {metric}: {:.3}",
                        value.as_f64().unwrap_or(0.0)
                    );
                }
            }
        }
        for error in &outcome.errors {
            let _ = writeln!(out, "  error: {error}");
        }
    }
    out
}

/// Renders the status summary.
#[must_use]
pub fn format_status(
    sessions: usize,
    chunks: usize,
    documents: usize,
    format: OutputFormat,
) -> String {
    if format == OutputFormat::Json {
        return serde_json::to_string_pretty(&serde_json::json!({
            "sessions": sessions,
            "chunks": chunks,
            "documents": documents,
        }))
        .unwrap_or_default();
    }
    format!("Sessions: {sessions}\nChunks: {chunks} (across {documents} documents)")
}
