//! Structured execution trace for technique runs.
//!
//! Each technique run owns one [`TraceRecorder`]. Events carry an
//! auto-incrementing sequence number and a monotonic timestamp relative
//! to recorder creation, so the sequence within one result is strictly
//! totally ordered. Recorders are single-writer per technique and never
//! shared across concurrent techniques; the dispatcher snapshots them
//! into per-result lists.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Soft cap on serialized trace size per run.
const TRACE_BUDGET_BYTES: usize = 64 * 1024;

/// Maximum message length stored per event.
const MAX_MESSAGE_LEN: usize = 300;

/// One structured step in a technique's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Monotonically increasing sequence number, starting at 0.
    pub seq: u64,
    /// Short stage identifier (e.g. `"retrieve_complete"`).
    pub step: String,
    /// Human-readable message.
    pub message: String,
    /// Structured details for the stage.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
    /// Milliseconds since the run started (monotonic).
    pub elapsed_ms: u64,
}

/// Appends ordered [`TraceEvent`]s during a technique run.
///
/// Interior mutability keeps the `log` call usable behind a shared
/// reference from async code; there is exactly one writer per run, so
/// the mutex is uncontended. Once the accumulated event size exceeds the
/// per-run budget, further events are dropped after a single
/// `trace_truncated` marker.
#[derive(Debug)]
pub struct TraceRecorder {
    started: Instant,
    seq: AtomicU64,
    bytes: AtomicUsize,
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceRecorder {
    /// Creates an empty recorder; the monotonic clock starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            seq: AtomicU64::new(0),
            bytes: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Appends an event with no structured details.
    pub fn log(&self, step: &str, message: impl Into<String>) {
        self.log_with(step, message, serde_json::Map::new());
    }

    /// Appends an event with structured details.
    ///
    /// `message` is truncated to a bounded length; events past the trace
    /// budget are dropped (a single `trace_truncated` marker is kept).
    pub fn log_with(
        &self,
        step: &str,
        message: impl Into<String>,
        details: serde_json::Map<String, serde_json::Value>,
    ) {
        let message = preview(&message.into(), MAX_MESSAGE_LEN);

        let cost = step.len()
            + message.len()
            + serde_json::to_string(&details).map_or(0, |s| s.len());
        let before = self.bytes.fetch_add(cost, Ordering::Relaxed);
        if before > TRACE_BUDGET_BYTES {
            // Budget exhausted. Record the marker exactly once.
            if before.saturating_sub(cost) <= TRACE_BUDGET_BYTES {
                self.push(TraceEvent {
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                    step: "trace_truncated".to_string(),
                    message: "trace budget exhausted; later events dropped".to_string(),
                    details: serde_json::Map::new(),
                    elapsed_ms: self.elapsed_ms(),
                });
            }
            return;
        }

        self.push(TraceEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            step: step.to_string(),
            message,
            details,
            elapsed_ms: self.elapsed_ms(),
        });
    }

    fn push(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Number of events recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().map_or(0, |events| events.len())
    }

    /// Whether no events were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clones the ordered event list recorded so far.
    ///
    /// Used by the dispatcher to preserve partial traces on timeout and
    /// cancellation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().map_or_else(|_| Vec::new(), |e| e.clone())
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates `text` to at most `max` characters on a char boundary,
/// appending an ellipsis marker when anything was cut.
#[must_use]
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}\u{2026}")
}

/// Rounds a score to 4 decimal places for trace output.
#[must_use]
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_starts_at_zero_and_is_strict() {
        let recorder = TraceRecorder::new();
        recorder.log("init", "start");
        recorder.log("retrieve_prepare", "searching");
        recorder.log("retrieve_complete", "done");

        let events = recorder.snapshot();
        assert_eq!(events.len(), 3);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64);
        }
    }

    #[test]
    fn test_details_preserved() {
        let recorder = TraceRecorder::new();
        let mut details = serde_json::Map::new();
        details.insert("result_count".to_string(), serde_json::json!(2));
        recorder.log_with("retrieve_complete", "2 chunks", details);

        let events = recorder.snapshot();
        assert_eq!(events[0].details["result_count"], serde_json::json!(2));
    }

    #[test]
    fn test_message_truncated() {
        let recorder = TraceRecorder::new();
        recorder.log("init", "x".repeat(1000));
        let events = recorder.snapshot();
        assert!(events[0].message.chars().count() <= 300);
    }

    #[test]
    fn test_budget_drops_events_with_marker() {
        let recorder = TraceRecorder::new();
        // Each event costs ~1KiB; 100 of them blow the 64KiB budget.
        for i in 0..100 {
            let mut details = serde_json::Map::new();
            details.insert("blob".to_string(), serde_json::json!("y".repeat(1024)));
            recorder.log_with("step", format!("event {i}"), details);
        }
        let events = recorder.snapshot();
        assert!(events.len() < 100);
        assert_eq!(
            events.last().map(|e| e.step.as_str()),
            Some("trace_truncated")
        );
    }

    #[test]
    fn test_preview_char_boundary() {
        let text = "caf\u{e9}".repeat(50);
        let out = preview(&text, 10);
        assert!(out.chars().count() <= 10);
        assert!(out.ends_with('\u{2026}'));
        assert_eq!(preview("short", 10), "short");
    }

    #[test]
    fn test_round4() {
        assert!((round4(0.123_456_78) - 0.1235).abs() < 1e-9);
        assert!((round4(2.0) - 2.0).abs() < 1e-9);
    }
}
