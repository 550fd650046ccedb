//! Scoring primitives shared by the retrieval layer.
//!
//! Holds the request-scoped BM25 index plus the small numeric helpers
//! (cosine similarity, min-max normalization) used by the fusion and
//! diversity-selection paths.

pub mod bm25;

pub use bm25::Bm25Index;

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when either vector is all zeros or the lengths differ;
/// retrieval treats such pairs as unrelated rather than erroring.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Min-max normalizes `values` into [0, 1].
///
/// A degenerate distribution (all values equal) maps to 1.0 when the
/// shared value is positive (every entry is an equally good signal) and
/// to 0.0 otherwise (no signal at all, e.g. zero lexical overlap).
#[must_use]
pub fn min_max_normalize(values: &[f64]) -> Vec<f64> {
    let Some(&first) = values.first() else {
        return Vec::new();
    };
    let (min, max) = values
        .iter()
        .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if range <= f64::EPSILON {
        let flat = if max > 0.0 { 1.0 } else { 0.0 };
        return vec![flat; values.len()];
    }
    values.iter().map(|&v| (v - min) / range).collect()
}
