//! Request-scoped BM25 lexical index.
//!
//! Built per query-session from the candidate chunks of a vector search,
//! never shared across requests. Tokenization is unicode-aware via word
//! boundaries; terms are lowercased. Standard Okapi parameters
//! (`k1 = 1.2`, `b = 0.75`) with the non-negative idf variant.

use std::collections::HashMap;

use unicode_segmentation::UnicodeSegmentation;

/// Term-frequency saturation parameter.
const K1: f64 = 1.2;
/// Length normalization parameter.
const B: f64 = 0.75;

/// In-memory BM25 scorer over a fixed candidate set.
#[derive(Debug)]
pub struct Bm25Index {
    /// Per-document term frequencies, parallel to the build order.
    doc_terms: Vec<HashMap<String, usize>>,
    /// Per-document token counts.
    doc_lens: Vec<usize>,
    /// Document frequency per term.
    term_docs: HashMap<String, usize>,
    /// Mean document length.
    avg_len: f64,
}

impl Bm25Index {
    /// Builds an index over `texts`, preserving their order: scores are
    /// reported against the same indices.
    #[must_use]
    pub fn build(texts: &[&str]) -> Self {
        let doc_terms: Vec<HashMap<String, usize>> = texts
            .iter()
            .map(|text| {
                let mut terms: HashMap<String, usize> = HashMap::new();
                for token in tokenize(text) {
                    *terms.entry(token).or_insert(0) += 1;
                }
                terms
            })
            .collect();

        let doc_lens: Vec<usize> = doc_terms.iter().map(|t| t.values().sum()).collect();

        let mut term_docs: HashMap<String, usize> = HashMap::new();
        for terms in &doc_terms {
            for term in terms.keys() {
                *term_docs.entry(term.clone()).or_insert(0) += 1;
            }
        }

        let total: usize = doc_lens.iter().sum();
        let avg_len = if doc_lens.is_empty() {
            0.0
        } else {
            // usize -> f64 is lossless for any realistic corpus size.
            total as f64 / doc_lens.len() as f64
        };

        Self {
            doc_terms,
            doc_lens,
            term_docs,
            avg_len,
        }
    }

    /// Number of documents indexed.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.doc_terms.len()
    }

    /// Whether the index holds no documents.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.doc_terms.is_empty()
    }

    /// Scores `query` against every indexed document.
    ///
    /// Returns one score per document in build order. Documents sharing
    /// no term with the query score 0.
    #[must_use]
    pub fn scores(&self, query: &str) -> Vec<f64> {
        let n = self.doc_terms.len();
        if n == 0 {
            return Vec::new();
        }

        let query_terms = tokenize(query);
        let mut out = vec![0.0f64; n];

        for term in &query_terms {
            let Some(&df) = self.term_docs.get(term) else {
                continue;
            };
            let idf = (1.0 + (n as f64 - df as f64 + 0.5) / (df as f64 + 0.5)).ln();

            for (i, terms) in self.doc_terms.iter().enumerate() {
                let Some(&tf) = terms.get(term) else {
                    continue;
                };
                let tf = tf as f64;
                let len_norm = 1.0 - B + B * (self.doc_lens[i] as f64 / self.avg_len.max(1.0));
                out[i] += idf * (tf * (K1 + 1.0)) / (tf + K1 * len_norm);
            }
        }

        out
    }
}

/// Unicode-aware tokenization: word boundaries, lowercased.
fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words().map(str::to_lowercase).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tokenize_unicode() {
        let tokens = tokenize("Grüße aus Köln! C'est l'été.");
        assert!(tokens.contains(&"grüße".to_string()));
        assert!(tokens.contains(&"köln".to_string()));
        assert!(!tokens.contains(&"!".to_string()));
    }

    #[test]
    fn test_matching_doc_outscores_nonmatching() {
        let index = Bm25Index::build(&[
            "the capital of france is paris",
            "berlin is a city in germany",
            "rust is a systems programming language",
        ]);
        let scores = index.scores("capital of france");
        assert!(scores[0] > scores[1]);
        assert!(scores[0] > scores[2]);
        assert!(scores[2].abs() < f64::EPSILON);
    }

    #[test]
    fn test_rare_term_weighs_more() {
        let index = Bm25Index::build(&[
            "paris paris paris common",
            "common word document here",
            "another common document text",
        ]);
        let scores = index.scores("paris");
        assert!(scores[0] > 0.0);
        assert!(scores[1].abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_inputs() {
        let index = Bm25Index::build(&[]);
        assert!(index.is_empty());
        assert!(index.scores("anything").is_empty());

        let index = Bm25Index::build(&["some text"]);
        assert_eq!(index.scores(""), vec![0.0]);
    }

    #[test]
    fn test_scores_len_matches_build_order() {
        let index = Bm25Index::build(&["a b c", "b c d", "c d e", "x y z"]);
        assert_eq!(index.len(), 4);
        assert_eq!(index.scores("c").len(), 4);
    }

    proptest! {
        #[test]
        fn prop_scores_non_negative(
            docs in proptest::collection::vec("[a-z ]{0,60}", 1..12),
            query in "[a-z ]{0,30}",
        ) {
            let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
            let index = Bm25Index::build(&refs);
            for score in index.scores(&query) {
                prop_assert!(score >= 0.0);
            }
        }
    }
}
