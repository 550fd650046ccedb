//! In-memory vector index.
//!
//! Backs the ingest path and the test suite. Brute-force cosine scoring
//! over a `BTreeMap` keeps ordering deterministic: ties are broken by
//! chunk id ascending, so repeat searches against a frozen index return
//! byte-identical orderings.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{DocumentFilter, IndexHit, VectorIndex};
use crate::core::EmbeddedChunk;
use crate::error::ClientError;
use crate::search::cosine_similarity;

/// Brute-force in-memory cosine index.
#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    inner: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    dimension: Option<usize>,
    chunks: BTreeMap<String, EmbeddedChunk>,
}

impl MemoryVectorIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index pre-populated with `chunks`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DimensionMismatch`] when the chunks do not
    /// share one dimension.
    pub fn hydrate(chunks: Vec<EmbeddedChunk>) -> Result<Self, ClientError> {
        let index = Self::new();
        index.insert_all(chunks)?;
        Ok(index)
    }

    /// Number of chunks currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map_or(0, |state| state.chunks.len())
    }

    /// Whether the index holds no chunks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_all(&self, chunks: Vec<EmbeddedChunk>) -> Result<(), ClientError> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| ClientError::Permanent {
                message: "vector index lock poisoned".to_string(),
            })?;

        for chunk in chunks {
            let dim = chunk.vector.len();
            match state.dimension {
                None => state.dimension = Some(dim),
                Some(expected) if expected != dim => {
                    return Err(ClientError::DimensionMismatch {
                        expected,
                        actual: dim,
                    });
                }
                Some(_) => {}
            }
            state.chunks.insert(chunk.chunk.chunk_id.clone(), chunk);
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn similarity_search(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &DocumentFilter,
    ) -> Result<Vec<IndexHit>, ClientError> {
        let state = self.inner.read().map_err(|_| ClientError::Permanent {
            message: "vector index lock poisoned".to_string(),
        })?;

        if let Some(expected) = state.dimension
            && expected != query_vector.len()
        {
            return Err(ClientError::DimensionMismatch {
                expected,
                actual: query_vector.len(),
            });
        }

        let mut hits: Vec<IndexHit> = state
            .chunks
            .values()
            .filter(|c| filter.matches(&c.chunk.document_id))
            .map(|c| IndexHit {
                chunk_id: c.chunk.chunk_id.clone(),
                text: c.chunk.text.clone(),
                metadata: c.chunk.metadata.clone(),
                // Similarities are reported >= 0.
                score: cosine_similarity(query_vector, &c.vector).max(0.0),
            })
            .collect();

        // Descending score, ties by chunk id so ordering is stable.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn upsert(&self, chunks: Vec<EmbeddedChunk>) -> Result<(), ClientError> {
        self.insert_all(chunks)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, ClientError> {
        let mut state = self.inner.write().map_err(|_| ClientError::Permanent {
            message: "vector index lock poisoned".to_string(),
        })?;
        let before = state.chunks.len();
        state
            .chunks
            .retain(|_, c| c.chunk.document_id != document_id);
        Ok(before - state.chunks.len())
    }

    async fn dimension(&self) -> Option<usize> {
        self.inner.read().ok().and_then(|state| state.dimension)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::Chunk;

    fn embedded(chunk_id: &str, document_id: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: Chunk {
                chunk_id: chunk_id.to_string(),
                document_id: document_id.to_string(),
                ordinal: 0,
                text: format!("text of {chunk_id}"),
                metadata: BTreeMap::new(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn test_search_orders_descending() {
        let index = MemoryVectorIndex::hydrate(vec![
            embedded("a", "d1", vec![1.0, 0.0]),
            embedded("b", "d1", vec![0.8, 0.6]),
            embedded("c", "d1", vec![0.0, 1.0]),
        ])
        .unwrap_or_else(|_| unreachable!());

        let hits = index
            .similarity_search(&[1.0, 0.0], 3, &DocumentFilter::all())
            .await
            .unwrap_or_default();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk_id, "a");
        assert!(hits[0].score >= hits[1].score && hits[1].score >= hits[2].score);
    }

    #[tokio::test]
    async fn test_search_filters_by_document() {
        let index = MemoryVectorIndex::hydrate(vec![
            embedded("a", "d1", vec![1.0, 0.0]),
            embedded("b", "d2", vec![1.0, 0.0]),
        ])
        .unwrap_or_else(|_| unreachable!());

        let filter = DocumentFilter::documents(["d2"]);
        let hits = index
            .similarity_search(&[1.0, 0.0], 5, &filter)
            .await
            .unwrap_or_default();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "b");
    }

    #[tokio::test]
    async fn test_search_is_deterministic() {
        let index = MemoryVectorIndex::hydrate(vec![
            embedded("b", "d1", vec![1.0, 0.0]),
            embedded("a", "d1", vec![1.0, 0.0]),
        ])
        .unwrap_or_else(|_| unreachable!());

        let first = index
            .similarity_search(&[1.0, 0.0], 2, &DocumentFilter::all())
            .await
            .unwrap_or_default();
        let second = index
            .similarity_search(&[1.0, 0.0], 2, &DocumentFilter::all())
            .await
            .unwrap_or_default();
        assert_eq!(first, second);
        // Equal scores resolve by chunk id.
        assert_eq!(first[0].chunk_id, "a");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = MemoryVectorIndex::hydrate(vec![embedded("a", "d1", vec![1.0, 0.0])])
            .unwrap_or_else(|_| unreachable!());
        let result = index
            .similarity_search(&[1.0, 0.0, 0.0], 1, &DocumentFilter::all())
            .await;
        assert!(matches!(
            result,
            Err(ClientError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));

        let result = index.upsert(vec![embedded("b", "d1", vec![1.0])]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_by_document() {
        let index = MemoryVectorIndex::hydrate(vec![
            embedded("a", "d1", vec![1.0, 0.0]),
            embedded("b", "d2", vec![0.0, 1.0]),
        ])
        .unwrap_or_else(|_| unreachable!());
        let removed = index.delete_by_document("d1").await.unwrap_or(0);
        assert_eq!(removed, 1);
        assert_eq!(index.len(), 1);
    }
}
