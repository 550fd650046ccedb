//! # rag-arena
//!
//! Multi-technique RAG evaluation orchestrator: runs a set of named
//! retrieval-augmented-generation techniques against a shared corpus
//! for one query, records the full per-technique trace, and scores the
//! answers with an LLM dimensional judge and reference metrics.
//!
//! # Architecture
//!
//! ```text
//! Query -> FanoutDispatcher
//!   |- TechniqueRegistry constructs each technique per request
//!   |- bounded fan-out -> N concurrent technique runs
//!   |    '- each: embed / search / BM25 / complete -> TechniqueResult
//!   |- QA records persisted in one transaction
//!   '- EvalDispatcher
//!        |- DimensionalJudge (0-10 per quality dimension)
//!        '- ReferenceEvaluator (Ragas-style metrics, isolated workers)
//! ```
//!
//! The capability boundaries (vector index, LLM, embeddings) are traits
//! in [`client`]; everything above them is provider-agnostic.

pub mod cli;
pub mod client;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod eval;
pub mod search;
pub mod storage;
pub mod technique;

pub use crate::core::{RagConfig, TechniqueResult};
pub use crate::dispatch::{FanoutDispatcher, FanoutReport, FanoutRequest};
pub use crate::error::ErrorKind;
pub use crate::eval::{DimensionalJudge, EvalDispatcher, ReferenceEvaluator};
pub use crate::technique::{Capabilities, TechniqueRegistry};
