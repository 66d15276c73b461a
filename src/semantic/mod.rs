//! Semantic search infrastructure for verse embeddings.
//!
//! # Architecture
//!
//! - `tokenizer`: WordPiece tokenizer producing fixed-length model input
//! - `embeddings`: Tokenize, infer, mean-pool and normalize
//! - `onnx`: ONNX Runtime inference engine
//! - `index`: In-memory verse index with cosine similarity search
//! - `cache`: Per-translation JSON embedding cache
//! - `service`: Index lifecycle, build progress and search

pub mod cache;
pub mod embeddings;
pub mod index;
mod onnx;
pub mod service;
pub mod tokenizer;

pub use cache::EmbeddingCache;
pub use embeddings::EmbeddingModel;
pub use index::SearchResult;
pub use service::{BuildReport, IndexProgress, SemanticSearchError, SemanticSearchService};
pub use tokenizer::Tokenizer;
