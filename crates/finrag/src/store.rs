//! Nearest-neighbour retrieval over the chunks of a loaded document.

pub mod embeddings;
pub mod ingest;
pub mod memory;
pub mod mock;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// One retrieved chunk of the document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub content: String,
    pub score: f32,
}

impl Passage {
    pub fn new<S: Into<String>>(content: S, score: f32) -> Self {
        Self {
            content: content.into(),
            score,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Could not read document: {0}")]
    Io(#[from] std::io::Error),
}

/// Returns the passages most relevant to a query, best first
///
/// Implementations are read-only once built and may be queried concurrently.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, StoreError>;
}
