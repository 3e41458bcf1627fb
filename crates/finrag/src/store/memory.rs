use async_trait::async_trait;
use std::sync::Arc;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use super::embeddings::Embedder;
use super::{DocumentStore, Passage, StoreError};

const EMBED_BATCH_SIZE: usize = 64;

/// HNSW vector index held in memory, ranked by cosine similarity
///
/// Chunks are added while building; once shared behind an `Arc` the store is only read.
/// The index is created on the first insert, sized to the embedder's output.
pub struct InMemoryStore {
    embedder: Arc<dyn Embedder>,
    chunks: Vec<String>,
    index: Option<Index>,
}

fn new_index(dimensions: usize) -> Result<Index, StoreError> {
    let options = IndexOptions {
        dimensions,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        connectivity: 0,
        expansion_add: 0,
        expansion_search: 0,
        multi: false,
    };
    Index::new(&options)
        .map_err(|e| StoreError::Index(format!("Failed to create vector index: {}", e)))
}

impl InMemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            chunks: Vec::new(),
            index: None,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Embed and store chunks, returning how many were added
    pub async fn insert_chunks(&mut self, chunks: Vec<String>) -> Result<usize, StoreError> {
        let mut added = 0;
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let vectors = self.embedder.embed(batch).await?;
            if vectors.len() != batch.len() {
                return Err(StoreError::Index(format!(
                    "Embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                )));
            }
            let Some(first) = vectors.first() else {
                continue;
            };

            if self.index.is_none() {
                self.index = Some(new_index(first.len())?);
            }
            let Some(index) = &self.index else {
                return Err(StoreError::Index("Vector index unavailable".into()));
            };
            index
                .reserve(index.size() + vectors.len())
                .map_err(|e| StoreError::Index(e.to_string()))?;

            for (content, vector) in batch.iter().zip(vectors) {
                if vector.len() != index.dimensions() {
                    return Err(StoreError::Index(format!(
                        "Chunk has {} dimensions but the index has {}",
                        vector.len(),
                        index.dimensions()
                    )));
                }
                // Keys are positions in `chunks`
                let key = self.chunks.len() as u64;
                index
                    .add(key, &vector)
                    .map_err(|e| StoreError::Index(e.to_string()))?;
                self.chunks.push(content.clone());
                added += 1;
            }
            tracing::debug!(added, total = self.chunks.len(), "indexed chunk batch");
        }
        Ok(added)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, StoreError> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        if self.chunks.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed_one(query).await?;
        if query_vector.len() != index.dimensions() {
            return Err(StoreError::Index(format!(
                "Query has {} dimensions but the index has {}",
                query_vector.len(),
                index.dimensions()
            )));
        }

        let matches = index
            .search(&query_vector, k)
            .map_err(|e| StoreError::Index(e.to_string()))?;

        // Equal distances keep insertion order
        let mut hits: Vec<(u64, f32)> = matches.keys.into_iter().zip(matches.distances).collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        Ok(hits
            .into_iter()
            .filter_map(|(key, distance)| {
                self.chunks
                    .get(key as usize)
                    .map(|content| Passage::new(content.clone(), 1.0 - distance))
            })
            .collect())
    }
}
