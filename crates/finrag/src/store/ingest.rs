use std::path::Path;

use super::memory::InMemoryStore;
use super::StoreError;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    /// Maximum characters per chunk. A single longer word still becomes its own chunk.
    pub chunk_size: usize,
    /// Characters of trailing context repeated at the start of the next chunk
    pub chunk_overlap: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

/// Split text into overlapping chunks that break on whitespace.
///
/// Whitespace runs are collapsed to single spaces. Each chunk after the first starts
/// with as many whole words from the end of the previous chunk as fit in
/// `chunk_overlap` characters, but always advances by at least one word.
pub fn chunk_text(text: &str, options: ChunkOptions) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let chunk_size = options.chunk_size.max(1);
    let lengths: Vec<usize> = words.iter().map(|w| w.chars().count()).collect();
    let span = |from: usize, to: usize| -> usize {
        lengths[from..to].iter().sum::<usize>() + (to - from).saturating_sub(1)
    };

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let mut end = start + 1;
        while end < words.len() && span(start, end + 1) <= chunk_size {
            end += 1;
        }
        chunks.push(words[start..end].join(" "));

        if end >= words.len() {
            break;
        }

        let mut next = end;
        while next > start + 1 && span(next - 1, end) <= options.chunk_overlap {
            next -= 1;
        }
        start = next;
    }

    chunks
}

/// Chunk a text and add it to the store, returning the number of chunks indexed
pub async fn ingest_text(
    store: &mut InMemoryStore,
    text: &str,
    options: ChunkOptions,
) -> Result<usize, StoreError> {
    let chunks = chunk_text(text, options);
    store.insert_chunks(chunks).await
}

/// Load a UTF-8 text document from disk and index it
pub async fn ingest_file(
    store: &mut InMemoryStore,
    path: &Path,
    options: ChunkOptions,
) -> Result<usize, StoreError> {
    let text = tokio::fs::read_to_string(path).await?;
    let added = ingest_text(store, &text, options).await?;
    tracing::info!(path = %path.display(), chunks = added, "ingested document");
    Ok(added)
}
