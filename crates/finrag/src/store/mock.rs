use async_trait::async_trait;

use super::embeddings::Embedder;
use super::StoreError;

/// Keyword embedder for tests
///
/// Each vocabulary word owns one dimension holding its occurrence count. A final constant
/// dimension keeps every vector non-zero, so text sharing no vocabulary still ranks evenly.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    vocabulary: Vec<String>,
}

impl MockEmbedder {
    pub fn new<S: AsRef<str>>(vocabulary: &[S]) -> Self {
        Self {
            vocabulary: vocabulary
                .iter()
                .map(|word| word.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.vocabulary.len() + 1
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimensions()];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            if let Some(position) = self.vocabulary.iter().position(|word| *word == token) {
                vector[position] += 1.0;
            }
        }
        vector[self.vocabulary.len()] = 1.0;
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        Ok(texts.iter().map(|text| self.vector(text)).collect())
    }
}
