use async_trait::async_trait;

use crate::Result;

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Returns one vector per input, in input order.
    async fn embed(&self, model: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    async fn embed_single(&self, model: &str, text: String) -> Result<Vec<f32>> {
        let embeddings = self.embed(model, vec![text]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| crate::GenaiError::InvalidResponse("embedding response is empty".into()))
    }
}
