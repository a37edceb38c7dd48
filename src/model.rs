use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::Result;
use crate::types::{GenerateRequest, GenerateResponse, ModelInfo, StreamChunk};

pub type StreamResult = BoxStream<'static, Result<StreamChunk>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;

    /// Opens an incremental generation. Transport failures that happen before the
    /// first byte (bad status, refused connection) surface here rather than in the stream.
    async fn stream(&self, request: GenerateRequest) -> Result<StreamResult>;
}
