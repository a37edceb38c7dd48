pub mod embedding;
mod error;
pub mod gateway;
pub mod model;
pub mod providers;
pub mod session;
pub mod types;
pub mod utils;

pub use embedding::EmbeddingModel;
pub use error::{GenaiError, Result};
pub use model::{LanguageModel, StreamResult};
pub use providers::{Google, GoogleConnector};
pub use session::{Connector, Session};
pub use types::{
    ContentPart, FinishReason, GenerateRequest, GenerateResponse, ImageSource, Message, ModelInfo,
    ResponseFormat, Role, StreamChunk, Tool, ToolChoice, Usage,
};
