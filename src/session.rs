//! Per-request backend sessions.
//!
//! A [`Connector`] turns the caller's credential into a [`Session`]. The HTTP
//! layer opens exactly one session per inbound request and drops it when the
//! request finishes, so no backend state is shared between callers.

use std::sync::Arc;

use crate::Result;
use crate::embedding::EmbeddingModel;
use crate::model::LanguageModel;

pub trait Session: LanguageModel + EmbeddingModel {}

impl<T> Session for T where T: LanguageModel + EmbeddingModel + ?Sized {}

pub trait Connector: Send + Sync {
    fn connect(&self, credential: &str) -> Result<Arc<dyn Session>>;
}
