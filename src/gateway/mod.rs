//! OpenAI-compatible HTTP surface over a [`Connector`](crate::session::Connector).

pub mod config;
mod error;
pub mod http;
pub mod logging;
pub mod relay;
pub mod sse;
pub mod translation;

pub use config::{ConfigError, GatewayConfig};
pub use error::{ApiError, GatewayError};
pub use http::{GatewayState, router};
