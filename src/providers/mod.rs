mod genai;
pub mod google;

pub use google::{Google, GoogleConnector};
