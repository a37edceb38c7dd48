use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::google::DEFAULT_BASE_URL;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid model mapping {0:?}; expected FROM=TO")]
    ModelMapping(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    pub base_url: String,
    pub request_timeout_seconds: u64,
    pub max_body_bytes: usize,
    /// Requested model id -> backend model id.
    pub model_map: BTreeMap<String, String>,
    pub json_logs: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_seconds: 300,
            max_body_bytes: 64 * 1024 * 1024,
            model_map: BTreeMap::new(),
            json_logs: false,
        }
    }
}

impl GatewayConfig {
    /// Loads a config file; `.json` files are parsed as JSON, anything else as TOML.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&raw)?)
        } else {
            Ok(toml::from_str(&raw)?)
        }
    }

    /// Applies one `FROM=TO` alias.
    pub fn insert_model_mapping(&mut self, mapping: &str) -> Result<(), ConfigError> {
        let (from, to) = mapping
            .split_once('=')
            .map(|(from, to)| (from.trim(), to.trim()))
            .filter(|(from, to)| !from.is_empty() && !to.is_empty())
            .ok_or_else(|| ConfigError::ModelMapping(mapping.to_string()))?;
        self.model_map.insert(from.to_string(), to.to_string());
        Ok(())
    }

    pub fn resolve_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_map
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested)
    }
}
