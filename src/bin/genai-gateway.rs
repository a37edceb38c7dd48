use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use genai_gateway::GoogleConnector;
use genai_gateway::gateway::{GatewayConfig, GatewayState, logging, router};

/// OpenAI-compatible gateway in front of the Google Generative Language API.
#[derive(Debug, Parser)]
#[command(name = "genai-gateway", version)]
struct Cli {
    /// TOML or JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8080
    #[arg(long, alias = "addr")]
    listen: Option<String>,

    /// Backend base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Model alias FROM=TO (repeatable)
    #[arg(long = "model-map", value_name = "FROM=TO")]
    model_map: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn into_config(self) -> Result<GatewayConfig, Box<dyn std::error::Error + Send + Sync>> {
        let mut config = match self.config.as_deref() {
            Some(path) => GatewayConfig::load_from_path(path)?,
            None => GatewayConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(base_url) = self.base_url {
            config.base_url = base_url;
        }
        for mapping in &self.model_map {
            config.insert_model_mapping(mapping)?;
        }
        config.json_logs |= self.json_logs;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Cli::parse().into_config()?;
    logging::init_tracing(config.json_logs)?;

    let connector = GoogleConnector::new(
        config.base_url.clone(),
        Duration::from_secs(config.request_timeout_seconds),
    )?;
    let listen = config.listen.clone();
    let app = router(GatewayState::new(Arc::new(connector), config));

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "genai-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
