use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lettucedetect_api::{
    detector, ApiServer, DetectionGateway, DetectionMethod, ModelManager, ServerConfig,
};

#[derive(Debug, Parser)]
#[command(name = "lettucedetect-server", version, about = "Hallucination detection API")]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hub repository id or local model directory
    #[arg(long)]
    model: Option<String>,

    /// Detection method (transformer, lexical)
    #[arg(long)]
    method: Option<DetectionMethod>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(model) = self.model {
            config.detector.model = model;
        }
        if let Some(method) = self.method {
            config.detector.method = method;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    info!("🚀 Starting LettuceDetect API server...");

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    info!("✅ Configuration loaded");

    let method = config.detector.method;
    let model_path = if method.needs_model_files() {
        info!("🔄 Resolving model: {}", config.detector.model);
        let manager = ModelManager::new(config.detector.models_dir.clone())?;
        manager.resolve(&config.detector.model).await?
    } else {
        PathBuf::from(&config.detector.model)
    };

    let options = config.detector_options();
    let model = tokio::task::spawn_blocking(move || {
        detector::initialize(method, &model_path, &options)
    })
    .await
    .context("Detector initialization task failed")??;
    info!("✅ Hallucination detector initialized");

    let gateway = DetectionGateway::new(model).with_queue_timeout(config.queue_timeout());
    ApiServer::new(config, Arc::new(gateway)).run().await
}
