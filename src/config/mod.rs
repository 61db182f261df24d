pub mod defaults;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detector::{DetectionMethod, DetectorOptions};
use defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    pub detector: DetectorConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Hub repository id or local model directory.
    pub model: String,
    pub method: DetectionMethod,
    pub models_dir: PathBuf,
    pub threshold: f64,
    pub max_length: usize,
    pub intra_threads: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Upper bound on the wait for the inference gate; unbounded when unset.
    pub queue_timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// Load from an optional TOML file, falling back to defaults, then apply
    /// `LETTUCEDETECT_*` environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            let config_str = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            toml::from_str(&config_str)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup(ENV_MODEL) {
            self.detector.model = model;
        }
        if let Some(method) = lookup(ENV_METHOD) {
            self.detector.method = method
                .parse()
                .with_context(|| format!("Invalid {}", ENV_METHOD))?;
        }
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_PORT, port))?;
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    pub fn detector_options(&self) -> DetectorOptions {
        DetectorOptions {
            threshold: self.detector.threshold,
            max_length: self.detector.max_length,
            intra_threads: self.detector.intra_threads,
        }
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.gateway.queue_timeout_secs.map(Duration::from_secs)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("Port must be greater than 0"));
        }

        if self.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("Max body size must be greater than 0"));
        }

        if self.detector.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Model identifier must not be empty"));
        }

        if !(0.0..=1.0).contains(&self.detector.threshold) {
            return Err(anyhow::anyhow!("Span threshold must be between 0.0 and 1.0"));
        }

        if self.detector.max_length == 0 {
            return Err(anyhow::anyhow!("Max sequence length must be greater than 0"));
        }

        if self.detector.intra_threads == Some(0) {
            return Err(anyhow::anyhow!("Intra-op thread count must be greater than 0"));
        }

        self.socket_addr()?;
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            detector: DetectorConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let models_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lettucedetect")
            .join("models");

        Self {
            model: DEFAULT_MODEL.to_string(),
            method: DetectionMethod::Transformer,
            models_dir,
            threshold: DEFAULT_SPAN_THRESHOLD,
            max_length: DEFAULT_MAX_LENGTH,
            intra_threads: None, // One per logical CPU
        }
    }
}
