pub mod lexical;
pub mod models;
pub mod transformer;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub use lexical::LexicalDetector;
pub use models::ModelManager;
pub use transformer::TransformerDetector;

/// Hallucination detection backend.
///
/// Implementations are stateful and not required to be thread-safe: `predict`
/// takes `&mut self` and is a blocking call. Callers reach it only through
/// [`crate::gateway::DetectionGateway`], which guarantees a single call in flight.
pub trait HallucinationModel: Send {
    fn predict(
        &mut self,
        contexts: &[String],
        question: &str,
        answer: &str,
        format: OutputFormat,
    ) -> Result<Vec<RawPrediction>>;

    fn name(&self) -> &str;
}

/// Raw per-token or per-span output of a model, before it is shaped for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPrediction {
    Token {
        token: String,
        prob: f64,
    },
    Span {
        start: usize,
        end: usize,
        text: String,
        confidence: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Tokens,
    Spans,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Tokens => "tokens",
            OutputFormat::Spans => "spans",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    /// ONNX token classifier (ModernBERT-style LettuceDetect export).
    Transformer,
    /// Context word overlap; needs no model files.
    Lexical,
}

impl DetectionMethod {
    pub const ALL: &'static [&'static str] = &["transformer", "lexical"];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Transformer => "transformer",
            DetectionMethod::Lexical => "lexical",
        }
    }

    pub fn needs_model_files(&self) -> bool {
        matches!(self, DetectionMethod::Transformer)
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transformer" => Ok(DetectionMethod::Transformer),
            "lexical" => Ok(DetectionMethod::Lexical),
            other => Err(anyhow!(
                "Unknown detection method '{}', expected one of {:?}",
                other,
                DetectionMethod::ALL
            )),
        }
    }
}

/// Tuning knobs shared by all detection methods.
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    /// Token scores at or above this value are merged into spans.
    pub threshold: f64,
    /// Maximum encoded sequence length; the prompt side is truncated first.
    pub max_length: usize,
    pub intra_threads: Option<usize>,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            threshold: crate::config::defaults::DEFAULT_SPAN_THRESHOLD,
            max_length: crate::config::defaults::DEFAULT_MAX_LENGTH,
            intra_threads: None,
        }
    }
}

/// Construct the inference resource. Called exactly once at startup.
///
/// `model_path` must point at a resolved model directory for methods that need
/// model files (see [`ModelManager::resolve`]); it is ignored otherwise.
pub fn initialize(
    method: DetectionMethod,
    model_path: &Path,
    options: &DetectorOptions,
) -> Result<Box<dyn HallucinationModel>> {
    info!("Initializing '{}' hallucination detector", method);
    let model: Box<dyn HallucinationModel> = match method {
        DetectionMethod::Transformer => Box::new(TransformerDetector::load(model_path, options)?),
        DetectionMethod::Lexical => Box::new(LexicalDetector::new(options.threshold)?),
    };
    info!("Hallucination detector '{}' ready", model.name());
    Ok(model)
}
