//! Single-flight access to the shared inference resource.
//!
//! The model sits behind an async mutex. Each call takes an owned guard and moves
//! it, together with an owned copy of the request, onto the blocking thread pool,
//! so at most one inference runs at a time and queued callers wait without
//! holding a worker thread.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::detector::{HallucinationModel, OutputFormat, RawPrediction};
use crate::schema::validation::check_span;
use crate::schema::{
    DetectionRequest, SpanDetectionItem, SpanDetectionResponse, TokenDetectionItem,
    TokenDetectionResponse, ValidationError,
};

/// Failures of the shared inference resource.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Model '{model}' failed: {source:#}")]
    Model {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Model '{model}' returned malformed {format} output: {message}")]
    MalformedOutput {
        model: String,
        format: OutputFormat,
        message: String,
    },

    #[error("Model '{model}' returned an invalid span: {source}")]
    InvalidSpan {
        model: String,
        #[source]
        source: ValidationError,
    },

    #[error("Inference task for model '{model}' did not complete: {message}")]
    TaskFailed { model: String, message: String },

    #[error("Timed out after {waited:?} waiting for the inference gate")]
    QueueTimeout { waited: Duration },
}

impl InferenceError {
    /// True when the caller never reached the model.
    pub fn is_queue_timeout(&self) -> bool {
        matches!(self, InferenceError::QueueTimeout { .. })
    }
}

/// Counters exposed by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStats {
    pub calls: u64,
    pub failures: u64,
    pub in_flight: u64,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicU64,
}

/// Marks one inference as running for as long as it is alive, including unwinding.
struct InFlight(Arc<Counters>);

impl InFlight {
    fn start(counters: &Arc<Counters>) -> Self {
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counters))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The only component allowed to call the inference resource.
pub struct DetectionGateway {
    model: Arc<Mutex<Box<dyn HallucinationModel>>>,
    model_name: String,
    queue_timeout: Option<Duration>,
    counters: Arc<Counters>,
}

impl DetectionGateway {
    /// Take ownership of the resource. Nothing else keeps a handle to it.
    pub fn new(model: Box<dyn HallucinationModel>) -> Self {
        let model_name = model.name().to_string();
        Self {
            model: Arc::new(Mutex::new(model)),
            model_name,
            queue_timeout: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_queue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }

    pub async fn detect_tokens(
        &self,
        request: &DetectionRequest,
    ) -> Result<TokenDetectionResponse, InferenceError> {
        let raw = self.detect(request, OutputFormat::Tokens).await?;
        self.record(self.to_tokens(raw))
    }

    pub async fn detect_spans(
        &self,
        request: &DetectionRequest,
    ) -> Result<SpanDetectionResponse, InferenceError> {
        let raw = self.detect(request, OutputFormat::Spans).await?;
        self.record(self.to_spans(raw, &request.answer))
    }

    /// Run one scoring pass, waiting for exclusive access to the model.
    pub async fn detect(
        &self,
        request: &DetectionRequest,
        format: OutputFormat,
    ) -> Result<Vec<RawPrediction>, InferenceError> {
        let result = self.run_exclusive(request, format).await;
        if result.is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn run_exclusive(
        &self,
        request: &DetectionRequest,
        format: OutputFormat,
    ) -> Result<Vec<RawPrediction>, InferenceError> {
        let queued_at = Instant::now();
        let acquire = Arc::clone(&self.model).lock_owned();
        let mut guard = match self.queue_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| InferenceError::QueueTimeout {
                    waited: queued_at.elapsed(),
                })?,
            None => acquire.await,
        };

        let started_at = Instant::now();
        let in_flight = InFlight::start(&self.counters);
        let request = request.clone();
        // Runs to completion even if this future is dropped; the gate opens when
        // the guard is dropped at the end of the closure.
        let joined = tokio::task::spawn_blocking(move || {
            let _in_flight = in_flight;
            guard.predict(&request.contexts, &request.question, &request.answer, format)
        })
        .await;

        debug!(
            model = %self.model_name,
            %format,
            queued_ms = started_at.duration_since(queued_at).as_millis() as u64,
            inference_ms = started_at.elapsed().as_millis() as u64,
            "Inference finished"
        );

        match joined {
            Ok(Ok(predictions)) => Ok(predictions),
            Ok(Err(source)) => Err(InferenceError::Model {
                model: self.model_name.clone(),
                source,
            }),
            Err(join_error) => Err(InferenceError::TaskFailed {
                model: self.model_name.clone(),
                message: join_error.to_string(),
            }),
        }
    }

    fn record<T>(&self, result: Result<T, InferenceError>) -> Result<T, InferenceError> {
        if result.is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn to_tokens(&self, raw: Vec<RawPrediction>) -> Result<TokenDetectionResponse, InferenceError> {
        raw.into_iter()
            .map(|prediction| match prediction {
                RawPrediction::Token { token, prob } => Ok(TokenDetectionItem {
                    hallucination_score: self.finite_score(OutputFormat::Tokens, prob)?,
                    token,
                }),
                RawPrediction::Span { .. } => Err(self.wrong_kind(OutputFormat::Tokens, "span")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(TokenDetectionResponse::new)
    }

    fn to_spans(
        &self,
        raw: Vec<RawPrediction>,
        answer: &str,
    ) -> Result<SpanDetectionResponse, InferenceError> {
        raw.into_iter()
            .map(|prediction| match prediction {
                RawPrediction::Span {
                    start,
                    end,
                    text,
                    confidence,
                } => {
                    let item = SpanDetectionItem {
                        start,
                        end,
                        text,
                        hallucination_score: self.finite_score(OutputFormat::Spans, confidence)?,
                    };
                    check_span(&item, answer).map_err(|source| InferenceError::InvalidSpan {
                        model: self.model_name.clone(),
                        source,
                    })?;
                    Ok(item)
                }
                RawPrediction::Token { .. } => Err(self.wrong_kind(OutputFormat::Spans, "token")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(SpanDetectionResponse::new)
    }

    /// JSON has no encoding for NaN or infinities.
    fn finite_score(&self, format: OutputFormat, score: f64) -> Result<f64, InferenceError> {
        if score.is_finite() {
            Ok(score)
        } else {
            Err(InferenceError::MalformedOutput {
                model: self.model_name.clone(),
                format,
                message: format!("non-finite score {}", score),
            })
        }
    }

    fn wrong_kind(&self, format: OutputFormat, found: &str) -> InferenceError {
        InferenceError::MalformedOutput {
            model: self.model_name.clone(),
            format,
            message: format!("expected {} predictions, found a {} prediction", format, found),
        }
    }
}
