#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use lettucedetect_api::config::defaults::DEFAULT_MAX_BODY_BYTES;
use lettucedetect_api::server::router;
use lettucedetect_api::{
    detector, AppState, DetectionGateway, DetectionMethod, DetectorOptions, HallucinationModel,
    OutputFormat, RawPrediction,
};

pub const FRANCE_CONTEXT: &str =
    "France is a country in Europe. The capital of France is Paris. The population of France is 67 million.";
pub const FRANCE_QUESTION: &str = "What is the capital of France? What is the population of France?";
pub const FRANCE_ANSWER: &str =
    "The capital of France is Paris. The population of France is 69 million.";

/// Observations shared between a test and the model it handed to the gateway.
#[derive(Default)]
pub struct Probe {
    pub calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl Probe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Wraps a model, recording calls and any overlap between them.
pub struct Tracked {
    inner: Box<dyn HallucinationModel>,
    probe: Arc<Probe>,
    delay: Duration,
}

impl Tracked {
    pub fn new(inner: Box<dyn HallucinationModel>, delay: Duration) -> (Self, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let model = Self {
            inner,
            probe: Arc::clone(&probe),
            delay,
        };
        (model, probe)
    }
}

impl HallucinationModel for Tracked {
    fn predict(
        &mut self,
        contexts: &[String],
        question: &str,
        answer: &str,
        format: OutputFormat,
    ) -> Result<Vec<RawPrediction>> {
        let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active.fetch_max(active, Ordering::SeqCst);
        self.probe.calls.fetch_add(1, Ordering::SeqCst);

        std::thread::sleep(self.delay);
        let result = self.inner.predict(contexts, question, answer, format);

        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Always fails with a cause that must never reach the caller.
pub struct Failing;

impl HallucinationModel for Failing {
    fn predict(
        &mut self,
        _contexts: &[String],
        _question: &str,
        _answer: &str,
        _format: OutputFormat,
    ) -> Result<Vec<RawPrediction>> {
        Err(anyhow!("CUDA out of memory"))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

pub fn lexical() -> Box<dyn HallucinationModel> {
    detector::initialize(
        DetectionMethod::Lexical,
        Path::new(""),
        &DetectorOptions::default(),
    )
    .unwrap()
}

pub fn tracked_lexical(delay: Duration) -> (Box<dyn HallucinationModel>, Arc<Probe>) {
    let (model, probe) = Tracked::new(lexical(), delay);
    (Box::new(model), probe)
}

pub fn app_state(model: Box<dyn HallucinationModel>) -> (AppState, Arc<DetectionGateway>) {
    let gateway = Arc::new(DetectionGateway::new(model));
    let state = AppState::new(Arc::clone(&gateway), "test-model", "lexical");
    (state, gateway)
}

/// Serve the API on an ephemeral port; returns the base URL.
pub async fn spawn_server(model: Box<dyn HallucinationModel>) -> Result<(String, Arc<DetectionGateway>)> {
    let (state, gateway) = app_state(model);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(state, DEFAULT_MAX_BODY_BYTES);

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok((format!("http://{}", addr), gateway))
}

pub fn france_contexts() -> Vec<String> {
    vec![FRANCE_CONTEXT.to_string()]
}
