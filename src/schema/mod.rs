pub mod validation;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use validation::ValidationError;

/// Request body shared by the token and span endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRequest {
    /// Supporting passages the answer should be grounded in.
    pub contexts: Vec<String>,
    pub question: String,
    /// Text to be scored.
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDetectionItem {
    pub token: String,
    pub hallucination_score: f64,
}

/// A scored substring of the answer. `start` and `end` are character offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanDetectionItem {
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub hallucination_score: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenDetectionResponse {
    pub predictions: Vec<TokenDetectionItem>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpanDetectionResponse {
    pub predictions: Vec<SpanDetectionItem>,
}

impl DetectionRequest {
    pub fn new<C, S>(contexts: C, question: impl Into<String>, answer: impl Into<String>) -> Self
    where
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            contexts: contexts.into_iter().map(Into::into).collect(),
            question: question.into(),
            answer: answer.into(),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ValidationError> {
        parse_json(bytes)
    }

    pub fn to_json(&self) -> Result<String, ValidationError> {
        render_json(self)
    }
}

impl TokenDetectionResponse {
    pub fn new(predictions: Vec<TokenDetectionItem>) -> Self {
        Self { predictions }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ValidationError> {
        parse_json(bytes)
    }

    pub fn to_json(&self) -> Result<String, ValidationError> {
        render_json(self)
    }
}

impl SpanDetectionResponse {
    pub fn new(predictions: Vec<SpanDetectionItem>) -> Self {
        Self { predictions }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ValidationError> {
        parse_json(bytes)
    }

    pub fn to_json(&self) -> Result<String, ValidationError> {
        render_json(self)
    }
}

fn parse_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ValidationError> {
    serde_json::from_slice(bytes).map_err(ValidationError::from)
}

fn render_json<T: Serialize>(value: &T) -> Result<String, ValidationError> {
    serde_json::to_string(value).map_err(ValidationError::from)
}
