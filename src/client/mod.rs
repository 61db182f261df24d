//! HTTP clients for the detection endpoints.
//!
//! `LettuceClient` blocks the calling thread, `LettuceClientAsync` is driven by
//! tokio. Both build requests and interpret responses through the same helpers.

use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

use crate::config::defaults::{SPANS_ENDPOINT, TOKEN_ENDPOINT};
use crate::schema::{
    DetectionRequest, SpanDetectionResponse, TokenDetectionResponse, ValidationError,
};

const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Server answered {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response body: {0}")]
    Validation(#[from] ValidationError),

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ClientError {
    /// HTTP status for errors the server answered with.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Endpoint URLs resolved once against the base URL.
#[derive(Debug, Clone)]
struct Endpoints {
    token: Url,
    spans: Url,
}

impl Endpoints {
    fn resolve(base_url: &str) -> Result<Self, ClientError> {
        let base = Url::parse(base_url)?;
        Ok(Self {
            token: base.join(TOKEN_ENDPOINT)?,
            spans: base.join(SPANS_ENDPOINT)?,
        })
    }
}

/// Turn a status and raw body into a typed response or a `ClientError`.
fn interpret<T>(
    status: StatusCode,
    body: &[u8],
    parse: fn(&[u8]) -> Result<T, ValidationError>,
) -> Result<T, ClientError> {
    if !status.is_success() {
        return Err(ClientError::Http {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }
    Ok(parse(body)?)
}

pub struct LettuceClient {
    http: reqwest::blocking::Client,
    endpoints: Endpoints,
}

impl LettuceClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoints: Endpoints::resolve(base_url)?,
        })
    }

    pub fn detect_token<C, S>(
        &self,
        contexts: C,
        question: &str,
        answer: &str,
    ) -> Result<TokenDetectionResponse, ClientError>
    where
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = DetectionRequest::new(contexts, question, answer);
        self.post(&self.endpoints.token, &request, TokenDetectionResponse::from_json)
    }

    pub fn detect_spans<C, S>(
        &self,
        contexts: C,
        question: &str,
        answer: &str,
    ) -> Result<SpanDetectionResponse, ClientError>
    where
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = DetectionRequest::new(contexts, question, answer);
        self.post(&self.endpoints.spans, &request, SpanDetectionResponse::from_json)
    }

    fn post<T>(
        &self,
        url: &Url,
        request: &DetectionRequest,
        parse: fn(&[u8]) -> Result<T, ValidationError>,
    ) -> Result<T, ClientError> {
        let response = self.http.post(url.clone()).json(request).send()?;
        let status = response.status();
        let body = response.bytes()?;
        interpret(status, &body, parse)
    }
}

pub struct LettuceClientAsync {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl LettuceClientAsync {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoints: Endpoints::resolve(base_url)?,
        })
    }

    pub async fn detect_token<C, S>(
        &self,
        contexts: C,
        question: &str,
        answer: &str,
    ) -> Result<TokenDetectionResponse, ClientError>
    where
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = DetectionRequest::new(contexts, question, answer);
        self.post(&self.endpoints.token, &request, TokenDetectionResponse::from_json)
            .await
    }

    pub async fn detect_spans<C, S>(
        &self,
        contexts: C,
        question: &str,
        answer: &str,
    ) -> Result<SpanDetectionResponse, ClientError>
    where
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = DetectionRequest::new(contexts, question, answer);
        self.post(&self.endpoints.spans, &request, SpanDetectionResponse::from_json)
            .await
    }

    async fn post<T>(
        &self,
        url: &Url,
        request: &DetectionRequest,
        parse: fn(&[u8]) -> Result<T, ValidationError>,
    ) -> Result<T, ClientError> {
        let response = self.http.post(url.clone()).json(request).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        interpret(status, &body, parse)
    }
}
