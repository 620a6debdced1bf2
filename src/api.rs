use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use thiserror::Error;

use crate::queue::QueuedOperation;
use crate::user_agent::generate_user_agent;

/// Coarse classification of a backend failure.
///
/// Only `Network` is retryable: it means no response was received at all.
/// Every other kind means the backend answered, so it is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Service,
    Auth,
    Validation,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Service error: {message}")]
    Service { status: Option<u16>, message: String },
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Network(_) | BackendError::Timeout(_) => ErrorKind::Network,
            BackendError::Service { .. } => ErrorKind::Service,
            BackendError::Auth(_) => ErrorKind::Auth,
            BackendError::Validation(_) => ErrorKind::Validation,
        }
    }

    pub fn is_network(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// Map an HTTP status and response body onto the taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => BackendError::Auth(non_empty_or(body, "Invalid API key")),
            403 => BackendError::Auth(non_empty_or(body, "Access denied")),
            400 | 422 => BackendError::Validation(non_empty_or(body, "Rejected payload")),
            _ => BackendError::Service {
                status: Some(status),
                message: non_empty_or(body, &format!("Unexpected status: {}", status)),
            },
        }
    }

    /// Build an error from an opaque message produced outside this crate
    /// (a wrapped SDK, a proxy, a host bridge).
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_message(&message) {
            ErrorKind::Network => BackendError::Network(message),
            ErrorKind::Auth => BackendError::Auth(message),
            ErrorKind::Validation => BackendError::Validation(message),
            ErrorKind::Service => BackendError::Service {
                status: None,
                message,
            },
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return BackendError::Timeout(err.to_string());
        }
        if err.is_connect() || err.is_request() {
            return BackendError::Network(err.to_string());
        }
        if let Some(status) = err.status() {
            return BackendError::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() || err.is_body() {
            // A response arrived; its body was the problem.
            return BackendError::Service {
                status: None,
                message: err.to_string(),
            };
        }
        if err.is_builder() {
            return BackendError::Validation(err.to_string());
        }
        BackendError::Network(err.to_string())
    }
}

fn non_empty_or(body: String, fallback: &str) -> String {
    if body.trim().is_empty() {
        fallback.to_string()
    } else {
        body
    }
}

const NETWORK_MARKERS: &[&str] = &[
    "failed to fetch",
    "networkerror",
    "network error",
    "network request failed",
    "load failed",
    "timed out",
    "timeout",
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "enotfound",
    "dns error",
    "name resolution",
    "unreachable",
];

const AUTH_MARKERS: &[&str] = &[
    "jwt",
    "unauthorized",
    "forbidden",
    "invalid api key",
    "not authenticated",
    "invalid login credentials",
];

const VALIDATION_MARKERS: &[&str] = &[
    "validation",
    "violates",
    "invalid input",
    "malformed",
    "bad request",
];

/// Classify an opaque error message.
///
/// Structured errors should go through `BackendError::kind`; this exists for
/// the places where only a message survives.
pub fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

    if contains_any(NETWORK_MARKERS) {
        ErrorKind::Network
    } else if contains_any(AUTH_MARKERS) {
        ErrorKind::Auth
    } else if contains_any(VALIDATION_MARKERS) {
        ErrorKind::Validation
    } else {
        ErrorKind::Service
    }
}

/// The backend data service as seen by the resilience layer.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// The cheapest bounded read the backend offers. Used only for probing.
    async fn probe_read(&self) -> Result<(), BackendError>;

    /// Apply a previously queued write.
    async fn replay(&self, operation: &QueuedOperation) -> Result<(), BackendError>;
}

/// `BackendClient` over the hosted REST backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    probe_path: String,
    user_agent: String,
}

pub const DEFAULT_PROBE_PATH: &str = "profiles";

impl HttpBackend {
    pub fn new(base_url: String) -> Result<Self, BackendError> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: String, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Validation(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key: None,
            probe_path: DEFAULT_PROBE_PATH.to_string(),
            user_agent: generate_user_agent(),
        })
    }

    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_probe_path(mut self, probe_path: String) -> Self {
        self.probe_path = probe_path;
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("User-Agent", &self.user_agent);
        match &self.api_key {
            Some(key) => request
                .header("apikey", key)
                .header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn handle_response(response: Response) -> Result<Response, BackendError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let error_body = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(status.as_u16(), error_body))
    }
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn probe_read(&self) -> Result<(), BackendError> {
        let url = self.url(&self.probe_path);
        tracing::debug!("Probing backend at: {}", url);

        let response = self
            .authorize(self.client.get(&url))
            .query(&[("select", "id"), ("limit", "1")])
            .send()
            .await?;

        Self::handle_response(response).await.map(|_| ())
    }

    async fn replay(&self, operation: &QueuedOperation) -> Result<(), BackendError> {
        let url = self.url(operation.kind.resource());

        tracing::debug!(
            operation_id = %operation.id,
            kind = %operation.kind,
            attempts = operation.attempts,
            "Replaying queued operation to {}",
            url
        );

        // The operation id travels with every delivery so the backend can
        // drop duplicates; replay is at-least-once.
        let response = self
            .authorize(self.client.post(&url))
            .header("Idempotency-Key", &operation.id)
            .header("Prefer", "resolution=merge-duplicates")
            .json(&operation.payload)
            .send()
            .await?;

        Self::handle_response(response).await.map(|_| ())
    }
}
