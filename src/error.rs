//! Bifrost error types

use std::time::Duration;

/// Bifrost error types
#[derive(Debug, thiserror::Error)]
pub enum BifrostError {
    // Upstream/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    // Streaming errors
    #[error("stream error: {0}")]
    Stream(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Registry resolution errors
    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: String },

    #[error("model not found: {key}")]
    ModelNotFound { key: String },

    /// No backing model of the class is available; the request was queued
    /// for out-of-band retry under `request_id`.
    #[error("No {model_class} models available. Request enqueued with ID: {request_id}")]
    NoModelsAvailable {
        model_class: String,
        request_id: String,
    },

    // Programmer errors
    #[error("invalid concurrency {0}: must be a positive integer")]
    InvalidConcurrency(usize),

    #[error("semaphore released more times than acquired")]
    UnmatchedRelease,

    // Collaborator errors
    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("assembly error: {0}")]
    Assembly(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl BifrostError {
    /// Error classification recorded against a model class.
    ///
    /// Only admission failures are distinguished; every other failure is
    /// reported as `other_error`.
    pub fn kind(&self) -> &'static str {
        match self {
            BifrostError::NoModelsAvailable { .. } => "no_models_available",
            _ => "other_error",
        }
    }
}

impl From<reqwest::Error> for BifrostError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                return BifrostError::RateLimited { retry_after: None };
            }
            return BifrostError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        BifrostError::Http(err.to_string())
    }
}

/// Result type alias for Bifrost operations
pub type Result<T> = std::result::Result<T, BifrostError>;
