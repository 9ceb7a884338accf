//! Error types shared by the store, the outbound dispatcher and the pipeline.

use serde_json::Value;
use thiserror::Error;

/// Failures reported by a [`crate::store::Store`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write. Callers branch on this
    /// explicitly; redelivered provider messages land here.
    #[error("duplicate key on {0}")]
    Duplicate(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// A stored row could not be decoded into its typed record.
    #[error("invalid stored record: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                let constraint = db_err.constraint().unwrap_or("unique constraint");
                return Self::Duplicate(constraint.to_string());
            }
        }
        if let sqlx::Error::RowNotFound = err {
            return Self::NotFound("row".to_string());
        }
        if let sqlx::Error::ColumnDecode { index, source } = &err {
            return Self::Corrupt(format!("column {index}: {source}"));
        }
        Self::Backend(err.to_string())
    }
}

/// Failures sending through the messaging provider's Graph API.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch configuration error: {0}")]
    Config(String),

    #[error("request to messaging provider failed: {0}")]
    Request(String),

    #[error("request to messaging provider timed out")]
    Timeout,

    /// Non-2xx response; `body` is the parsed JSON (or `{"raw": ...}`).
    #[error("messaging provider returned {status}: {body}")]
    Api { status: u16, body: Value },
}

impl DispatchError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Request(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error("invalid phone number '{0}': use E.164 format, e.g. +12345678901")]
    InvalidPhone(String),

    #[error("missing required onboarding field: {0}")]
    MissingField(&'static str),

    #[error("failed to hash dashboard password: {0}")]
    Password(#[from] bcrypt::BcryptError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("failed to load prompt config from {path}: {message}")]
    Prompts { path: String, message: String },

    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// Failures that stop the process before it starts serving.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open store: {0}")]
    Store(#[from] StoreError),

    #[error("server i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-event pipeline failure. The orchestrator turns these into a
/// `Failed` outcome for the event and keeps processing its siblings.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("conversation lookup failed: {0}")]
    Conversation(#[source] StoreError),

    #[error("failed to persist inbound message: {0}")]
    Inbound(#[source] StoreError),

    #[error("failed to persist outbound message: {0}")]
    Outbound(#[source] StoreError),

    #[error("event task aborted: {0}")]
    Aborted(String),
}
