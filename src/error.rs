//! Error types for the metadata syncer
//!
//! Every failure mode of the sync engine maps onto one variant here. None of
//! them is process-fatal: each degrades to "retry later" or "skip this
//! object", which [`Error::action`] encodes for the work queue.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the syncer
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The object cache could not be listed
    #[error("Failed to list {kind}: {reason}")]
    List { kind: String, reason: String },

    /// A referenced object is not present in the cache
    #[error("Resource not found: {kind}/{name}")]
    Lookup { kind: String, name: String },

    /// A watch event carried no decodable name/namespace
    #[error("Cannot resolve object key: {0}")]
    KeyResolution(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Volume query failed: {0}")]
    Query(String),

    #[error("Entity reference update failed for {key}: {reason}")]
    Update { key: String, reason: String },

    /// The backend broke the pagination contract (cursor stalled or overran)
    #[error("Backend protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error while processing a queued key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build a lookup error for a cached object
    pub fn lookup(kind: &str, name: impl Into<String>) -> Self {
        Error::Lookup {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Build an update error for an entity reference key
    pub fn update(key: impl Into<String>, reason: impl ToString) -> Self {
        Error::Update {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Update { .. }
            | Error::Query(_)
            | Error::Cancelled
            | Error::List { .. } => ErrorAction::RequeueWithBackoff,

            // Broken pagination contract
            Error::ProtocolViolation(_) => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Payload or configuration problems - a retry sees the same input
            Error::KeyResolution(_)
            | Error::Lookup { .. }
            | Error::Configuration(_)
            | Error::Yaml(_)
            | Error::JsonParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Query(_) | Error::Update { .. } | Error::Cancelled
        )
    }
}

/// Result type alias for the syncer
pub type Result<T> = std::result::Result<T, Error>;
