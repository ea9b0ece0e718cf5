//! Error types for dagflow

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A dag-run id could not be resolved
    #[error("dag-run not found: {0}")]
    DagRunNotFound(String),

    /// An attempt directory exists but holds no readable status
    #[error("no status data for attempt: {0}")]
    NoStatusData(String),

    /// Dequeue on an empty queue
    #[error("queue is empty: {0}")]
    QueueEmpty(String),

    /// Targeted dequeue found no matching item
    #[error("queue item not found: {0}")]
    QueueItemNotFound(String),

    /// Namespace lookup failed
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Namespace already registered
    #[error("namespace already exists: {0}")]
    NamespaceAlreadyExists(String),

    /// Two namespace names hash to the same directory prefix
    #[error("namespace hash collision: {name} collides with {existing}")]
    NamespaceHashCollision { name: String, existing: String },

    /// An attempt with the same (dag, run id, attempt id) is already materialized
    #[error("dag-run already exists: {0}")]
    DagRunAlreadyExists(String),

    /// A persisted file failed to parse
    #[error("corrupted status file at {path}: {reason}")]
    CorruptedStatusFile { path: String, reason: String },

    /// A dag-run reference string did not match `name:id`
    #[error("invalid dag-run reference format: {0:?}")]
    InvalidRunRef(String),

    /// A DAG name contains forbidden characters or is empty
    #[error("invalid DAG name: {0:?}")]
    InvalidDagName(String),

    /// Another process holds the attempt writer lock
    #[error("attempt is locked by another writer: {0}")]
    AttemptLocked(String),

    /// Reads are unsupported on the shared-nothing attempt
    #[error("operation not supported on no-op attempt")]
    NoopAttemptNotSupported,

    /// LLM provider errors
    #[error("Provider error: {0}")]
    Provider(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Checksum verification failed
    #[error("checksum mismatch: {0}")]
    Checksum(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Retry loops must not retry the wrapped error
    #[error("{0}")]
    NonRetriable(#[source] Box<Error>),

    /// An error enriched with call-site context; the root kind is preserved
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Unknown errors
    #[error("Unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap with call-site context, preserving the root kind for matching
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Unwrap context layers down to the underlying kind
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::NonRetriable(_) => false,
            Error::Network(e) => {
                // 4xx other than 429 never resolves on retry
                match e.status() {
                    Some(status) => status.as_u16() == 429 || status.is_server_error(),
                    None => true,
                }
            }
            Error::Timeout(_) | Error::RateLimit(_) => true,
            _ => false,
        }
    }

    /// Check whether the root kind is a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::DagRunNotFound(_)
                | Error::NoStatusData(_)
                | Error::QueueEmpty(_)
                | Error::QueueItemNotFound(_)
                | Error::NamespaceNotFound(_)
        )
    }

    /// Get error severity for metrics
    pub fn severity(&self) -> ErrorSeverity {
        match self.root() {
            Error::Config(_) | Error::Auth(_) | Error::NamespaceHashCollision { .. } => {
                ErrorSeverity::Critical
            }
            Error::CorruptedStatusFile { .. } | Error::Checksum(_) => ErrorSeverity::High,
            Error::Timeout(_) | Error::RateLimit(_) | Error::Network(_) => ErrorSeverity::Medium,
            Error::Validation(_) | Error::InvalidRunRef(_) | Error::InvalidDagName(_) => {
                ErrorSeverity::Low
            }
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Extension for adding context to results without losing the error kind
pub trait ResultExt<T> {
    fn ctx(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn ctx(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_root_kind() {
        let err = Error::QueueEmpty("default".to_string())
            .context("dequeue for processor")
            .context("processor tick");

        assert!(matches!(err.root(), Error::QueueEmpty(_)));
        assert!(err.is_not_found());
        let rendered = err.to_string();
        assert!(rendered.starts_with("processor tick: "));
        assert!(rendered.contains("queue is empty"));
    }

    #[test]
    fn non_retriable_short_circuits() {
        let inner = Error::Timeout("provider call".to_string());
        assert!(inner.is_retryable());
        let wrapped = Error::NonRetriable(Box::new(inner));
        assert!(!wrapped.is_retryable());
    }

    #[test]
    fn auth_is_not_retryable() {
        assert!(!Error::Auth("bad key".to_string()).is_retryable());
        assert!(!Error::Checksum("digest mismatch".to_string()).is_retryable());
        assert!(Error::RateLimit("429".to_string()).is_retryable());
    }
}
