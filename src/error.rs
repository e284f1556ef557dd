//! Error types for org-replicator.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for replication operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Remote call failed in a way worth retrying (network, rate limit, 5xx)
    #[error("Transient remote error during {operation}: {message}")]
    Transient {
        /// Remote operation (describe, query, upsert, ...)
        operation: String,
        /// Error message
        message: String,
    },

    /// Remote call rejected permanently
    #[error("Remote error during {operation}: {message}")]
    Remote {
        /// Remote operation (describe, query, upsert, ...)
        operation: String,
        /// Error message
        message: String,
    },

    /// Upsert rejected by the destination for one or more records
    #[error("Data error on '{object}': {}", errors.join("; "))]
    Data {
        /// Object type
        object: String,
        /// Per-record error messages
        errors: Vec<String>,
    },

    /// Destination object has no external-id field
    #[error("Object '{object}' has no external id field '{field}'")]
    MissingExternalIdField {
        /// Object type
        object: String,
        /// Expected field name
        field: String,
    },

    /// Durable cache error
    #[error("Cache error: {message}")]
    Cache {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Retry exhausted
    #[error("Operation failed after {attempts} attempts: {message}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error message
        message: String,
        /// Last error encountered
        #[source]
        last_error: Option<Box<Error>>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transient (retryable) remote error.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a permanent remote error.
    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a data error for an object.
    pub fn data(object: impl Into<String>, errors: Vec<String>) -> Self {
        Self::Data {
            object: object.into(),
            errors,
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cache error with source.
    pub fn cache_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. } | Error::Io(_))
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Transient { .. } => "TRANSIENT_REMOTE_ERROR",
            Error::Remote { .. } => "REMOTE_ERROR",
            Error::Data { .. } => "DATA_ERROR",
            Error::MissingExternalIdField { .. } => "MISSING_EXTERNAL_ID",
            Error::Cache { .. } => "CACHE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization("JSON encoding failed", e)
    }
}

/// Error context extension trait.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation).
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::config_with_source(message, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::config_with_source(f(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::config("test").code(), "CONFIG_ERROR");
        assert_eq!(Error::validation("test").code(), "VALIDATION_ERROR");
        assert_eq!(Error::data("Account", vec![]).code(), "DATA_ERROR");
        assert_eq!(
            Error::transient("query", "timed out").code(),
            "TRANSIENT_REMOTE_ERROR"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::transient("query", "429").is_retryable());
        assert!(!Error::remote("query", "MALFORMED_QUERY").is_retryable());
        assert!(!Error::config("test").is_retryable());
        assert!(!Error::data("Account", vec!["bad".into()]).is_retryable());
    }

    #[test]
    fn test_context_wraps_foreign_errors() {
        let parsed: std::result::Result<u32, _> = "x".parse::<u32>();
        let err = parsed.context("Invalid batch size").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_data_error_message_joins_records() {
        let e = Error::data(
            "Contact",
            vec!["REQUIRED_FIELD_MISSING".into(), "DUPLICATE_VALUE".into()],
        );
        assert_eq!(
            e.to_string(),
            "Data error on 'Contact': REQUIRED_FIELD_MISSING; DUPLICATE_VALUE"
        );
    }
}
