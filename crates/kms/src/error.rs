//! Key provider error types and result alias.
//!
//! # Error Types
//!
//! - [`KmsError::KeyNotFound`] - The key name is not registered in the KMS
//! - [`KmsError::Unauthorized`] - The caller may not use the key
//! - [`KmsError::Connection`] - The KMS could not be reached or failed internally
//! - [`KmsError::Timeout`] - A KMS call exceeded its time limit
//! - [`KmsError::InvalidRequest`] - The KMS rejected the request as malformed
//! - [`KmsError::InvalidResponse`] - The KMS answered with something unparseable
//! - [`KmsError::Config`] - The client was configured with invalid settings
//!
//! Only connection failures and timeouts are transient. A missing key or a
//! refused caller does not get better by retrying.

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for key provider operations.
pub type KmsResult<T> = Result<T, KmsError>;

/// Errors that can occur while talking to a key provider.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KmsError {
    /// The key is not registered in the KMS.
    #[error("Key not found: {key}")]
    KeyNotFound {
        /// The missing key name.
        key: String,
    },

    /// The caller is not allowed to perform the operation.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Description of the refusal.
        message: String,
    },

    /// The KMS could not be reached, or failed on its side.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The call did not complete in time.
    #[error("KMS call timed out")]
    Timeout,

    /// The KMS rejected the request.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of the rejection.
        message: String,
    },

    /// The KMS response could not be interpreted.
    #[error("Invalid response: {message}")]
    InvalidResponse {
        /// Description of the problem.
        message: String,
        /// The underlying decode error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The client configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl KmsError {
    /// Creates a new `KeyNotFound` error.
    #[must_use]
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    /// Creates a new `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Creates a new `InvalidResponse` error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse { message: message.into(), source: None }
    }

    /// Creates a new `InvalidResponse` error with a source error.
    #[must_use]
    pub fn invalid_response_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::InvalidResponse { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` if retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }

    /// Returns `true` if the key cannot be used until an operator intervenes.
    #[must_use]
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. } | Self::Unauthorized { .. })
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A value is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// The rejected value.
        value: String,
    },

    /// A duration or count must be greater than zero.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A value lies outside its accepted range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// Largest accepted value.
        max: String,
        /// The rejected value.
        value: String,
    },

    /// A value is malformed.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },
}
