//! Pool error types and result alias.
//!
//! Refill failures never reach a caller that already received an EDEK; they
//! are logged and counted. A `PoolError` surfaces only from the synchronous
//! slow path ([`EdekPool::get_or_generate`](crate::EdekPool::get_or_generate)),
//! from explicit fills ([`EdekPool::ensure_filled`](crate::EdekPool::ensure_filled))
//! and from the coordinator facade.

use std::{sync::Arc, time::Duration};

use edek_kms::{BoxError, ConfigError, KmsError};
use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors produced by the EDEK pool.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The key provider failed for this key.
    #[error("KMS request for key {key} failed: {source}")]
    Kms {
        /// The key the request was for.
        key: String,
        /// The provider error.
        #[source]
        source: KmsError,
    },

    /// The pool is shutting down and accepts no new KMS work.
    #[error("EDEK pool is shutting down")]
    ShuttingDown,

    /// A KMS call made by the pool exceeded `kms_timeout`.
    #[error("KMS request for key {key} timed out after {timeout:?}")]
    Timeout {
        /// The key the request was for.
        key: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// Refills for the key are suspended after repeated failures.
    #[error("refills for key {key} are backing off for another {remaining:?}")]
    RefillBackoff {
        /// The suspended key.
        key: String,
        /// Time left until refills resume.
        remaining: Duration,
    },

    /// The encryption zone registry could not be read.
    #[error("Encryption zone registry error: {message}")]
    ZoneRegistry {
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// An encryption zone operation was rejected.
    #[error("Invalid encryption zone {path}: {message}")]
    InvalidZone {
        /// The zone path.
        path: String,
        /// Why it was rejected.
        message: String,
    },

    /// A background task ended abnormally.
    #[error("Background task failed: {message}")]
    Background {
        /// Description of the failure.
        message: String,
    },

    /// The pool was configured with invalid settings.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl PoolError {
    /// Creates a new `Kms` error.
    #[must_use]
    pub fn kms(key: impl Into<String>, source: KmsError) -> Self {
        Self::Kms { key: key.into(), source }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(key: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout { key: key.into(), timeout }
    }

    /// Creates a new `ZoneRegistry` error.
    #[must_use]
    pub fn zone_registry(message: impl Into<String>) -> Self {
        Self::ZoneRegistry { message: message.into(), source: None }
    }

    /// Creates a new `ZoneRegistry` error with a source error.
    #[must_use]
    pub fn zone_registry_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ZoneRegistry { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `InvalidZone` error.
    #[must_use]
    pub fn invalid_zone(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidZone { path: path.into(), message: message.into() }
    }

    /// Returns `true` if the same request may succeed later without operator
    /// intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kms { source, .. } => source.is_transient(),
            Self::Timeout { .. } | Self::RefillBackoff { .. } | Self::ZoneRegistry { .. } => true,
            _ => false,
        }
    }

    /// Returns the provider error, if this error came from the KMS.
    #[must_use]
    pub fn kms_error(&self) -> Option<&KmsError> {
        match self {
            Self::Kms { source, .. } => Some(source),
            _ => None,
        }
    }
}
