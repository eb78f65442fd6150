//! Token error types.
//!
//! Errors raised while requesting a delegation token from one downstream
//! service. Aggregation treats every variant as scoped to the issuing
//! service: a failure is recorded and the walk continues with the next
//! issuer.

use std::sync::Arc;

use thiserror::Error;

use crate::types::{TokenIdentity, TokenService};

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for token operations.
pub type TokenResult<T> = Result<T, TokenError>;

/// Errors that can occur while issuing a delegation token.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The service does not issue delegation tokens.
    #[error("Service does not support delegation tokens: {service}")]
    Unsupported {
        /// The service that was asked for a token.
        service: TokenService,
    },

    /// The caller is not allowed to obtain a token from the service.
    #[error("Not authorized to obtain a token from {service}: {message}")]
    Unauthorized {
        /// The service that refused the request.
        service: TokenService,
        /// Description of the refusal.
        message: String,
    },

    /// The service failed to issue a token.
    #[error("Token issuance failed for {service}: {message}")]
    Issuance {
        /// The service that failed.
        service: TokenService,
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The issuer returned a token for a different identity than it announced.
    #[error("Issuer announced {expected} but returned a token for {actual}")]
    IdentityMismatch {
        /// The identity the issuer advertised.
        expected: TokenIdentity,
        /// The identity carried by the returned token.
        actual: TokenIdentity,
    },
}

impl TokenError {
    /// Creates a new `Unsupported` error.
    #[must_use]
    pub fn unsupported(service: impl Into<TokenService>) -> Self {
        Self::Unsupported { service: service.into() }
    }

    /// Creates a new `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(service: impl Into<TokenService>, message: impl Into<String>) -> Self {
        Self::Unauthorized { service: service.into(), message: message.into() }
    }

    /// Creates a new `Issuance` error.
    #[must_use]
    pub fn issuance(service: impl Into<TokenService>, message: impl Into<String>) -> Self {
        Self::Issuance { service: service.into(), message: message.into(), source: None }
    }

    /// Creates a new `Issuance` error with a source error.
    #[must_use]
    pub fn issuance_with_source(
        service: impl Into<TokenService>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Issuance {
            service: service.into(),
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::types::TokenKind;

    #[test]
    fn test_error_display() {
        let err = TokenError::unsupported("nn1:8020");
        assert_eq!(err.to_string(), "Service does not support delegation tokens: nn1:8020");

        let err = TokenError::unauthorized("kms1:9600", "bad ticket");
        assert_eq!(err.to_string(), "Not authorized to obtain a token from kms1:9600: bad ticket");

        let err = TokenError::issuance("kms1:9600", "HTTP 500");
        assert_eq!(err.to_string(), "Token issuance failed for kms1:9600: HTTP 500");
    }

    #[test]
    fn test_identity_mismatch_display() {
        let err = TokenError::IdentityMismatch {
            expected: TokenIdentity::new(TokenKind::from("kms-dt"), TokenService::from("a:1")),
            actual: TokenIdentity::new(TokenKind::from("kms-dt"), TokenService::from("b:2")),
        };
        assert_eq!(
            err.to_string(),
            "Issuer announced kms-dt@a:1 but returned a token for kms-dt@b:2"
        );
    }

    #[test]
    fn test_issuance_preserves_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TokenError::issuance_with_source("kms1:9600", "request failed", io);

        let source = err.source().expect("source exists");
        assert_eq!(source.to_string(), "refused");
    }
}
