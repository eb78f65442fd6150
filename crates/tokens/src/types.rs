//! Delegation token types.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

/// Macro to define a newtype wrapper around `String` with standard trait
/// implementations.
///
/// Each generated type:
/// - Derives `Clone`, `Debug`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Implements `From<&str>` and `From<String>`
/// - Implements `Display` and `AsRef<str>`
macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            /// Returns the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

define_name!(
    /// The kind of a delegation token, e.g. `FS_DELEGATION_TOKEN` or `kms-dt`.
    TokenKind
);

define_name!(
    /// The canonical service address a token authenticates against,
    /// e.g. `10.0.0.5:8020`.
    TokenService
);

/// Identity of a downstream service from the token subsystem's point of view.
///
/// Two tokens with the same identity are interchangeable; credentials never
/// hold more than one live token per identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenIdentity {
    /// Token kind.
    pub kind: TokenKind,
    /// Service address.
    pub service: TokenService,
}

impl TokenIdentity {
    /// Creates a new identity.
    #[must_use]
    pub fn new(kind: TokenKind, service: TokenService) -> Self {
        Self { kind, service }
    }
}

impl fmt::Display for TokenIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.service)
    }
}

/// An opaque, renewable delegation token.
///
/// The token subsystem owns renewal and expiry; the aggregator only checks
/// liveness to decide whether a new token is needed.
///
/// # Example
///
/// ```
/// use edek_tokens::Token;
///
/// let token = Token::builder()
///     .kind("kms-dt")
///     .service("kms1:9600")
///     .identifier(b"opaque-id".to_vec())
///     .renewer("JobTracker")
///     .build();
///
/// assert!(token.is_live(chrono::Utc::now()));
/// assert_eq!(token.identity().to_string(), "kms-dt@kms1:9600");
/// ```
#[derive(Clone, PartialEq, Eq, bon::Builder)]
pub struct Token {
    /// Token kind.
    #[builder(into)]
    pub kind: TokenKind,
    /// Service address the token is valid for.
    #[builder(into)]
    pub service: TokenService,
    /// Encoded token identifier.
    #[builder(into)]
    pub identifier: Bytes,
    /// Token secret. Scrubbed from memory on drop.
    #[builder(default, into)]
    pub password: Zeroizing<Vec<u8>>,
    /// Principal allowed to renew the token.
    #[builder(into)]
    pub renewer: String,
    /// Issue time.
    #[builder(default = Utc::now())]
    pub issued_at: DateTime<Utc>,
    /// Expiry time; `None` means the token does not expire on its own.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Returns the identity this token authenticates.
    #[must_use]
    pub fn identity(&self) -> TokenIdentity {
        TokenIdentity::new(self.kind.clone(), self.service.clone())
    }

    /// Returns `true` if the token has not expired at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expiry| now < expiry)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.kind)
            .field("service", &self.service)
            .field("identifier_len", &self.identifier.len())
            .field("password", &"<redacted>")
            .field("renewer", &self.renewer)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn token(expires_at: Option<DateTime<Utc>>) -> Token {
        Token::builder()
            .kind("FS_DELEGATION_TOKEN")
            .service("nn1:8020")
            .identifier(b"id".to_vec())
            .password(b"secret".to_vec())
            .renewer("JobTracker")
            .maybe_expires_at(expires_at)
            .build()
    }

    #[test]
    fn test_token_without_expiry_is_live() {
        assert!(token(None).is_live(Utc::now()));
    }

    #[test]
    fn test_expired_token_is_not_live() {
        let now = Utc::now();
        let t = token(Some(now - Duration::seconds(1)));
        assert!(!t.is_live(now));
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", token(None));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_identity_orders_by_kind_then_service() {
        let a = TokenIdentity::new("a".into(), "z:1".into());
        let b = TokenIdentity::new("b".into(), "a:1".into());
        assert!(a < b);
    }
}
