//! Delegation token issuers.
//!
//! An issuer is one downstream service that can mint delegation tokens:
//! the filesystem itself, a key provider, or any other dependency. Issuers
//! form a tree through [`DelegationTokenIssuer::additional_issuers`], which
//! the aggregator walks depth-first.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use rand::Rng;

use crate::{
    error::TokenResult,
    types::{Token, TokenKind, TokenService},
};

/// Length of the random secret attached to locally issued tokens.
const PASSWORD_LEN: usize = 20;

/// A downstream service that can issue delegation tokens.
#[async_trait]
pub trait DelegationTokenIssuer: Send + Sync {
    /// The kind of tokens this issuer produces.
    fn token_kind(&self) -> TokenKind;

    /// The canonical service address tokens are bound to.
    ///
    /// `None` means the service does not issue tokens; the aggregator skips
    /// it but still visits its additional issuers.
    fn canonical_service_name(&self) -> Option<TokenService>;

    /// Requests a new token that `renewer` may renew.
    ///
    /// # Errors
    ///
    /// Returns a [`TokenError`](crate::TokenError) when the service refuses
    /// or fails to issue a token.
    async fn issue_delegation_token(&self, renewer: &str) -> TokenResult<Token>;

    /// Issuers of services this one depends on.
    fn additional_issuers(&self) -> Vec<Arc<dyn DelegationTokenIssuer>> {
        Vec::new()
    }
}

impl std::fmt::Debug for dyn DelegationTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationTokenIssuer")
            .field("kind", &self.token_kind())
            .field("service", &self.canonical_service_name())
            .finish()
    }
}

/// Issues tokens for a service hosted in this process.
///
/// Identifiers encode `owner:renewer:sequence:issue_millis`; passwords are
/// random bytes. A configured lifetime sets `expires_at`.
///
/// # Example
///
/// ```
/// use edek_tokens::{DelegationTokenIssuer, LocalTokenIssuer};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let issuer = LocalTokenIssuer::new("FS_DELEGATION_TOKEN", "nn1:8020", "hdfs");
/// let token = issuer.issue_delegation_token("JobTracker").await.unwrap();
/// assert_eq!(token.service.as_str(), "nn1:8020");
/// # });
/// ```
#[derive(Debug)]
pub struct LocalTokenIssuer {
    kind: TokenKind,
    service: TokenService,
    owner: String,
    lifetime: Option<Duration>,
    sequence: AtomicU64,
    children: Vec<Arc<dyn DelegationTokenIssuer>>,
}

impl LocalTokenIssuer {
    /// Creates an issuer for `service` whose tokens never expire on their own.
    #[must_use]
    pub fn new(
        kind: impl Into<TokenKind>,
        service: impl Into<TokenService>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            service: service.into(),
            owner: owner.into(),
            lifetime: None,
            sequence: AtomicU64::new(0),
            children: Vec::new(),
        }
    }

    /// Sets the lifetime of issued tokens.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Adds an issuer for a service this one depends on.
    #[must_use]
    pub fn with_additional_issuer(mut self, issuer: Arc<dyn DelegationTokenIssuer>) -> Self {
        self.children.push(issuer);
        self
    }

    /// Returns the number of tokens issued so far.
    #[must_use]
    pub fn issued_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DelegationTokenIssuer for LocalTokenIssuer {
    fn token_kind(&self) -> TokenKind {
        self.kind.clone()
    }

    fn canonical_service_name(&self) -> Option<TokenService> {
        Some(self.service.clone())
    }

    #[tracing::instrument(skip(self), fields(service = %self.service))]
    async fn issue_delegation_token(&self, renewer: &str) -> TokenResult<Token> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let issued_at = Utc::now();
        let identifier =
            format!("{}:{renewer}:{sequence}:{}", self.owner, issued_at.timestamp_millis());

        let mut password = vec![0u8; PASSWORD_LEN];
        rand::rng().fill(&mut password[..]);

        tracing::debug!(sequence, "issued local delegation token");

        Ok(Token::builder()
            .kind(self.kind.clone())
            .service(self.service.clone())
            .identifier(Bytes::from(identifier))
            .password(password)
            .renewer(renewer)
            .issued_at(issued_at)
            .maybe_expires_at(self.lifetime.map(|lifetime| issued_at + lifetime))
            .build())
    }

    fn additional_issuers(&self) -> Vec<Arc<dyn DelegationTokenIssuer>> {
        self.children.clone()
    }
}
