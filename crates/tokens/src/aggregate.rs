//! Delegation token aggregation across downstream services.
//!
//! A client asking for delegation tokens gets one token per service the
//! filesystem depends on. The aggregator walks the issuer tree
//! (filesystem first, then its additional issuers such as the key
//! provider), asks each issuer for a token only when the caller's
//! credentials do not already hold a live token for that identity, and
//! adds every new token to the credentials.
//!
//! ```text
//! add_delegation_tokens(renewer, creds)
//!   └─ filesystem issuer ── live token in creds? ── yes → skip
//!        │                                      └─ no  → issue, add, report
//!        └─ key provider issuer ── (same check)
//! ```
//!
//! Per-service failures never abort the walk.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    credentials::Credentials,
    error::TokenError,
    issuer::DelegationTokenIssuer,
    types::{Token, TokenIdentity},
};

/// Upper bound on issuers visited in one aggregation call.
///
/// Guards against cycles in misconfigured issuer trees.
pub const MAX_ISSUERS: usize = 64;

/// A service whose token could not be obtained.
#[derive(Debug)]
pub struct IssuerFailure {
    /// Identity of the failing service.
    pub identity: TokenIdentity,
    /// Why the token could not be obtained.
    pub error: TokenError,
}

/// Outcome of one aggregation call.
#[derive(Debug, Default)]
pub struct TokenCollection {
    /// Tokens issued and added to the credentials during this call.
    pub issued: Vec<Token>,
    /// Services skipped because the credentials already held a live token.
    pub skipped: Vec<TokenIdentity>,
    /// Services whose issuance failed.
    pub failures: Vec<IssuerFailure>,
}

/// Collects tokens for `issuer` and all of its additional issuers.
///
/// Each newly issued token is added to `credentials` before the next issuer
/// is visited, so two issuers announcing the same identity produce at most
/// one token. Expired tokens are replaced.
#[tracing::instrument(skip(issuer, credentials), fields(existing = credentials.number_of_tokens()))]
pub async fn collect_delegation_tokens(
    issuer: &dyn DelegationTokenIssuer,
    renewer: &str,
    credentials: &mut Credentials,
) -> TokenCollection {
    let mut collection = TokenCollection::default();

    visit(issuer, renewer, credentials, &mut collection).await;

    let mut stack: Vec<Arc<dyn DelegationTokenIssuer>> =
        issuer.additional_issuers().into_iter().rev().collect();
    let mut visited = 1usize;

    while let Some(next) = stack.pop() {
        if visited >= MAX_ISSUERS {
            tracing::warn!(max = MAX_ISSUERS, "issuer limit reached, stopping token collection");
            break;
        }
        visited += 1;

        visit(next.as_ref(), renewer, credentials, &mut collection).await;
        stack.extend(next.additional_issuers().into_iter().rev());
    }

    tracing::debug!(
        issued = collection.issued.len(),
        skipped = collection.skipped.len(),
        failed = collection.failures.len(),
        "delegation token collection complete"
    );

    collection
}

/// Adds delegation tokens for every downstream service to `credentials`.
///
/// Returns only the tokens issued by this call; a second call with the same
/// credentials returns an empty list. Failures are logged and otherwise
/// ignored; use [`collect_delegation_tokens`] to inspect them.
pub async fn add_delegation_tokens(
    issuer: &dyn DelegationTokenIssuer,
    renewer: &str,
    credentials: &mut Credentials,
) -> Vec<Token> {
    collect_delegation_tokens(issuer, renewer, credentials).await.issued
}

async fn visit(
    issuer: &dyn DelegationTokenIssuer,
    renewer: &str,
    credentials: &mut Credentials,
    collection: &mut TokenCollection,
) {
    let Some(service) = issuer.canonical_service_name() else {
        return;
    };
    let identity = TokenIdentity::new(issuer.token_kind(), service);

    if credentials.has_live_token(&identity, Utc::now()) {
        tracing::debug!(%identity, "live token already present");
        collection.skipped.push(identity);
        return;
    }

    match issuer.issue_delegation_token(renewer).await {
        Ok(token) if token.identity() == identity => {
            tracing::debug!(%identity, "issued delegation token");
            credentials.add_token(token.clone());
            collection.issued.push(token);
        },
        Ok(token) => {
            let error = TokenError::IdentityMismatch {
                expected: identity.clone(),
                actual: token.identity(),
            };
            tracing::warn!(%identity, error = %error, "discarding token with unexpected identity");
            collection.failures.push(IssuerFailure { identity, error });
        },
        Err(error) => {
            tracing::warn!(%identity, error = %error, "failed to obtain delegation token");
            collection.failures.push(IssuerFailure { identity, error });
        },
    }
}
