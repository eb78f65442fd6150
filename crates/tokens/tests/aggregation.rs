//! Delegation token aggregation across a filesystem and its key provider.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use async_trait::async_trait;
use edek_tokens::{
    Credentials, DelegationTokenIssuer, LocalTokenIssuer, Token, TokenError, TokenKind,
    TokenResult, TokenService, add_delegation_tokens, collect_delegation_tokens,
};

const RENEWER: &str = "JobTracker";

fn filesystem(kms: Arc<LocalTokenIssuer>) -> LocalTokenIssuer {
    LocalTokenIssuer::new("FS_DELEGATION_TOKEN", "nn1:8020", "hdfs").with_additional_issuer(kms)
}

fn kms() -> Arc<LocalTokenIssuer> {
    Arc::new(LocalTokenIssuer::new("kms-dt", "kms1:9600", "kms"))
}

#[tokio::test]
async fn test_repeat_call_issues_nothing_new() {
    let kms = kms();
    let fs = filesystem(Arc::clone(&kms));
    let mut creds = Credentials::new();

    let first = add_delegation_tokens(&fs, RENEWER, &mut creds).await;
    assert_eq!(first.len(), 2);
    assert_eq!(creds.number_of_tokens(), 2);

    let second = add_delegation_tokens(&fs, RENEWER, &mut creds).await;
    assert!(second.is_empty());
    assert_eq!(creds.number_of_tokens(), 2);
    assert_eq!(kms.issued_count(), 1);
    assert_eq!(fs.issued_count(), 1);
}

#[tokio::test]
async fn test_tokens_cover_both_services() {
    let fs = filesystem(kms());
    let mut creds = Credentials::new();

    let issued = add_delegation_tokens(&fs, RENEWER, &mut creds).await;
    let mut services: Vec<_> = issued.iter().map(|t| t.service.to_string()).collect();
    services.sort();

    assert_eq!(services, vec!["kms1:9600", "nn1:8020"]);
    assert!(issued.iter().all(|t| t.renewer == RENEWER));
}

#[tokio::test]
async fn test_preexisting_kms_token_is_kept() {
    let kms = kms();
    let fs = filesystem(Arc::clone(&kms));
    let mut creds = Credentials::new();
    let existing = kms.issue_delegation_token(RENEWER).await.unwrap();
    creds.add_token(existing.clone());

    let issued = add_delegation_tokens(&fs, RENEWER, &mut creds).await;

    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].service.as_str(), "nn1:8020");
    assert_eq!(creds.token(&existing.identity()), Some(&existing));
}

/// Key provider that is down.
struct UnreachableKms;

#[async_trait]
impl DelegationTokenIssuer for UnreachableKms {
    fn token_kind(&self) -> TokenKind {
        TokenKind::from("kms-dt")
    }

    fn canonical_service_name(&self) -> Option<TokenService> {
        Some(TokenService::from("kms1:9600"))
    }

    async fn issue_delegation_token(&self, _renewer: &str) -> TokenResult<Token> {
        Err(TokenError::issuance("kms1:9600", "connection refused"))
    }
}

#[tokio::test]
async fn test_unreachable_kms_still_yields_filesystem_token() {
    let fs = LocalTokenIssuer::new("FS_DELEGATION_TOKEN", "nn1:8020", "hdfs")
        .with_additional_issuer(Arc::new(UnreachableKms));
    let mut creds = Credentials::new();

    let collection = collect_delegation_tokens(&fs, RENEWER, &mut creds).await;

    assert_eq!(collection.issued.len(), 1);
    assert_eq!(collection.failures.len(), 1);
    assert_eq!(collection.failures[0].identity.service.as_str(), "kms1:9600");
    assert_eq!(creds.number_of_tokens(), 1);

    // The failed service is retried on the next call.
    let retry = collect_delegation_tokens(&fs, RENEWER, &mut creds).await;
    assert!(retry.issued.is_empty());
    assert_eq!(retry.failures.len(), 1);
    assert_eq!(retry.skipped.len(), 1);
}

#[tokio::test]
async fn test_nested_issuers_are_walked() {
    let inner = Arc::new(LocalTokenIssuer::new("kms-dt", "kms2:9600", "kms"));
    let outer = Arc::new(
        LocalTokenIssuer::new("kms-dt", "kms1:9600", "kms").with_additional_issuer(inner.clone()),
    );
    let fs = filesystem(outer);
    let mut creds = Credentials::new();

    let issued = add_delegation_tokens(&fs, RENEWER, &mut creds).await;

    assert_eq!(issued.len(), 3);
    assert_eq!(inner.issued_count(), 1);
}
