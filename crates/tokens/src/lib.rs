//! # EDEK Pool Delegation Tokens
//!
//! Delegation token model and multi-service token aggregation.
//!
//! This crate provides:
//! - **Token model**: [`Token`], [`TokenIdentity`] and the caller-owned [`Credentials`]
//! - **Issuers**: the [`DelegationTokenIssuer`] trait and an in-process [`LocalTokenIssuer`]
//! - **Aggregation**: [`add_delegation_tokens`] walks an issuer tree and fills in the tokens a
//!   caller is missing
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use edek_tokens::{Credentials, LocalTokenIssuer, add_delegation_tokens};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let kms = Arc::new(LocalTokenIssuer::new("kms-dt", "kms1:9600", "kms"));
//! let fs = LocalTokenIssuer::new("FS_DELEGATION_TOKEN", "nn1:8020", "hdfs")
//!     .with_additional_issuer(kms);
//!
//! let mut creds = Credentials::new();
//! let issued = add_delegation_tokens(&fs, "JobTracker", &mut creds).await;
//! assert_eq!(issued.len(), 2);
//!
//! // Nothing is missing the second time around.
//! let issued = add_delegation_tokens(&fs, "JobTracker", &mut creds).await;
//! assert!(issued.is_empty());
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Multi-service token aggregation.
pub mod aggregate;
/// Caller-owned token container.
pub mod credentials;
/// Token error types.
pub mod error;
/// Token issuers.
pub mod issuer;
/// Token types.
pub mod types;

pub use aggregate::{
    IssuerFailure, MAX_ISSUERS, TokenCollection, add_delegation_tokens, collect_delegation_tokens,
};
pub use credentials::Credentials;
pub use error::{BoxError, TokenError, TokenResult};
pub use issuer::{DelegationTokenIssuer, LocalTokenIssuer};
pub use types::{Token, TokenIdentity, TokenKind, TokenService};
