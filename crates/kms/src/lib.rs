//! # EDEK Pool Key Provider
//!
//! The boundary between the EDEK pool and a key management service.
//!
//! This crate provides:
//! - **Key provider trait**: [`KeyProvider`] for metadata, batch EDEK generation and decryption
//! - **HTTP client**: [`KmsClient`] for a KMS REST API, with retry on transient failures
//! - **In-memory provider**: [`MemoryKeyProvider`] with key rotation and fault injection
//!
//! Both providers are also [`DelegationTokenIssuer`](edek_tokens::DelegationTokenIssuer)s for
//! their service, so a filesystem can hand out KMS tokens with its own.
//!
//! ## Example
//!
//! ```
//! use edek_kms::{KeyName, KeyProvider, MemoryKeyProvider};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let kms = MemoryKeyProvider::new();
//! kms.create_key(&KeyName::from("zone-key")).unwrap();
//!
//! let metadata = kms.get_metadata(&KeyName::from("zone-key")).await.unwrap();
//! assert_eq!(metadata.current_version.as_str(), "zone-key@0");
//! # });
//! ```
//!
//! ## Features
//!
//! - **`testutil`**: Enables the `testutil` module with provider fixtures and synthetic EDEKs
//! - **`failpoints`**: Enables fail-point injection in retry and generation paths

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// HTTP client configuration.
pub mod config;
/// Key provider error types.
pub mod error;
/// HTTP transport to a KMS.
pub mod http;
/// In-memory key provider.
pub mod memory;
/// The key provider trait.
pub mod provider;
/// Retry policy for KMS calls.
pub mod retry;
/// Key provider value types.
pub mod types;

/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, KmsClientConfig};
pub use error::{BoxError, ConfigError, KmsError, KmsResult};
pub use http::KmsClient;
pub use memory::{DEFAULT_BIT_LENGTH, DEFAULT_CIPHER, KMS_TOKEN_KIND, MemoryKeyProvider};
pub use provider::KeyProvider;
pub use retry::RetryConfig;
pub use types::{DataKey, EncryptedKeyVersion, KeyMetadata, KeyName, KeyVersionName};
