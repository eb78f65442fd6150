//! Shared test utilities for key provider tests.
//!
//! Feature-gated behind `testutil`. Enable it in a dependent crate's
//! dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! edek-kms = { path = "../kms", features = ["testutil"] }
//! ```

use bytes::Bytes;

use crate::{
    memory::MemoryKeyProvider,
    types::{EncryptedKeyVersion, KeyName, KeyVersionName},
};

/// Creates a [`MemoryKeyProvider`] with the given keys registered.
///
/// # Panics
///
/// Panics if a key name is repeated.
#[must_use]
#[allow(clippy::expect_used)]
pub fn provider_with_keys(keys: &[&str]) -> MemoryKeyProvider {
    let provider = MemoryKeyProvider::new();
    for key in keys {
        provider.create_key(&KeyName::from(*key)).expect("duplicate test key");
    }
    provider
}

/// Builds a synthetic EDEK for `key` whose IV and material encode `index`.
///
/// The result is not decryptable; it is meant for queue tests that never
/// talk to a provider.
#[must_use]
pub fn synthetic_edek(key: &str, index: u32) -> EncryptedKeyVersion {
    let key = KeyName::from(key);
    let version = KeyVersionName::for_version(&key, 0);
    let bytes = index.to_be_bytes();
    EncryptedKeyVersion::new(
        key,
        version,
        Bytes::copy_from_slice(&bytes),
        Bytes::copy_from_slice(&bytes),
    )
}

/// Builds `count` synthetic EDEKs for `key`, numbered from `start`.
#[must_use]
pub fn synthetic_edeks(key: &str, start: u32, count: u32) -> Vec<EncryptedKeyVersion> {
    (start..start + count).map(|index| synthetic_edek(key, index)).collect()
}
