//! The key provider boundary.

use std::sync::Arc;

use async_trait::async_trait;
use edek_tokens::Credentials;

use crate::{
    error::{KmsError, KmsResult},
    types::{DataKey, EncryptedKeyVersion, KeyMetadata, KeyName},
};

/// Transport to a key management service.
///
/// Implementations are stateless per call: every method is one round trip
/// (plus retries) and nothing is cached. Caching lives in the pool.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Fetches metadata for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::KeyNotFound`] for an unknown key, or a transport
    /// error.
    async fn get_metadata(&self, key: &KeyName) -> KmsResult<KeyMetadata>;

    /// Requests `count` freshly generated EDEKs for `key`.
    ///
    /// The KMS may deliver fewer or more keys than requested; callers cap
    /// what they keep.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::KeyNotFound`] for an unknown key,
    /// [`KmsError::Unauthorized`] if the caller may not use it, or a
    /// transport error.
    async fn generate_encrypted_keys(
        &self,
        key: &KeyName,
        count: usize,
    ) -> KmsResult<Vec<EncryptedKeyVersion>>;

    /// Requests a single EDEK for `key`.
    ///
    /// # Errors
    ///
    /// Same as [`generate_encrypted_keys`](Self::generate_encrypted_keys),
    /// plus [`KmsError::InvalidResponse`] if the KMS returned no key.
    async fn generate_encrypted_key(&self, key: &KeyName) -> KmsResult<EncryptedKeyVersion> {
        self.generate_encrypted_keys(key, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KmsError::invalid_response(format!("no key generated for {key}")))
    }

    /// Unwraps `edek` on behalf of the holder of `credentials`.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Unauthorized`] if the credentials do not allow
    /// decryption, [`KmsError::InvalidRequest`] if the EDEK was not produced
    /// by this KMS, or a transport error.
    async fn decrypt_encrypted_key(
        &self,
        edek: &EncryptedKeyVersion,
        credentials: &Credentials,
    ) -> KmsResult<DataKey>;
}

#[async_trait]
impl<P: KeyProvider + ?Sized> KeyProvider for Arc<P> {
    async fn get_metadata(&self, key: &KeyName) -> KmsResult<KeyMetadata> {
        (**self).get_metadata(key).await
    }

    async fn generate_encrypted_keys(
        &self,
        key: &KeyName,
        count: usize,
    ) -> KmsResult<Vec<EncryptedKeyVersion>> {
        (**self).generate_encrypted_keys(key, count).await
    }

    async fn generate_encrypted_key(&self, key: &KeyName) -> KmsResult<EncryptedKeyVersion> {
        (**self).generate_encrypted_key(key).await
    }

    async fn decrypt_encrypted_key(
        &self,
        edek: &EncryptedKeyVersion,
        credentials: &Credentials,
    ) -> KmsResult<DataKey> {
        (**self).decrypt_encrypted_key(edek, credentials).await
    }
}
