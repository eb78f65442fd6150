//! In-memory key provider.
//!
//! [`MemoryKeyProvider`] stands in for a remote KMS in tests and local
//! development. It does not encrypt anything: generated DEKs and their
//! "wrapped" material are random bytes, and the provider remembers which
//! DEK belongs to which EDEK so decryption returns the original key.
//!
//! # Fault injection
//!
//! | Control | Effect |
//! |---------|--------|
//! | [`set_unavailable`](MemoryKeyProvider::set_unavailable) | every call fails with a transient connection error |
//! | [`set_unauthorized`](MemoryKeyProvider::set_unauthorized) | every call fails with `Unauthorized` |
//! | [`stall`](MemoryKeyProvider::stall) / [`release`](MemoryKeyProvider::release) | calls block until released |
//! | [`set_latency`](MemoryKeyProvider::set_latency) | every call sleeps first |
//!
//! Clones share state, so a test can keep a handle while the pool owns
//! another.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use edek_tokens::{
    Credentials, DelegationTokenIssuer, Token, TokenKind, TokenResult, TokenService,
};
use fail::fail_point;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::Notify;
use zeroize::Zeroizing;

use crate::{
    error::{KmsError, KmsResult},
    provider::KeyProvider,
    types::{DataKey, EncryptedKeyVersion, KeyMetadata, KeyName, KeyVersionName},
};

/// Token kind issued by key providers.
pub const KMS_TOKEN_KIND: &str = "kms-dt";

/// Cipher reported for keys created without an explicit cipher.
pub const DEFAULT_CIPHER: &str = "AES/CTR/NoPadding";

/// Key length used for keys created without an explicit length.
pub const DEFAULT_BIT_LENGTH: u32 = 128;

const DEFAULT_SERVICE: &str = "localhost:9600";
const IV_LEN: usize = 16;

#[derive(Debug)]
struct StoredKey {
    cipher: String,
    bit_length: u32,
    description: Option<String>,
    created: DateTime<Utc>,
    versions: u32,
}

impl StoredKey {
    fn current_version(&self, name: &KeyName) -> KeyVersionName {
        KeyVersionName::for_version(name, self.versions.saturating_sub(1))
    }

    fn metadata(&self, name: &KeyName) -> KeyMetadata {
        KeyMetadata {
            cipher: self.cipher.clone(),
            bit_length: self.bit_length,
            current_version: self.current_version(name),
            versions: self.versions,
            description: self.description.clone(),
            created: self.created,
        }
    }
}

struct IssuedKey {
    material: Bytes,
    dek: Zeroizing<Vec<u8>>,
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    unauthorized: AtomicBool,
    stalled: AtomicBool,
    release: Notify,
    latency_ms: AtomicU64,
}

#[derive(Default)]
struct Counters {
    metadata_calls: AtomicU64,
    generate_calls: AtomicU64,
    generated_keys: AtomicU64,
    decrypt_calls: AtomicU64,
    tokens_issued: AtomicU64,
}

struct Inner {
    service: TokenService,
    require_token: AtomicBool,
    keys: RwLock<HashMap<KeyName, StoredKey>>,
    issued: RwLock<HashMap<(KeyVersionName, Bytes), IssuedKey>>,
    faults: Faults,
    counters: Counters,
}

/// An in-process KMS for tests and development.
///
/// # Example
///
/// ```
/// use edek_kms::{KeyName, KeyProvider, MemoryKeyProvider};
/// use edek_tokens::Credentials;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let kms = MemoryKeyProvider::new();
/// let key = KeyName::from("zone-key");
/// kms.create_key(&key).unwrap();
///
/// let edeks = kms.generate_encrypted_keys(&key, 3).await.unwrap();
/// assert_eq!(edeks.len(), 3);
///
/// let dek = kms.decrypt_encrypted_key(&edeks[0], &Credentials::new()).await.unwrap();
/// assert_eq!(dek.len(), 16);
/// # });
/// ```
#[derive(Clone)]
pub struct MemoryKeyProvider {
    inner: Arc<Inner>,
}

impl Default for MemoryKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryKeyProvider")
            .field("service", &self.inner.service)
            .field("keys", &self.inner.keys.read().len())
            .field("generate_calls", &self.generate_calls())
            .finish_non_exhaustive()
    }
}

impl MemoryKeyProvider {
    /// Creates an empty provider reachable as `localhost:9600`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SERVICE)
    }

    /// Creates an empty provider with the given service address.
    #[must_use]
    pub fn with_service(service: impl Into<TokenService>) -> Self {
        Self {
            inner: Arc::new(Inner {
                service: service.into(),
                require_token: AtomicBool::new(false),
                keys: RwLock::new(HashMap::new()),
                issued: RwLock::new(HashMap::new()),
                faults: Faults::default(),
                counters: Counters::default(),
            }),
        }
    }

    /// Requires a live delegation token for this service on decryption.
    #[must_use]
    pub fn requiring_delegation_token(self) -> Self {
        self.inner.require_token.store(true, Ordering::Relaxed);
        self
    }

    /// Returns the service address.
    #[must_use]
    pub fn service(&self) -> &TokenService {
        &self.inner.service
    }

    /// Registers a new key with the default cipher and length.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::InvalidRequest`] if the key already exists.
    pub fn create_key(&self, name: &KeyName) -> KmsResult<KeyMetadata> {
        self.create_key_with(name, DEFAULT_CIPHER, DEFAULT_BIT_LENGTH, None)
    }

    /// Registers a new key.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::InvalidRequest`] if the key already exists or
    /// `bit_length` is not a positive multiple of 8.
    pub fn create_key_with(
        &self,
        name: &KeyName,
        cipher: &str,
        bit_length: u32,
        description: Option<&str>,
    ) -> KmsResult<KeyMetadata> {
        if bit_length == 0 || bit_length % 8 != 0 {
            return Err(KmsError::invalid_request(format!(
                "bit length must be a positive multiple of 8, got {bit_length}"
            )));
        }

        let mut keys = self.inner.keys.write();
        if keys.contains_key(name) {
            return Err(KmsError::invalid_request(format!("Key already exists: {name}")));
        }

        let stored = StoredKey {
            cipher: cipher.to_owned(),
            bit_length,
            description: description.map(str::to_owned),
            created: Utc::now(),
            versions: 1,
        };
        let metadata = stored.metadata(name);
        keys.insert(name.clone(), stored);

        tracing::debug!(key = %name, "created key");
        Ok(metadata)
    }

    /// Adds a new version to `name` and makes it current.
    ///
    /// EDEKs generated afterwards are wrapped under the new version; existing
    /// EDEKs stay decryptable.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::KeyNotFound`] if the key does not exist.
    pub fn roll_new_version(&self, name: &KeyName) -> KmsResult<KeyVersionName> {
        let mut keys = self.inner.keys.write();
        let stored = keys.get_mut(name).ok_or_else(|| KmsError::key_not_found(name.as_str()))?;
        stored.versions += 1;
        let version = stored.current_version(name);

        tracing::debug!(key = %name, %version, "rolled key version");
        Ok(version)
    }

    /// Deletes `name`. Returns `true` if the key existed.
    pub fn delete_key(&self, name: &KeyName) -> bool {
        self.inner.keys.write().remove(name).is_some()
    }

    /// Makes every call fail with a transient connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes every call fail with `Unauthorized`.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.inner.faults.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    /// Blocks every call until [`release`](Self::release) is invoked.
    pub fn stall(&self) {
        self.inner.faults.stalled.store(true, Ordering::SeqCst);
    }

    /// Unblocks stalled calls.
    pub fn release(&self) {
        self.inner.faults.stalled.store(false, Ordering::SeqCst);
        self.inner.faults.release.notify_waiters();
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.faults.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of `get_metadata` calls received.
    #[must_use]
    pub fn metadata_calls(&self) -> u64 {
        self.inner.counters.metadata_calls.load(Ordering::Relaxed)
    }

    /// Number of generate batches received, including failed ones.
    #[must_use]
    pub fn generate_calls(&self) -> u64 {
        self.inner.counters.generate_calls.load(Ordering::Relaxed)
    }

    /// Number of EDEKs handed out.
    #[must_use]
    pub fn generated_keys(&self) -> u64 {
        self.inner.counters.generated_keys.load(Ordering::Relaxed)
    }

    /// Number of decrypt calls received.
    #[must_use]
    pub fn decrypt_calls(&self) -> u64 {
        self.inner.counters.decrypt_calls.load(Ordering::Relaxed)
    }

    /// Number of delegation tokens issued.
    #[must_use]
    pub fn tokens_issued(&self) -> u64 {
        self.inner.counters.tokens_issued.load(Ordering::Relaxed)
    }

    /// Applies latency, stalls and injected failures.
    async fn before_call(&self) -> KmsResult<()> {
        let faults = &self.inner.faults;

        let latency = faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        loop {
            let released = faults.release.notified();
            if !faults.stalled.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }

        if faults.unavailable.load(Ordering::SeqCst) {
            return Err(KmsError::connection("key provider unavailable"));
        }
        if faults.unauthorized.load(Ordering::SeqCst) {
            return Err(KmsError::unauthorized("caller is not allowed to use the key provider"));
        }
        Ok(())
    }

    fn check_token(&self, credentials: &Credentials) -> KmsResult<()> {
        if !self.inner.require_token.load(Ordering::Relaxed) {
            return Ok(());
        }
        let live = credentials
            .live_token_for_service(&self.inner.service, Utc::now())
            .is_some_and(|token| token.kind.as_str() == KMS_TOKEN_KIND);
        if live {
            Ok(())
        } else {
            Err(KmsError::unauthorized(format!(
                "no live delegation token for {}",
                self.inner.service
            )))
        }
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(&mut bytes[..]);
    bytes
}

#[async_trait]
impl KeyProvider for MemoryKeyProvider {
    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn get_metadata(&self, key: &KeyName) -> KmsResult<KeyMetadata> {
        self.inner.counters.metadata_calls.fetch_add(1, Ordering::Relaxed);
        self.before_call().await?;

        self.inner
            .keys
            .read()
            .get(key)
            .map(|stored| stored.metadata(key))
            .ok_or_else(|| KmsError::key_not_found(key.as_str()))
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn generate_encrypted_keys(
        &self,
        key: &KeyName,
        count: usize,
    ) -> KmsResult<Vec<EncryptedKeyVersion>> {
        self.inner.counters.generate_calls.fetch_add(1, Ordering::Relaxed);
        fail_point!("memory-kms-generate", |_| {
            Err(KmsError::connection("injected failure in generate"))
        });
        self.before_call().await?;

        let (version, dek_len) = {
            let keys = self.inner.keys.read();
            let stored = keys.get(key).ok_or_else(|| KmsError::key_not_found(key.as_str()))?;
            (stored.current_version(key), (stored.bit_length / 8) as usize)
        };

        let mut edeks = Vec::with_capacity(count);
        let mut issued = self.inner.issued.write();
        for _ in 0..count {
            let iv = Bytes::from(random_bytes(IV_LEN));
            let material = Bytes::from(random_bytes(dek_len));
            let dek = Zeroizing::new(random_bytes(dek_len));

            issued.insert(
                (version.clone(), iv.clone()),
                IssuedKey { material: material.clone(), dek },
            );
            edeks.push(EncryptedKeyVersion::new(key.clone(), version.clone(), iv, material));
        }
        drop(issued);

        self.inner.counters.generated_keys.fetch_add(count as u64, Ordering::Relaxed);
        tracing::debug!(count, %version, "generated encrypted keys");
        Ok(edeks)
    }

    #[tracing::instrument(skip(self, edek, credentials), fields(version = %edek.key_version_name))]
    async fn decrypt_encrypted_key(
        &self,
        edek: &EncryptedKeyVersion,
        credentials: &Credentials,
    ) -> KmsResult<DataKey> {
        self.inner.counters.decrypt_calls.fetch_add(1, Ordering::Relaxed);
        self.before_call().await?;
        self.check_token(credentials)?;

        if !self.inner.keys.read().contains_key(&edek.key_name) {
            return Err(KmsError::key_not_found(edek.key_name.as_str()));
        }

        let issued = self.inner.issued.read();
        match issued.get(&(edek.key_version_name.clone(), edek.iv.clone())) {
            Some(entry) if entry.material == edek.encrypted_key_material => {
                Ok(DataKey::new(edek.key_version_name.clone(), entry.dek.to_vec()))
            },
            _ => Err(KmsError::invalid_request(format!(
                "encrypted key was not issued under {}",
                edek.key_version_name
            ))),
        }
    }
}

#[async_trait]
impl DelegationTokenIssuer for MemoryKeyProvider {
    fn token_kind(&self) -> TokenKind {
        TokenKind::from(KMS_TOKEN_KIND)
    }

    fn canonical_service_name(&self) -> Option<TokenService> {
        Some(self.inner.service.clone())
    }

    #[tracing::instrument(skip(self), fields(service = %self.inner.service))]
    async fn issue_delegation_token(&self, renewer: &str) -> TokenResult<Token> {
        if let Err(err) = self.before_call().await {
            return Err(match err {
                KmsError::Unauthorized { message } => {
                    edek_tokens::TokenError::unauthorized(self.inner.service.clone(), message)
                },
                other => edek_tokens::TokenError::issuance_with_source(
                    self.inner.service.clone(),
                    "key provider refused token request",
                    other,
                ),
            });
        }

        let sequence = self.inner.counters.tokens_issued.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Token::builder()
            .kind(KMS_TOKEN_KIND)
            .service(self.inner.service.clone())
            .identifier(Bytes::from(format!("kms:{renewer}:{sequence}")))
            .password(random_bytes(20))
            .renewer(renewer)
            .build())
    }
}
