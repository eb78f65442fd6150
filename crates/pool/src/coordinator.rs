//! Filesystem coordinator facade.
//!
//! The [`Coordinator`] is the piece of a filesystem coordinator that the
//! pool serves: it owns the zone table, creates files in encryption zones,
//! warms the pool at startup and hands out delegation tokens for itself and
//! its KMS. Namespace and block management live elsewhere.

use std::sync::Arc;

use async_trait::async_trait;
use edek_kms::{DataKey, EncryptedKeyVersion, KeyMetadata, KeyName, KeyProvider};
use edek_tokens::{
    Credentials, DelegationTokenIssuer, LocalTokenIssuer, Token, TokenCollection, TokenKind,
    TokenResult, TokenService,
};
use tokio::task::JoinHandle;

use crate::{
    config::{ConfigError, CoordinatorConfig},
    error::{PoolError, PoolResult},
    pool::EdekPool,
    warmer::{QueueWarmer, WarmupReport},
    zones::{EncryptionZone, EncryptionZoneRegistry, MemoryZoneRegistry},
};

/// Token kind of the coordinator's own delegation tokens.
pub const FS_DELEGATION_TOKEN_KIND: &str = "FS_DELEGATION_TOKEN";

/// Encryption parameters of a newly created file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEncryptionInfo {
    /// The created file.
    pub path: String,
    /// The zone the file lives in.
    pub zone: EncryptionZone,
    /// The file's wrapped data-encryption key.
    pub edek: EncryptedKeyVersion,
}

/// Coordinator facade over an [`EdekPool`].
pub struct Coordinator {
    config: CoordinatorConfig,
    provider: Arc<dyn KeyProvider>,
    zones: Arc<MemoryZoneRegistry>,
    pool: Arc<EdekPool>,
    tokens: LocalTokenIssuer,
    warmup: tokio::sync::Mutex<Option<JoinHandle<PoolResult<WarmupReport>>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("service", &self.config.service())
            .field("zones", &self.zones.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Starts a coordinator.
    ///
    /// Builds the pool and spawns the queue warmer over `zones`, which
    /// persists across restarts while the pool does not. When
    /// `kms_token_issuer` is set, delegation token requests also collect a
    /// token for the KMS.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Config`] if `config` fails validation.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn start(
        config: CoordinatorConfig,
        provider: Arc<dyn KeyProvider>,
        zones: Arc<MemoryZoneRegistry>,
        kms_token_issuer: Option<Arc<dyn DelegationTokenIssuer>>,
    ) -> PoolResult<Self> {
        config.validate()?;

        let mut tokens =
            LocalTokenIssuer::new(FS_DELEGATION_TOKEN_KIND, config.service(), config.owner());
        if let Some(lifetime) = config.token_lifetime() {
            let lifetime = chrono::Duration::from_std(lifetime).map_err(|_| {
                ConfigError::Invalid { field: "token_lifetime", message: "out of range".into() }
            })?;
            tokens = tokens.with_lifetime(lifetime);
        }
        if let Some(kms) = kms_token_issuer {
            tokens = tokens.with_additional_issuer(kms);
        }

        let pool = Arc::new(EdekPool::new(config.pool().clone(), Arc::clone(&provider))?);
        let registry: Arc<dyn EncryptionZoneRegistry> = zones.clone();
        let warmup =
            QueueWarmer::new(Arc::clone(&pool), registry, config.warmup().clone()).spawn();

        tracing::info!(service = config.service(), zones = zones.len(), "coordinator started");
        Ok(Self {
            config,
            provider,
            zones,
            pool,
            tokens,
            warmup: tokio::sync::Mutex::new(Some(warmup)),
        })
    }

    /// Creates an encryption zone at `path` under `key`.
    ///
    /// The key must exist in the KMS. The zone's queue is filled before this
    /// returns; a failed fill is logged and left to the background refill.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Kms`] or [`PoolError::Timeout`] if the key cannot be
    ///   looked up
    /// - [`PoolError::InvalidZone`] if `path` overlaps an existing zone
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn create_encryption_zone(
        &self,
        path: &str,
        key: &KeyName,
    ) -> PoolResult<EncryptionZone> {
        let metadata = self.key_metadata(key).await?;
        let zone = self.zones.create_zone(path, key.clone())?;
        tracing::info!(
            cipher = %metadata.cipher,
            bit_length = metadata.bit_length,
            version = %metadata.current_version,
            "created encryption zone",
        );

        if let Err(err) = self.pool.ensure_filled(key).await {
            tracing::warn!(error = %err, "failed to warm new encryption zone key");
        }
        Ok(zone)
    }

    /// Creates a file, returning its encryption parameters if `path` lies in
    /// an encryption zone and `None` otherwise.
    ///
    /// # Errors
    ///
    /// Errors from [`EdekPool::get_or_generate`] when the zone's queue is
    /// empty and the direct KMS request fails.
    #[tracing::instrument(skip(self))]
    pub async fn create_file(&self, path: &str) -> PoolResult<Option<FileEncryptionInfo>> {
        let Some(zone) = self.zones.zone_for_path(path) else {
            return Ok(None);
        };
        let edek = self.pool.get_or_generate(&zone.key_name).await?;
        Ok(Some(FileEncryptionInfo { path: path.to_owned(), zone, edek }))
    }

    /// Unwraps a file's data-encryption key on behalf of `credentials`.
    ///
    /// # Errors
    ///
    /// [`PoolError::Kms`] if the KMS refuses, [`PoolError::Timeout`] if it
    /// does not answer within `kms_timeout`.
    pub async fn decrypt_file_key(
        &self,
        info: &FileEncryptionInfo,
        credentials: &Credentials,
    ) -> PoolResult<DataKey> {
        let key = info.edek.key_name.as_str();
        let timeout = self.config.pool().kms_timeout();
        tokio::time::timeout(timeout, self.provider.decrypt_encrypted_key(&info.edek, credentials))
            .await
            .map_err(|_| PoolError::timeout(key, timeout))?
            .map_err(|err| PoolError::kms(key, err))
    }

    /// Adds tokens for this filesystem and its KMS to `credentials`,
    /// returning the newly issued ones.
    pub async fn add_delegation_tokens(
        &self,
        renewer: &str,
        credentials: &mut Credentials,
    ) -> Vec<Token> {
        self.collect_delegation_tokens(renewer, credentials).await.issued
    }

    /// Like [`add_delegation_tokens`](Self::add_delegation_tokens), also
    /// reporting skipped services and per-service failures.
    pub async fn collect_delegation_tokens(
        &self,
        renewer: &str,
        credentials: &mut Credentials,
    ) -> TokenCollection {
        edek_tokens::collect_delegation_tokens(self, renewer, credentials).await
    }

    /// Number of EDEKs queued for `key`.
    #[must_use]
    pub fn key_queue_size(&self, key: &KeyName) -> usize {
        self.pool.size(key)
    }

    /// Returns the zone registry.
    #[must_use]
    pub fn zones(&self) -> &Arc<MemoryZoneRegistry> {
        &self.zones
    }

    /// Returns the pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<EdekPool> {
        &self.pool
    }

    /// Waits for the startup warmup and returns its report.
    ///
    /// Returns an empty report if the warmup was already awaited.
    ///
    /// # Errors
    ///
    /// - [`PoolError::ShuttingDown`] if shutdown interrupted the warmup
    /// - [`PoolError::ZoneRegistry`] if the zones could not be listed
    /// - [`PoolError::Background`] if the warmup task panicked
    pub async fn wait_for_warmup(&self) -> PoolResult<WarmupReport> {
        let handle = self.warmup.lock().await.take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|err| PoolError::Background { message: err.to_string() })?,
            None => Ok(WarmupReport::default()),
        }
    }

    /// Stops the warmer and the pool.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        let handle = self.warmup.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "warmup task panicked");
            }
        }
        tracing::info!(service = self.config.service(), "coordinator stopped");
    }

    async fn key_metadata(&self, key: &KeyName) -> PoolResult<KeyMetadata> {
        let timeout = self.config.pool().kms_timeout();
        tokio::time::timeout(timeout, self.provider.get_metadata(key))
            .await
            .map_err(|_| PoolError::timeout(key.as_str(), timeout))?
            .map_err(|err| PoolError::kms(key.as_str(), err))
    }
}

#[async_trait]
impl DelegationTokenIssuer for Coordinator {
    fn token_kind(&self) -> TokenKind {
        self.tokens.token_kind()
    }

    fn canonical_service_name(&self) -> Option<TokenService> {
        self.tokens.canonical_service_name()
    }

    async fn issue_delegation_token(&self, renewer: &str) -> TokenResult<Token> {
        self.tokens.issue_delegation_token(renewer).await
    }

    fn additional_issuers(&self) -> Vec<Arc<dyn DelegationTokenIssuer>> {
        self.tokens.additional_issuers()
    }
}
