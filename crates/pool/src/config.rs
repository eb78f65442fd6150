//! Pool, warmup and coordinator configuration.
//!
//! All types deserialize with `humantime` durations and reject unknown
//! fields; builders validate on `build()`. Deserialized values are
//! re-validated when handed to [`EdekPool::new`](crate::EdekPool::new) or
//! [`Coordinator::start`](crate::Coordinator::start).

use std::time::Duration;

pub use edek_kms::ConfigError;
use serde::{Deserialize, Serialize};

/// Default target number of EDEKs per key queue.
pub const DEFAULT_NUM_VALUES: usize = 500;

/// Default low-watermark fraction.
pub const DEFAULT_LOW_WATERMARK: f64 = 0.3;

/// Default lifetime of a queued EDEK (12 hours).
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Default number of refill workers.
pub const DEFAULT_REFILL_WORKERS: usize = 2;

/// Default capacity of the refill job queue.
pub const DEFAULT_REFILL_QUEUE_DEPTH: usize = 1024;

/// Default bound on a single KMS call (30 seconds).
pub const DEFAULT_KMS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of consecutive refill failures before backing off.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default refill backoff after repeated failures (30 seconds).
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(30);

/// Default delay before the startup warmup runs.
pub const DEFAULT_WARMUP_INITIAL_DELAY: Duration = Duration::from_secs(3);

/// Default delay between warmup retries of failed keys.
pub const DEFAULT_WARMUP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of keys warmed concurrently.
pub const DEFAULT_WARMUP_CONCURRENCY: usize = 4;

/// Default filesystem service address used for delegation tokens.
pub const DEFAULT_SERVICE: &str = "localhost:8020";

/// How many keys a cache miss fetches synchronously.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncGenerationPolicy {
    /// Fetch exactly the key the caller needs.
    One,
    /// Fetch enough to bring the queue up to the low watermark.
    #[default]
    LowWatermark,
    /// Fetch enough to fill the queue completely.
    All,
}

fn default_num_values() -> usize {
    DEFAULT_NUM_VALUES
}

fn default_low_watermark() -> f64 {
    DEFAULT_LOW_WATERMARK
}

fn default_entry_ttl() -> Duration {
    DEFAULT_ENTRY_TTL
}

fn default_refill_workers() -> usize {
    DEFAULT_REFILL_WORKERS
}

fn default_refill_queue_depth() -> usize {
    DEFAULT_REFILL_QUEUE_DEPTH
}

fn default_kms_timeout() -> Duration {
    DEFAULT_KMS_TIMEOUT
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_failure_backoff() -> Duration {
    DEFAULT_FAILURE_BACKOFF
}

/// Configuration for [`EdekPool`](crate::EdekPool).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use edek_pool::{EdekPoolConfig, SyncGenerationPolicy};
///
/// let config = EdekPoolConfig::builder()
///     .num_values(100)
///     .low_watermark(0.25)
///     .entry_ttl(Duration::from_secs(3600))
///     .sync_generation_policy(SyncGenerationPolicy::One)
///     .build()?;
///
/// assert_eq!(config.low_watermark_threshold(), 25);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdekPoolConfig {
    /// Target (and maximum) number of EDEKs per key.
    #[serde(default = "default_num_values")]
    pub(crate) num_values: usize,

    /// Fraction of `num_values` below which a refill fires.
    #[serde(default = "default_low_watermark")]
    pub(crate) low_watermark: f64,

    /// Age after which a queued EDEK is discarded.
    #[serde(with = "humantime_serde", default = "default_entry_ttl")]
    pub(crate) entry_ttl: Duration,

    /// Number of background refill workers.
    #[serde(default = "default_refill_workers")]
    pub(crate) refill_workers: usize,

    /// Capacity of the refill job queue.
    #[serde(default = "default_refill_queue_depth")]
    pub(crate) refill_queue_depth: usize,

    /// Bound on every KMS call made by the pool.
    #[serde(with = "humantime_serde", default = "default_kms_timeout")]
    pub(crate) kms_timeout: Duration,

    /// Batch size of the synchronous path on a cache miss.
    #[serde(default)]
    pub(crate) sync_generation_policy: SyncGenerationPolicy,

    /// Consecutive refill failures before refills for a key are suspended.
    #[serde(default = "default_failure_threshold")]
    pub(crate) failure_threshold: u32,

    /// How long refills stay suspended.
    #[serde(with = "humantime_serde", default = "default_failure_backoff")]
    pub(crate) failure_backoff: Duration,

    /// Period of the background check that refills queues below the low
    /// watermark. `None` disables it.
    #[serde(with = "humantime_serde", default)]
    pub(crate) refill_check_interval: Option<Duration>,
}

impl Default for EdekPoolConfig {
    fn default() -> Self {
        Self {
            num_values: DEFAULT_NUM_VALUES,
            low_watermark: DEFAULT_LOW_WATERMARK,
            entry_ttl: DEFAULT_ENTRY_TTL,
            refill_workers: DEFAULT_REFILL_WORKERS,
            refill_queue_depth: DEFAULT_REFILL_QUEUE_DEPTH,
            kms_timeout: DEFAULT_KMS_TIMEOUT,
            sync_generation_policy: SyncGenerationPolicy::default(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            refill_check_interval: None,
        }
    }
}

#[bon::bon]
impl EdekPoolConfig {
    /// Creates a pool configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `num_values`, `refill_workers`, `refill_queue_depth` or `failure_threshold` is zero
    /// - `low_watermark` is not in `(0, 1]`
    /// - `entry_ttl`, `kms_timeout`, `failure_backoff` or `refill_check_interval` is zero
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_NUM_VALUES)] num_values: usize,
        #[builder(default = DEFAULT_LOW_WATERMARK)] low_watermark: f64,
        #[builder(default = DEFAULT_ENTRY_TTL)] entry_ttl: Duration,
        #[builder(default = DEFAULT_REFILL_WORKERS)] refill_workers: usize,
        #[builder(default = DEFAULT_REFILL_QUEUE_DEPTH)] refill_queue_depth: usize,
        #[builder(default = DEFAULT_KMS_TIMEOUT)] kms_timeout: Duration,
        #[builder(default)] sync_generation_policy: SyncGenerationPolicy,
        #[builder(default = DEFAULT_FAILURE_THRESHOLD)] failure_threshold: u32,
        #[builder(default = DEFAULT_FAILURE_BACKOFF)] failure_backoff: Duration,
        refill_check_interval: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            num_values,
            low_watermark,
            entry_ttl,
            refill_workers,
            refill_queue_depth,
            kms_timeout,
            sync_generation_policy,
            failure_threshold,
            failure_backoff,
            refill_check_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Same conditions as [`EdekPoolConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least_one("num_values", self.num_values)?;
        at_least_one("refill_workers", self.refill_workers)?;
        at_least_one("refill_queue_depth", self.refill_queue_depth)?;
        at_least_one("failure_threshold", self.failure_threshold as usize)?;

        if !(self.low_watermark > 0.0 && self.low_watermark <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "low_watermark",
                min: "0 (exclusive)".into(),
                max: "1".into(),
                value: self.low_watermark.to_string(),
            });
        }

        positive("entry_ttl", self.entry_ttl)?;
        positive("kms_timeout", self.kms_timeout)?;
        positive("failure_backoff", self.failure_backoff)?;
        if let Some(interval) = self.refill_check_interval {
            positive("refill_check_interval", interval)?;
        }
        Ok(())
    }

    /// Returns the target number of EDEKs per key.
    #[must_use]
    pub fn num_values(&self) -> usize {
        self.num_values
    }

    /// Returns the low-watermark fraction.
    #[must_use]
    pub fn low_watermark(&self) -> f64 {
        self.low_watermark
    }

    /// Returns the queue size below which a refill fires.
    ///
    /// `ceil(num_values * low_watermark)`, never less than one and never
    /// more than `num_values`.
    #[must_use]
    pub fn low_watermark_threshold(&self) -> usize {
        let threshold = (self.num_values as f64 * self.low_watermark).ceil() as usize;
        threshold.clamp(1, self.num_values.max(1))
    }

    /// Returns the entry TTL.
    #[must_use]
    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    /// Returns the number of refill workers.
    #[must_use]
    pub fn refill_workers(&self) -> usize {
        self.refill_workers
    }

    /// Returns the refill job queue capacity.
    #[must_use]
    pub fn refill_queue_depth(&self) -> usize {
        self.refill_queue_depth
    }

    /// Returns the KMS call timeout.
    #[must_use]
    pub fn kms_timeout(&self) -> Duration {
        self.kms_timeout
    }

    /// Returns the synchronous generation policy.
    #[must_use]
    pub fn sync_generation_policy(&self) -> SyncGenerationPolicy {
        self.sync_generation_policy
    }

    /// Returns the failure threshold.
    #[must_use]
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Returns the failure backoff.
    #[must_use]
    pub fn failure_backoff(&self) -> Duration {
        self.failure_backoff
    }

    /// Returns the periodic refill check interval, if enabled.
    #[must_use]
    pub fn refill_check_interval(&self) -> Option<Duration> {
        self.refill_check_interval
    }
}

fn default_warmup_enabled() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    DEFAULT_WARMUP_INITIAL_DELAY
}

fn default_retry_interval() -> Duration {
    DEFAULT_WARMUP_RETRY_INTERVAL
}

fn default_concurrency() -> usize {
    DEFAULT_WARMUP_CONCURRENCY
}

/// Configuration for the startup [`QueueWarmer`](crate::QueueWarmer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarmupConfig {
    /// Whether warmup runs at all.
    #[serde(default = "default_warmup_enabled")]
    pub(crate) enabled: bool,

    /// Delay before the first warmup pass.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub(crate) initial_delay: Duration,

    /// Delay between passes over keys that failed to warm.
    #[serde(with = "humantime_serde", default = "default_retry_interval")]
    pub(crate) retry_interval: Duration,

    /// Keys warmed concurrently.
    #[serde(default = "default_concurrency")]
    pub(crate) concurrency: usize,

    /// Passes before giving up on a key. `None` retries until success or
    /// shutdown.
    #[serde(default)]
    pub(crate) max_attempts: Option<u32>,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: DEFAULT_WARMUP_INITIAL_DELAY,
            retry_interval: DEFAULT_WARMUP_RETRY_INTERVAL,
            concurrency: DEFAULT_WARMUP_CONCURRENCY,
            max_attempts: None,
        }
    }
}

#[bon::bon]
impl WarmupConfig {
    /// Creates a warmup configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `concurrency` or `max_attempts` is zero, or
    /// `retry_interval` is zero.
    #[builder]
    pub fn new(
        #[builder(default = true)] enabled: bool,
        #[builder(default = DEFAULT_WARMUP_INITIAL_DELAY)] initial_delay: Duration,
        #[builder(default = DEFAULT_WARMUP_RETRY_INTERVAL)] retry_interval: Duration,
        #[builder(default = DEFAULT_WARMUP_CONCURRENCY)] concurrency: usize,
        max_attempts: Option<u32>,
    ) -> Result<Self, ConfigError> {
        let config = Self { enabled, initial_delay, retry_interval, concurrency, max_attempts };
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Same conditions as [`WarmupConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least_one("concurrency", self.concurrency)?;
        positive("retry_interval", self.retry_interval)?;
        if let Some(attempts) = self.max_attempts {
            at_least_one("max_attempts", attempts as usize)?;
        }
        Ok(())
    }

    /// Returns whether warmup is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the initial delay.
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Returns the retry interval.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Returns the concurrency bound.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the attempt limit.
    #[must_use]
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

fn default_service() -> String {
    DEFAULT_SERVICE.to_owned()
}

/// Configuration for [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Filesystem service address tokens are issued for.
    #[serde(default = "default_service")]
    pub(crate) service: String,

    /// Principal named as the owner of filesystem tokens.
    #[serde(default = "default_service_owner")]
    pub(crate) owner: String,

    /// Lifetime of filesystem delegation tokens. `None` means no expiry.
    #[serde(with = "humantime_serde", default)]
    pub(crate) token_lifetime: Option<Duration>,

    /// EDEK pool settings.
    #[serde(default)]
    pub(crate) pool: EdekPoolConfig,

    /// Startup warmup settings.
    #[serde(default)]
    pub(crate) warmup: WarmupConfig,
}

fn default_service_owner() -> String {
    "hdfs".to_owned()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            owner: default_service_owner(),
            token_lifetime: None,
            pool: EdekPoolConfig::default(),
            warmup: WarmupConfig::default(),
        }
    }
}

#[bon::bon]
impl CoordinatorConfig {
    /// Creates a coordinator configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `service` or `owner` is empty, or if the
    /// nested configurations are invalid.
    #[builder]
    pub fn new(
        #[builder(into, default = default_service())] service: String,
        #[builder(into, default = default_service_owner())] owner: String,
        token_lifetime: Option<Duration>,
        #[builder(default)] pool: EdekPoolConfig,
        #[builder(default)] warmup: WarmupConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { service, owner, token_lifetime, pool, warmup };
        config.validate()?;
        Ok(config)
    }

    /// Checks a configuration obtained through deserialization.
    ///
    /// # Errors
    ///
    /// Same conditions as [`CoordinatorConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.is_empty() {
            return Err(ConfigError::Invalid {
                field: "service",
                message: "must not be empty".into(),
            });
        }
        if self.owner.is_empty() {
            return Err(ConfigError::Invalid {
                field: "owner",
                message: "must not be empty".into(),
            });
        }
        if let Some(lifetime) = self.token_lifetime {
            positive("token_lifetime", lifetime)?;
        }
        self.pool.validate()?;
        self.warmup.validate()
    }

    /// Returns the filesystem service address.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the filesystem token owner.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the filesystem token lifetime.
    #[must_use]
    pub fn token_lifetime(&self) -> Option<Duration> {
        self.token_lifetime
    }

    /// Returns the pool configuration.
    #[must_use]
    pub fn pool(&self) -> &EdekPoolConfig {
        &self.pool
    }

    /// Returns the warmup configuration.
    #[must_use]
    pub fn warmup(&self) -> &WarmupConfig {
        &self.warmup
    }
}

fn at_least_one(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::BelowMinimum { field, min: "1".into(), value: "0".into() });
    }
    Ok(())
}

fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::MustBePositive { field, value: "0s".into() });
    }
    Ok(())
}
