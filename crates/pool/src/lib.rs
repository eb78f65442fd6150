//! # EDEK Pool
//!
//! Keeps file creation in encryption zones off the KMS round trip.
//!
//! This crate provides:
//! - **Key queues**: [`EdekPool`] holds a bounded FIFO of pre-generated EDEKs per key, with a
//!   low-watermark refill trigger and an entry TTL
//! - **Refill workers**: a bounded job queue drained by background tasks, with per-key coalescing
//!   and failure backoff
//! - **Warmup**: [`QueueWarmer`] fills the queue of every encryption zone key after a restart
//! - **Coordinator facade**: [`Coordinator`] ties zones, files, the pool and delegation tokens
//!   together
//!
//! ## Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//! use edek_kms::{KeyName, MemoryKeyProvider};
//! use edek_pool::{Coordinator, CoordinatorConfig, MemoryZoneRegistry, WarmupConfig};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let kms = Arc::new(MemoryKeyProvider::new());
//! kms.create_key(&KeyName::from("zone-key")).unwrap();
//!
//! let config = CoordinatorConfig::builder()
//!     .warmup(WarmupConfig::builder().initial_delay(Duration::ZERO).build().unwrap())
//!     .build()
//!     .unwrap();
//! let coordinator =
//!     Coordinator::start(config, kms.clone(), Arc::new(MemoryZoneRegistry::new()), Some(kms))
//!         .unwrap();
//!
//! coordinator.create_encryption_zone("/secure", &KeyName::from("zone-key")).await.unwrap();
//! let info = coordinator.create_file("/secure/report.csv").await.unwrap().unwrap();
//! assert_eq!(info.edek.key_name.as_str(), "zone-key");
//! assert!(coordinator.key_queue_size(&KeyName::from("zone-key")) > 0);
//!
//! coordinator.shutdown().await;
//! # });
//! ```
//!
//! ## Features
//!
//! - **`failpoints`**: Enables fail-point injection in the refill path and the in-memory KMS

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Pool, warmup and coordinator configuration.
pub mod config;
/// Coordinator facade.
pub mod coordinator;
/// Pool error types.
pub mod error;
/// Pool counters.
pub mod metrics;
/// The EDEK pool.
pub mod pool;
mod queue;
/// Background refill.
pub mod refiller;
/// Startup warmup.
pub mod warmer;
/// Encryption zones.
pub mod zones;

pub use config::{
    ConfigError, CoordinatorConfig, DEFAULT_ENTRY_TTL, DEFAULT_FAILURE_BACKOFF,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_KMS_TIMEOUT, DEFAULT_LOW_WATERMARK, DEFAULT_NUM_VALUES,
    DEFAULT_REFILL_QUEUE_DEPTH, DEFAULT_REFILL_WORKERS, DEFAULT_SERVICE,
    DEFAULT_WARMUP_CONCURRENCY, DEFAULT_WARMUP_INITIAL_DELAY, DEFAULT_WARMUP_RETRY_INTERVAL,
    EdekPoolConfig, SyncGenerationPolicy, WarmupConfig,
};
pub use coordinator::{Coordinator, FS_DELEGATION_TOKEN_KIND, FileEncryptionInfo};
pub use error::{PoolError, PoolResult};
pub use metrics::{PoolMetrics, PoolMetricsSnapshot};
pub use pool::EdekPool;
pub use refiller::FillOutcome;
pub use warmer::{QueueWarmer, WarmupReport};
pub use zones::{EncryptionZone, EncryptionZoneRegistry, MemoryZoneRegistry};
