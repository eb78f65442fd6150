//! Configuration for the HTTP KMS client.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, retry::RetryConfig};

/// Default per-request timeout (30 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

/// Configuration for [`KmsClient`](crate::KmsClient).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use edek_kms::KmsClientConfig;
///
/// let config = KmsClientConfig::builder()
///     .endpoint("http://kms1.example.com:9600/kms")
///     .user("hdfs")
///     .request_timeout(Duration::from_secs(10))
///     .build()?;
///
/// assert_eq!(config.service(), "kms1.example.com:9600");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KmsClientConfig {
    /// Base URL of the KMS, including any context path.
    pub(crate) endpoint: String,

    /// User sent as `user.name` when no delegation token applies.
    #[serde(default)]
    pub(crate) user: Option<String>,

    /// Per-request timeout.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub(crate) request_timeout: Duration,

    /// Connection timeout.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub(crate) connect_timeout: Duration,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub(crate) retry: RetryConfig,
}

#[bon::bon]
impl KmsClientConfig {
    /// Creates a new configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `endpoint` is not an absolute `http`/`https` URL with a host
    /// - either timeout is zero
    #[builder]
    pub fn new(
        #[builder(into)] endpoint: String,
        #[builder(into)] user: Option<String>,
        #[builder(default = DEFAULT_REQUEST_TIMEOUT)] request_timeout: Duration,
        #[builder(default = DEFAULT_CONNECT_TIMEOUT)] connect_timeout: Duration,
        #[builder(default)] retry: RetryConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { endpoint, user, request_timeout, connect_timeout, retry };
        config.validate()?;
        Ok(config)
    }

    /// Checks a deserialized configuration.
    ///
    /// # Errors
    ///
    /// Same conditions as [`KmsClientConfig::new`], plus retry policy errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_endpoint()?;
        if self.request_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "request_timeout",
                value: "0s".into(),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "connect_timeout",
                value: "0s".into(),
            });
        }
        self.retry.validate()
    }

    /// Returns the base URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the pseudo-auth user, if any.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the connection timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the canonical `host:port` service address of the endpoint.
    ///
    /// Falls back to the raw endpoint for a configuration that failed
    /// validation.
    #[must_use]
    pub fn service(&self) -> String {
        self.parsed_endpoint()
            .ok()
            .and_then(|url| {
                let host = url.host_str()?.to_owned();
                Some(format!("{host}:{}", url.port_or_known_default()?))
            })
            .unwrap_or_else(|| self.endpoint.clone())
    }

    fn parsed_endpoint(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|err| ConfigError::Invalid { field: "endpoint", message: err.to_string() })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "endpoint",
                message: format!("unsupported scheme {}", url.scheme()),
            });
        }
        if url.host_str().is_none() {
            return Err(ConfigError::Invalid {
                field: "endpoint",
                message: "missing host".into(),
            });
        }
        Ok(url)
    }
}
