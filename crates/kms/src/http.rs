//! HTTP transport to a KMS REST API.
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | metadata | `GET {base}/v1/key/{name}/_metadata` |
//! | generate | `GET {base}/v1/key/{name}/_eek?eek_op=generate&num_keys={n}` |
//! | decrypt | `POST {base}/v1/keyversion/{version}/_eek?eek_op=decrypt` |
//! | delegation token | `GET {base}/v1/?op=GETDELEGATIONTOKEN&renewer={renewer}` |
//!
//! Byte fields travel as unpadded URL-safe base64. Errors come back as a
//! `RemoteException` JSON body whose message is surfaced in [`KmsError`].
//!
//! # Status mapping
//!
//! | HTTP status | Error |
//! |-------------|-------|
//! | 404 | [`KmsError::KeyNotFound`] |
//! | 401, 403 | [`KmsError::Unauthorized`] |
//! | 5xx, transport failure | [`KmsError::Connection`] (transient, retried) |
//! | other 4xx | [`KmsError::InvalidRequest`] |

use async_trait::async_trait;
use base64::{
    Engine, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use edek_tokens::{
    Credentials, DelegationTokenIssuer, Token, TokenError, TokenKind, TokenResult, TokenService,
};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    config::KmsClientConfig,
    error::{KmsError, KmsResult},
    memory::KMS_TOKEN_KIND,
    provider::KeyProvider,
    retry::with_retry,
    types::{DataKey, EncryptedKeyVersion, KeyMetadata, KeyName, KeyVersionName},
};

/// Unpadded URL-safe base64 that also accepts padded input.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Deserialize)]
struct MetadataJson {
    cipher: String,
    length: u32,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    versions: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedKeyJson {
    version_name: String,
    iv: String,
    encrypted_key_version: MaterialJson,
}

#[derive(Debug, Deserialize)]
struct MaterialJson {
    material: String,
}

#[derive(Debug, Serialize)]
struct DecryptRequest<'a> {
    name: &'a str,
    iv: String,
    material: String,
}

#[derive(Debug, Deserialize)]
struct TokenJson {
    #[serde(rename = "Token")]
    token: UrlStringJson,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UrlStringJson {
    url_string: String,
}

#[derive(Debug, Deserialize)]
struct RemoteExceptionJson {
    #[serde(rename = "RemoteException")]
    remote_exception: RemoteException,
}

#[derive(Debug, Deserialize)]
struct RemoteException {
    message: String,
}

/// A [`KeyProvider`] backed by a remote KMS.
///
/// Every call is bounded by the configured request timeout and retried on
/// transient failures. The client is also the [`DelegationTokenIssuer`] for
/// its KMS, so a filesystem can hand out KMS tokens alongside its own.
///
/// # Example
///
/// ```no_run
/// use edek_kms::{KeyName, KeyProvider, KmsClient, KmsClientConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = KmsClientConfig::builder().endpoint("http://kms1:9600/kms").user("hdfs").build()?;
/// let client = KmsClient::new(config)?;
///
/// let edeks = client.generate_encrypted_keys(&KeyName::from("zone-key"), 10).await?;
/// println!("received {} keys", edeks.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct KmsClient {
    http: reqwest::Client,
    base: Url,
    service: TokenService,
    config: KmsClientConfig,
}

impl KmsClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Config`] for an invalid configuration, or
    /// [`KmsError::Connection`] if the HTTP client cannot be built.
    pub fn new(config: KmsClientConfig) -> KmsResult<Self> {
        config.validate()?;
        let base = Url::parse(config.endpoint())
            .map_err(|err| KmsError::invalid_request(format!("invalid endpoint: {err}")))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|err| KmsError::connection_with_source("failed to build HTTP client", err))?;

        Ok(Self { http, base, service: TokenService::from(config.service()), config })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &KmsClientConfig {
        &self.config
    }

    /// Returns the canonical service address.
    #[must_use]
    pub fn service(&self) -> &TokenService {
        &self.service
    }

    fn url(&self, segments: &[&str]) -> KmsResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| KmsError::invalid_request("endpoint cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Attaches a delegation token for this KMS if the caller holds one,
    /// otherwise the configured pseudo-auth user.
    fn authorize(
        &self,
        request: RequestBuilder,
        credentials: Option<&Credentials>,
    ) -> RequestBuilder {
        let token = credentials
            .and_then(|creds| creds.live_token_for_service(&self.service, Utc::now()))
            .filter(|token| token.kind.as_str() == KMS_TOKEN_KIND);

        if let Some(token) = token {
            request.query(&[("delegation", String::from_utf8_lossy(&token.identifier))])
        } else if let Some(user) = self.config.user() {
            request.query(&[("user.name", user)])
        } else {
            request
        }
    }

    /// Sends a request built by `build`, retrying transient failures.
    async fn call<T, F>(&self, operation: &str, key: Option<&str>, build: F) -> KmsResult<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        with_retry(self.config.retry(), operation, || {
            let request = build();
            async move { self.execute(request, key).await }
        })
        .await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        key: Option<&str>,
    ) -> KmsResult<T> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, key));
        }

        response
            .json::<T>()
            .await
            .map_err(|err| {
                KmsError::invalid_response_with_source("failed to decode KMS response", err)
            })
    }
}

fn transport_error(err: reqwest::Error) -> KmsError {
    if err.is_timeout() {
        KmsError::timeout()
    } else {
        KmsError::connection_with_source("failed to reach KMS", err)
    }
}

fn status_error(status: StatusCode, body: &str, key: Option<&str>) -> KmsError {
    let message = serde_json::from_str::<RemoteExceptionJson>(body)
        .map(|json| json.remote_exception.message)
        .ok()
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_owned()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_owned());

    match status {
        StatusCode::NOT_FOUND => KmsError::key_not_found(key.unwrap_or(message.as_str())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => KmsError::unauthorized(message),
        s if s.is_server_error() => KmsError::connection(format!("HTTP {}: {message}", s.as_u16())),
        s => KmsError::invalid_request(format!("HTTP {}: {message}", s.as_u16())),
    }
}

fn decode(field: &str, value: &str) -> KmsResult<Bytes> {
    BASE64
        .decode(value)
        .map(Bytes::from)
        .map_err(|err| {
            KmsError::invalid_response_with_source(format!("invalid base64 in {field}"), err)
        })
}

#[async_trait]
impl KeyProvider for KmsClient {
    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn get_metadata(&self, key: &KeyName) -> KmsResult<KeyMetadata> {
        let url = self.url(&["v1", "key", key.as_str(), "_metadata"])?;
        let json: Option<MetadataJson> = self
            .call("get_metadata", Some(key.as_str()), || {
                self.authorize(self.http.get(url.clone()), None)
            })
            .await?;
        let json = json.ok_or_else(|| KmsError::key_not_found(key.as_str()))?;

        Ok(KeyMetadata {
            cipher: json.cipher,
            bit_length: json.length,
            current_version: KeyVersionName::for_version(key, json.versions.saturating_sub(1)),
            versions: json.versions,
            description: json.description,
            created: json
                .created
                .and_then(DateTime::from_timestamp_millis)
                .unwrap_or_else(Utc::now),
        })
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn generate_encrypted_keys(
        &self,
        key: &KeyName,
        count: usize,
    ) -> KmsResult<Vec<EncryptedKeyVersion>> {
        let url = self.url(&["v1", "key", key.as_str(), "_eek"])?;
        let num_keys = count.to_string();
        let json: Vec<EncryptedKeyJson> = self
            .call("generate_encrypted_keys", Some(key.as_str()), || {
                let request = self
                    .http
                    .get(url.clone())
                    .query(&[("eek_op", "generate"), ("num_keys", num_keys.as_str())]);
                self.authorize(request, None)
            })
            .await?;

        let edeks = json
            .into_iter()
            .map(|eek| {
                Ok(EncryptedKeyVersion::new(
                    key.clone(),
                    KeyVersionName::from(eek.version_name),
                    decode("iv", &eek.iv)?,
                    decode("material", &eek.encrypted_key_version.material)?,
                ))
            })
            .collect::<KmsResult<Vec<_>>>()?;

        tracing::debug!(requested = count, received = edeks.len(), "generated encrypted keys");
        Ok(edeks)
    }

    #[tracing::instrument(skip(self, edek, credentials), fields(version = %edek.key_version_name))]
    async fn decrypt_encrypted_key(
        &self,
        edek: &EncryptedKeyVersion,
        credentials: &Credentials,
    ) -> KmsResult<DataKey> {
        let url = self.url(&["v1", "keyversion", edek.key_version_name.as_str(), "_eek"])?;
        let body = DecryptRequest {
            name: edek.key_name.as_str(),
            iv: BASE64.encode(&edek.iv),
            material: BASE64.encode(&edek.encrypted_key_material),
        };
        let json: MaterialJson = self
            .call("decrypt_encrypted_key", Some(edek.key_name.as_str()), || {
                let request = self
                    .http
                    .request(Method::POST, url.clone())
                    .query(&[("eek_op", "decrypt")])
                    .json(&body);
                self.authorize(request, Some(credentials))
            })
            .await?;

        let material = decode("material", &json.material)?;
        Ok(DataKey::new(edek.key_version_name.clone(), material.to_vec()))
    }
}

#[async_trait]
impl DelegationTokenIssuer for KmsClient {
    fn token_kind(&self) -> TokenKind {
        TokenKind::from(KMS_TOKEN_KIND)
    }

    fn canonical_service_name(&self) -> Option<TokenService> {
        Some(self.service.clone())
    }

    #[tracing::instrument(skip(self), fields(service = %self.service))]
    async fn issue_delegation_token(&self, renewer: &str) -> TokenResult<Token> {
        let url = self
            .url(&["v1", ""])
            .map_err(|err| {
                TokenError::issuance_with_source(self.service.clone(), "bad endpoint", err)
            })?;

        let json: TokenJson = self
            .call("issue_delegation_token", None, || {
                let request = self
                    .http
                    .get(url.clone())
                    .query(&[("op", "GETDELEGATIONTOKEN"), ("renewer", renewer)]);
                self.authorize(request, None)
            })
            .await
            .map_err(|err| match err {
                KmsError::Unauthorized { message } => {
                    TokenError::unauthorized(self.service.clone(), message)
                },
                other => TokenError::issuance_with_source(
                    self.service.clone(),
                    "token request failed",
                    other,
                ),
            })?;

        Ok(Token::builder()
            .kind(KMS_TOKEN_KIND)
            .service(self.service.clone())
            .identifier(Bytes::from(json.token.url_string))
            .renewer(renewer)
            .build())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::not_found(StatusCode::NOT_FOUND, "KeyNotFound")]
    #[case::unauthorized(StatusCode::UNAUTHORIZED, "Unauthorized")]
    #[case::forbidden(StatusCode::FORBIDDEN, "Unauthorized")]
    #[case::unavailable(StatusCode::SERVICE_UNAVAILABLE, "Connection")]
    #[case::internal(StatusCode::INTERNAL_SERVER_ERROR, "Connection")]
    #[case::bad_request(StatusCode::BAD_REQUEST, "InvalidRequest")]
    fn test_status_mapping(#[case] status: StatusCode, #[case] expected: &str) {
        let err = status_error(status, "", Some("k1"));
        let variant = match err {
            KmsError::KeyNotFound { .. } => "KeyNotFound",
            KmsError::Unauthorized { .. } => "Unauthorized",
            KmsError::Connection { .. } => "Connection",
            KmsError::InvalidRequest { .. } => "InvalidRequest",
            other => panic!("unexpected error {other:?}"),
        };
        assert_eq!(variant, expected);
    }

    #[test]
    fn test_remote_exception_message_is_surfaced() {
        let body = r#"{"RemoteException":{"message":"User:bob not allowed to do 'GENERATE_EEK' on 'k1'","exception":"AuthorizationException"}}"#;
        let err = status_error(StatusCode::FORBIDDEN, body, Some("k1"));
        assert_eq!(
            err.to_string(),
            "Unauthorized: User:bob not allowed to do 'GENERATE_EEK' on 'k1'"
        );
    }

    #[test]
    fn test_base64_accepts_padded_and_unpadded() {
        assert_eq!(decode("iv", "AQID").unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(decode("iv", "AQI").unwrap().as_ref(), &[1, 2]);
        assert_eq!(decode("iv", "AQI=").unwrap().as_ref(), &[1, 2]);
        assert!(decode("iv", "***").is_err());
        assert_eq!(BASE64.encode([0xfb, 0xff]), "-_8");
    }

    #[test]
    fn test_url_escapes_key_names() {
        let config = KmsClientConfig::builder().endpoint("http://kms1:9600/kms/").build().unwrap();
        let client = KmsClient::new(config).unwrap();

        let url = client.url(&["v1", "key", "a b/c", "_eek"]).unwrap();
        assert_eq!(url.as_str(), "http://kms1:9600/kms/v1/key/a%20b%2Fc/_eek");
        assert_eq!(client.service().as_str(), "kms1:9600");
    }
}
