//! Key provider value types.
//!
//! [`EncryptedKeyVersion`] is the unit the pool caches: a data-encryption key
//! wrapped by the KMS under one version of a named key. It is immutable and
//! handed out at most once.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Macro to define a newtype wrapper around `String` with standard trait
/// implementations.
macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Returns the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

define_name!(
    /// Name of a key registered in the KMS. Identifies one key queue.
    KeyName
);

define_name!(
    /// Name of one version of a key, conventionally `name@N`.
    KeyVersionName
);

impl KeyVersionName {
    /// Builds the conventional version name for version `index` of `key`.
    #[must_use]
    pub fn for_version(key: &KeyName, index: u32) -> Self {
        Self(format!("{key}@{index}"))
    }
}

/// A data-encryption key wrapped by the KMS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedKeyVersion {
    /// Key the DEK was wrapped under.
    pub key_name: KeyName,
    /// Version of that key used for wrapping.
    pub key_version_name: KeyVersionName,
    /// Initialization vector used for wrapping.
    pub iv: Bytes,
    /// The wrapped key material.
    pub encrypted_key_material: Bytes,
}

impl EncryptedKeyVersion {
    /// Creates a new encrypted key version.
    #[must_use]
    pub fn new(
        key_name: KeyName,
        key_version_name: KeyVersionName,
        iv: impl Into<Bytes>,
        encrypted_key_material: impl Into<Bytes>,
    ) -> Self {
        Self {
            key_name,
            key_version_name,
            iv: iv.into(),
            encrypted_key_material: encrypted_key_material.into(),
        }
    }
}

/// Metadata the KMS reports for a key.
#[derive(Clone, Debug, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Cipher suite, e.g. `AES/CTR/NoPadding`.
    #[builder(into)]
    pub cipher: String,
    /// Key length in bits.
    pub bit_length: u32,
    /// Current (newest) key version.
    pub current_version: KeyVersionName,
    /// Number of versions the key has.
    pub versions: u32,
    /// Free-form description.
    #[builder(into)]
    pub description: Option<String>,
    /// Creation time.
    #[builder(default = Utc::now())]
    pub created: DateTime<Utc>,
}

/// A decrypted data-encryption key.
///
/// Never cached; the material is scrubbed from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey {
    key_version_name: KeyVersionName,
    material: Zeroizing<Vec<u8>>,
}

impl DataKey {
    /// Wraps raw key material.
    #[must_use]
    pub fn new(key_version_name: KeyVersionName, material: Vec<u8>) -> Self {
        Self { key_version_name, material: Zeroizing::new(material) }
    }

    /// Returns the key version the DEK was wrapped under.
    #[must_use]
    pub fn key_version_name(&self) -> &KeyVersionName {
        &self.key_version_name
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.material
    }

    /// Returns the key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.material.len()
    }

    /// Returns `true` if the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.material.is_empty()
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("key_version_name", &self.key_version_name)
            .field("len", &self.material.len())
            .field("material", &"<redacted>")
            .finish()
    }
}
