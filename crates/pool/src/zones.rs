//! Encryption zones and the registry the warmer reads them from.

use std::collections::BTreeMap;

use async_trait::async_trait;
use edek_kms::KeyName;
use parking_lot::RwLock;

use crate::error::{PoolError, PoolResult};

/// A directory subtree encrypted under one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncryptionZone {
    /// Absolute path of the zone root, without a trailing slash.
    pub path: String,
    /// The zone key.
    pub key_name: KeyName,
}

impl EncryptionZone {
    /// Creates a zone.
    #[must_use]
    pub fn new(path: impl Into<String>, key_name: KeyName) -> Self {
        Self { path: path.into(), key_name }
    }

    /// Returns `true` if `path` is the zone root or lies beneath it.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        is_within(&self.path, path)
    }
}

/// Read-only view of the active encryption zones.
#[async_trait]
pub trait EncryptionZoneRegistry: Send + Sync {
    /// Lists every active zone.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ZoneRegistry`] if the zones cannot be read.
    async fn list_encryption_zones(&self) -> PoolResult<Vec<EncryptionZone>>;
}

/// In-memory zone registry.
#[derive(Debug, Default)]
pub struct MemoryZoneRegistry {
    zones: RwLock<BTreeMap<String, KeyName>>,
}

impl MemoryZoneRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a zone at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidZone`] if `path` is not absolute, or if it
    /// is already a zone or nested in or above another zone.
    pub fn create_zone(&self, path: &str, key_name: KeyName) -> PoolResult<EncryptionZone> {
        let path = normalize(path)?;
        let mut zones = self.zones.write();

        if let Some(existing) =
            zones.keys().find(|existing| is_within(existing, &path) || is_within(&path, existing))
        {
            return Err(PoolError::invalid_zone(
                path,
                format!("overlaps existing encryption zone {existing}"),
            ));
        }

        zones.insert(path.clone(), key_name.clone());
        Ok(EncryptionZone::new(path, key_name))
    }

    /// Removes the zone rooted at `path`.
    pub fn remove_zone(&self, path: &str) -> Option<EncryptionZone> {
        let path = normalize(path).ok()?;
        self.zones.write().remove(&path).map(|key| EncryptionZone::new(path, key))
    }

    /// Returns the zone containing `path`, if any.
    #[must_use]
    pub fn zone_for_path(&self, path: &str) -> Option<EncryptionZone> {
        self.zones
            .read()
            .iter()
            .map(|(root, key)| EncryptionZone::new(root.as_str(), key.clone()))
            .filter(|zone| zone.contains(path))
            .max_by_key(|zone| zone.path.len())
    }

    /// Number of zones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.zones.read().len()
    }

    /// Returns `true` if there are no zones.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.zones.read().is_empty()
    }
}

#[async_trait]
impl EncryptionZoneRegistry for MemoryZoneRegistry {
    async fn list_encryption_zones(&self) -> PoolResult<Vec<EncryptionZone>> {
        Ok(self
            .zones
            .read()
            .iter()
            .map(|(path, key)| EncryptionZone::new(path.as_str(), key.clone()))
            .collect())
    }
}

fn is_within(root: &str, path: &str) -> bool {
    if root == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn normalize(path: &str) -> PoolResult<String> {
    if !path.starts_with('/') {
        return Err(PoolError::invalid_zone(path, "path must be absolute"));
    }
    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/".to_owned() } else { trimmed.to_owned() })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::root_itself("/zones/a", true)]
    #[case::child("/zones/a/file", true)]
    #[case::sibling_prefix("/zones/ab", false)]
    #[case::parent("/zones", false)]
    fn test_contains(#[case] path: &str, #[case] expected: bool) {
        let zone = EncryptionZone::new("/zones/a", KeyName::from("k1"));
        assert_eq!(zone.contains(path), expected);
    }

    #[test]
    fn test_create_and_lookup() {
        let registry = MemoryZoneRegistry::new();
        registry.create_zone("/a/", KeyName::from("k1")).unwrap();
        registry.create_zone("/b", KeyName::from("k2")).unwrap();

        assert_eq!(registry.zone_for_path("/a/x/y").unwrap().key_name.as_str(), "k1");
        assert_eq!(registry.zone_for_path("/b").unwrap().path, "/b");
        assert!(registry.zone_for_path("/c/file").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_overlapping_zones_rejected() {
        let registry = MemoryZoneRegistry::new();
        registry.create_zone("/a", KeyName::from("k1")).unwrap();

        for path in ["/a", "/a/nested", "/"] {
            let err = registry.create_zone(path, KeyName::from("k2")).unwrap_err();
            assert!(matches!(err, PoolError::InvalidZone { .. }), "{path}");
        }
        assert!(registry.create_zone("relative", KeyName::from("k2")).is_err());
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let registry = MemoryZoneRegistry::new();
        registry.create_zone("/a", KeyName::from("k1")).unwrap();
        registry.create_zone("/b", KeyName::from("k1")).unwrap();

        assert!(registry.remove_zone("/a").is_some());
        assert!(registry.remove_zone("/a").is_none());

        let zones = registry.list_encryption_zones().await.unwrap();
        assert_eq!(zones, vec![EncryptionZone::new("/b", KeyName::from("k1"))]);
    }
}
