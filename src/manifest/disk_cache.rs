//! On-disk manifest cache.
//!
//! One sanitized JSON file per manifest identifier under
//! `manifest_cache/`, nested directories allowed. Entries older than the
//! TTL are served only as a fallback when the network fetch fails; the
//! fallback path refreshes the file's mtime so subsequent reads treat the
//! entry as fresh again.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{DnshieldError, Result};

use super::sanitize;

pub const MANIFEST_CACHE_TTL: Duration = Duration::from_secs(300);

/// A cache read result; `was_expired` is set when the entry had outlived
/// the TTL and was served anyway.
#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub value: Value,
    pub was_expired: bool,
}

pub struct ManifestDiskCache {
    root: PathBuf,
    ttl: Duration,
}

impl ManifestDiskCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            ttl: MANIFEST_CACHE_TTL,
        }
    }

    pub fn with_ttl(root: PathBuf, ttl: Duration) -> Self {
        Self { root, ttl }
    }

    /// Resolve an identifier to its cache path. Identifiers may contain
    /// `/` (nested directories) but never path traversal.
    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        let traversal = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if traversal || id.is_empty() {
            return Err(DnshieldError::ManifestInvalid(format!(
                "unsafe manifest identifier '{}'",
                id
            )));
        }
        Ok(self.root.join(format!("{}.json", id)))
    }

    /// Persist a manifest value. The value is sanitized (idempotently)
    /// before hitting disk, and the write is temp-file-then-rename.
    pub async fn store(&self, id: &str, value: &Value) -> Result<()> {
        let path = self.path_for(id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let clean = sanitize(value.clone());
        let bytes = serde_json::to_vec_pretty(&clean)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Cached manifest '{}' ({} bytes)", id, bytes.len());
        Ok(())
    }

    /// Read a cached manifest, reporting whether it had expired.
    pub async fn load(&self, id: &str) -> Option<CachedManifest> {
        let path = self.path_for(id).ok()?;
        let metadata = fs::metadata(&path).await.ok()?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or_default();

        let bytes = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(CachedManifest {
                value,
                was_expired: age > self.ttl,
            }),
            Err(e) => {
                warn!("Removing corrupted cached manifest '{}': {}", id, e);
                let _ = fs::remove_file(&path).await;
                None
            }
        }
    }

    /// Refresh an entry's mtime by rewriting it in place, so reads after a
    /// stale-serve see it as fresh.
    pub async fn touch(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        let bytes = fs::read(&path).await?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every cached manifest.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(dir: &Path) -> ManifestDiskCache {
        ManifestDiskCache::new(dir.to_path_buf())
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let value = json!({"manifest_version": "1.0", "identifier": "default"});

        cache.store("default", &value).await.unwrap();
        let loaded = cache.load("default").await.unwrap();
        assert_eq!(loaded.value, value);
        assert!(!loaded.was_expired);
    }

    #[tokio::test]
    async fn test_nested_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let value = json!({"identifier": "eng/mbp-01"});

        cache.store("eng/mbp-01", &value).await.unwrap();
        assert!(cache.load("eng/mbp-01").await.is_some());
        assert!(dir.path().join("eng").join("mbp-01.json").exists());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let value = json!({});

        assert!(cache.store("../escape", &value).await.is_err());
        assert!(cache.store("/absolute", &value).await.is_err());
        assert!(cache.store("a/../../b", &value).await.is_err());
    }

    #[tokio::test]
    async fn test_nulls_stripped_on_store() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let value = json!({"identifier": "x", "display_name": null});

        cache.store("x", &value).await.unwrap();
        let loaded = cache.load("x").await.unwrap();
        assert_eq!(loaded.value, json!({"identifier": "x"}));
    }

    #[tokio::test]
    async fn test_expired_entry_flagged_and_touch_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestDiskCache::with_ttl(dir.path().to_path_buf(), Duration::ZERO);
        let value = json!({"identifier": "stale"});

        cache.store("stale", &value).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let loaded = cache.load("stale").await.unwrap();
        assert!(loaded.was_expired);

        // After a touch, a TTL-bearing cache sees the entry as fresh
        let fresh_cache =
            ManifestDiskCache::with_ttl(dir.path().to_path_buf(), Duration::from_secs(300));
        fresh_cache.touch("stale").await.unwrap();
        let reloaded = fresh_cache.load("stale").await.unwrap();
        assert!(!reloaded.was_expired);
    }

    #[tokio::test]
    async fn test_corrupted_entry_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        tokio::fs::write(dir.path().join("bad.json"), b"not json").await.unwrap();

        assert!(cache.load("bad").await.is_none());
        assert!(!dir.path().join("bad.json").exists());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        cache.store("a", &json!({})).await.unwrap();
        cache.remove("a").await.unwrap();
        assert!(cache.load("a").await.is_none());
        cache.remove("a").await.unwrap(); // idempotent

        cache.store("b", &json!({})).await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.load("b").await.is_none());
    }
}
