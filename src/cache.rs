use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{artifact_store::path_exists, models::CacheEntry, store::CacheStore};

/// Stable fingerprint of a source reference.
pub fn cache_key(source: &str) -> String {
    let digest = Sha256::digest(source.trim().as_bytes());
    hex::encode(digest)
}

pub fn is_expired(created_at: DateTime<Utc>, retention: Duration, now: DateTime<Utc>) -> bool {
    let age = now.signed_duration_since(created_at);
    age.to_std().map(|age| age > retention).unwrap_or(false)
}

/// Returns the cached raw media for `key` if it is still inside the retention
/// window and its file is still on disk. Stale entries are purged here.
pub async fn lookup(store: &CacheStore, key: &str, retention: Duration) -> Option<CacheEntry> {
    let entry = store.get(key).await?;

    if is_expired(entry.created_at, retention, Utc::now()) {
        info!(cache_key = %key, "Cache entry expired, purging");
        store.evict(&entry).await;
        return None;
    }

    if !path_exists(&entry.path).await {
        info!(cache_key = %key, path = %entry.path.display(), "Cached file missing, purging");
        store.evict(&entry).await;
        return None;
    }

    debug!(cache_key = %key, source = %entry.source, "Cache hit");
    Some(entry)
}

pub async fn record(store: &CacheStore, key: &str, path: PathBuf, source: &str) {
    store
        .insert(CacheEntry {
            key: key.to_string(),
            path,
            created_at: Utc::now(),
            source: source.to_string(),
        })
        .await;
    info!(cache_key = %key, source = %source, "Cached raw media");
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    const SIX_HOURS: Duration = Duration::from_secs(6 * 3600);

    #[test]
    fn key_is_stable_and_trimmed() {
        let a = cache_key("https://www.youtube.com/watch?v=abc");
        let b = cache_key("  https://www.youtube.com/watch?v=abc\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, cache_key("https://www.youtube.com/watch?v=abd"));
    }

    #[tokio::test]
    async fn valid_entry_hits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("raw.m4a");
        std::fs::write(&path, b"raw").expect("write");
        let store = CacheStore::default();
        record(&store, "k", path.clone(), "src").await;

        let hit = lookup(&store, "k", SIX_HOURS).await.expect("hit");
        assert_eq!(hit.path, path);
    }

    #[tokio::test]
    async fn expired_entry_is_purged_with_its_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("raw.m4a");
        std::fs::write(&path, b"raw").expect("write");
        let store = CacheStore::default();
        store
            .insert(CacheEntry {
                key: "k".to_string(),
                path: path.clone(),
                created_at: Utc::now() - ChronoDuration::hours(7),
                source: "src".to_string(),
            })
            .await;

        assert!(lookup(&store, "k", SIX_HOURS).await.is_none());
        assert_eq!(store.len().await, 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_file_is_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::default();
        record(&store, "k", dir.path().join("gone.m4a"), "src").await;

        assert!(lookup(&store, "k", SIX_HOURS).await.is_none());
        assert_eq!(store.len().await, 0);
    }
}
