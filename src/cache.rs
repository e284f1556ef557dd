//! Durable key/value cache used for memoization.
//!
//! Keys are `/`-separated paths: `{namespace}/{kind}/{digest}`. The
//! namespace is derived from the org a connection belongs to, so two orgs
//! never share entries. Values are JSON documents; a stored `null` reads
//! back as a miss.
//!
//! The cache is an explicit handle passed to every component that memoizes.
//! Writers to the same key race and the last write wins, which is fine
//! because every entry is an idempotent recomputation.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Persisted key to JSON value store.
#[async_trait]
pub trait DurableCache: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    /// Write (overwrite) a value.
    async fn put(&self, key: &str, value: &JsonValue) -> Result<()>;

    /// Keys starting with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove a value. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build a cache key from a namespace, an entry kind and free-form parts.
///
/// The parts are hashed so arbitrary query text or record content turns into
/// a fixed-length, filesystem-safe segment.
pub fn cache_key(namespace: &str, kind: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!(
        "{}/{}/{}",
        sanitize_segment(namespace),
        sanitize_segment(kind),
        hex::encode(hasher.finalize())
    )
}

fn sanitize_segment(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Read and decode a typed value. Undecodable entries count as misses.
pub async fn get_as<T: DeserializeOwned>(cache: &dyn DurableCache, key: &str) -> Result<Option<T>> {
    match cache.get(key).await? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => match serde_json::from_value(value) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(key, error = %e, "ignoring undecodable cache entry");
                Ok(None)
            }
        },
    }
}

/// Encode and write a typed value.
pub async fn put_as<T: Serialize + ?Sized>(cache: &dyn DurableCache, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    cache.put(key, &value).await
}

/// Return the cached value for `key`, or compute, store and return it.
///
/// Cache read and write failures are logged and otherwise ignored: the
/// cache only ever saves work, it never decides outcomes.
pub async fn get_or_compute<T, F, Fut>(cache: &dyn DurableCache, key: &str, compute: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match get_as::<T>(cache, key).await {
        Ok(Some(value)) => return Ok(value),
        Ok(None) => {}
        Err(e) => warn!(key, error = %e, "cache read failed"),
    }
    let value = compute().await?;
    if let Err(e) = put_as(cache, key, &value).await {
        warn!(key, error = %e, "cache write failed");
    }
    Ok(value)
}

/// Delete every entry under `prefix`; returns how many were removed.
pub async fn clear(cache: &dyn DurableCache, prefix: &str) -> Result<usize> {
    let keys = cache.list(prefix).await?;
    for key in &keys {
        cache.delete(key).await?;
    }
    debug!(prefix, removed = keys.len(), "cache cleared");
    Ok(keys.len())
}

/// Filesystem cache: one JSON file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    /// Open (and create) a cache directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            Error::cache_with_source(format!("Failed to create {}", root.display()), e)
        })?;
        debug!(root = %root.display(), "file cache ready");
        Ok(Self { root })
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(Error::cache(format!("Invalid cache key: {:?}", key)));
            }
            path.push(segment);
        }
        path.set_extension("json");
        Ok(path)
    }

    async fn collect_keys(&self, dir: PathBuf, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(relative) = path.with_extension("").strip_prefix(&self.root).map(Path::to_path_buf) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DurableCache for FileCache {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        let path = self.path_for(key)?;
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "ignoring corrupt cache file");
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: &JsonValue) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_vec(value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(self.root.clone(), prefix, &mut keys).await?;
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<BTreeMap<String, JsonValue>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, JsonValue>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DurableCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(self.entries().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &JsonValue) -> Result<()> {
        self.entries().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

/// Cache that stores nothing; used when caching is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl DurableCache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<JsonValue>> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _value: &JsonValue) -> Result<()> {
        Ok(())
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_shape() {
        let key = cache_key("00D5g000000abc", "upsert", &["Account", "deadbeef"]);
        let segments: Vec<&str> = key.split('/').collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], "00D5g000000abc");
        assert_eq!(segments[1], "upsert");
        assert_eq!(segments[2].len(), 64);
    }

    #[test]
    fn test_cache_key_parts_are_delimited() {
        assert_ne!(
            cache_key("ns", "query", &["ab", "c"]),
            cache_key("ns", "query", &["a", "bc"])
        );
    }

    #[test]
    fn test_namespace_sanitized() {
        let key = cache_key("../etc", "k", &[]);
        assert!(key.starts_with("___etc/k/"));
    }

    #[tokio::test]
    async fn test_memory_cache_list_prefix() {
        let cache = MemoryCache::new();
        cache.put("a/x/1", &json!(1)).await.unwrap();
        cache.put("a/y/2", &json!(2)).await.unwrap();
        cache.put("b/x/3", &json!(3)).await.unwrap();
        assert_eq!(cache.list("a/").await.unwrap(), vec!["a/x/1", "a/y/2"]);
        cache.delete("a/x/1").await.unwrap();
        assert_eq!(cache.list("a/").await.unwrap(), vec!["a/y/2"]);
    }

    #[tokio::test]
    async fn test_clear_prefix() {
        let cache = MemoryCache::new();
        for key in ["org1/upsert/1", "org1/upsert/2", "org1/describe/3", "org2/upsert/4"] {
            cache.put(key, &json!(true)).await.unwrap();
        }
        assert_eq!(clear(&cache, "org1/upsert/").await.unwrap(), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(clear(&cache, "").await.unwrap(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_null_reads_as_miss() {
        let cache = MemoryCache::new();
        cache.put("k/v/1", &JsonValue::Null).await.unwrap();
        let v: Option<u32> = get_as(&cache, "k/v/1").await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn test_get_or_compute_memoizes() {
        let cache = MemoryCache::new();
        let first: u32 = get_or_compute(&cache, "ns/count/1", || async { Ok(7) })
            .await
            .unwrap();
        let second: u32 = get_or_compute(&cache, "ns/count/1", || async {
            Err(Error::cache("should not recompute"))
        })
        .await
        .unwrap();
        assert_eq!((first, second), (7, 7));
    }

    #[tokio::test]
    async fn test_file_cache_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).await.unwrap();
        cache.put("org1/describe/abc", &json!({"name": "Account"})).await.unwrap();
        cache.put("org1/upsert/def", &json!({"success": true})).await.unwrap();
        cache.put("org2/upsert/ghi", &json!(null)).await.unwrap();

        assert_eq!(
            cache.get("org1/describe/abc").await.unwrap(),
            Some(json!({"name": "Account"}))
        );
        assert_eq!(
            cache.list("org1/").await.unwrap(),
            vec!["org1/describe/abc", "org1/upsert/def"]
        );

        cache.delete("org1/upsert/def").await.unwrap();
        cache.delete("org1/upsert/missing").await.unwrap();
        assert!(cache.get("org1/upsert/def").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_cache_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).await.unwrap();
        assert!(cache.get("../outside").await.is_err());
    }
}
