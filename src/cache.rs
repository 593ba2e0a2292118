//! Two-tier cache: a bounded in-process LRU in front of a gzip-compressed
//! on-disk tier. Entries are grouped into namespaces that share a TTL and are
//! invalidated together.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::IngestError;

pub mod namespace {
    /// Raw upstream responses, keyed by request hash.
    pub const HTTP: &str = "http";
    /// Nomenclature authority lookups.
    pub const HGNC: &str = "hgnc";
    /// Percentile snapshots and aggregate score queries.
    pub const SCORES: &str = "scores";
    /// Per-gene evidence read models.
    pub const EVIDENCE: &str = "evidence";
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root: Utf8PathBuf,
    pub tier1_capacity: usize,
    pub default_ttl: Duration,
    pub namespace_ttls: BTreeMap<String, Duration>,
}

impl CacheSettings {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            tier1_capacity: 10_000,
            default_ttl: Duration::from_secs(3600),
            namespace_ttls: default_namespace_ttls(),
        }
    }
}

pub fn default_namespace_ttls() -> BTreeMap<String, Duration> {
    let mut ttls = BTreeMap::new();
    ttls.insert(namespace::HTTP.to_string(), Duration::from_secs(7 * 24 * 3600));
    ttls.insert(namespace::HGNC.to_string(), Duration::from_secs(30 * 24 * 3600));
    ttls.insert(namespace::SCORES.to_string(), Duration::from_secs(300));
    ttls.insert(namespace::EVIDENCE.to_string(), Duration::from_secs(600));
    ttls
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub tier1_hits: u64,
    pub tier2_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

#[derive(Debug, Default)]
struct Counters {
    tier1_hits: AtomicU64,
    tier2_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    namespace: String,
    key: String,
}

#[derive(Debug, Clone)]
struct Tier1Entry {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Tier2Header {
    namespace: String,
    key: String,
    expires_at: DateTime<Utc>,
}

pub struct CacheService {
    settings: CacheSettings,
    tier1: Mutex<LruCache<CacheKey, Tier1Entry>>,
    // Writers hold the read side; namespace invalidation takes the write side
    // so a concurrent set cannot land in a directory that is being cleared.
    tier2_lock: RwLock<()>,
    // Bumped on every namespace invalidation, under the tier-2 write lock.
    generations: Mutex<HashMap<String, u64>>,
    counters: Counters,
}

impl CacheService {
    pub fn new(settings: CacheSettings) -> Result<Self, IngestError> {
        fs::create_dir_all(settings.root.as_std_path())
            .map_err(|err| IngestError::Cache(format!("create {}: {err}", settings.root)))?;
        let capacity = NonZeroUsize::new(settings.tier1_capacity.max(1))
            .ok_or_else(|| IngestError::Cache("invalid tier-1 capacity".to_string()))?;
        Ok(Self {
            settings,
            tier1: Mutex::new(LruCache::new(capacity)),
            tier2_lock: RwLock::new(()),
            generations: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.settings.root
    }

    pub fn ttl_for(&self, namespace: &str) -> Duration {
        self.settings
            .namespace_ttls
            .get(namespace)
            .copied()
            .unwrap_or(self.settings.default_ttl)
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, IngestError> {
        validate_namespace(namespace)?;
        let cache_key = CacheKey {
            namespace: namespace.to_string(),
            key: key.to_string(),
        };
        let now = Utc::now();

        {
            let mut tier1 = self.tier1.lock();
            if let Some(entry) = tier1.get(&cache_key) {
                if entry.expires_at > now {
                    self.counters.tier1_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.value.clone()));
                }
                tier1.pop(&cache_key);
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
            }
        }

        let _guard = self.tier2_lock.read();
        let path = self.entry_path(namespace, key);
        match read_tier2(&path)? {
            Some((header, value)) if header.key == key && header.namespace == namespace => {
                if header.expires_at <= now {
                    remove_quietly(&path);
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                self.counters.tier2_hits.fetch_add(1, Ordering::Relaxed);
                self.put_tier1(
                    cache_key,
                    Tier1Entry {
                        value: value.clone(),
                        expires_at: header.expires_at,
                    },
                );
                Ok(Some(value))
            }
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), IngestError> {
        validate_namespace(namespace)?;
        let expires_at = self.expiry(namespace, ttl)?;
        let _guard = self.tier2_lock.read();
        self.write_entry(namespace, key, value, expires_at)
    }

    /// Invalidation count of `namespace`. Capture it before computing a value
    /// and hand it to [`CacheService::set_json_if_current`].
    pub fn generation(&self, namespace: &str) -> u64 {
        self.generations.lock().get(namespace).copied().unwrap_or(0)
    }

    /// Stores `value` only if `namespace` was not invalidated since
    /// `generation` was read. Returns whether the entry was written.
    pub fn set_json_if_current<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        generation: u64,
    ) -> Result<bool, IngestError> {
        validate_namespace(namespace)?;
        let bytes = serde_json::to_vec(value)?;
        let expires_at = self.expiry(namespace, ttl)?;
        let _guard = self.tier2_lock.read();
        if self.generation(namespace) != generation {
            debug!(namespace, key, "namespace invalidated while computing; not caching");
            return Ok(false);
        }
        self.write_entry(namespace, key, &bytes, expires_at)?;
        Ok(true)
    }

    fn expiry(&self, namespace: &str, ttl: Option<Duration>) -> Result<DateTime<Utc>, IngestError> {
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(namespace));
        Ok(Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|err| IngestError::Cache(format!("invalid ttl: {err}")))?)
    }

    // Callers hold the tier-2 read lock.
    fn write_entry(
        &self,
        namespace: &str,
        key: &str,
        value: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let header = Tier2Header {
            namespace: namespace.to_string(),
            key: key.to_string(),
            expires_at,
        };
        write_tier2(&self.entry_path(namespace, key), &header, value)?;
        self.put_tier1(
            CacheKey {
                namespace: namespace.to_string(),
                key: key.to_string(),
            },
            Tier1Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>, IngestError> {
        match self.get(namespace, key)? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    warn!(namespace, key, error = %err, "discarding undecodable cache entry");
                    self.remove(namespace, key)?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), IngestError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(namespace, key, &bytes, ttl)
    }

    pub fn remove(&self, namespace: &str, key: &str) -> Result<(), IngestError> {
        validate_namespace(namespace)?;
        self.tier1.lock().pop(&CacheKey {
            namespace: namespace.to_string(),
            key: key.to_string(),
        });
        let _guard = self.tier2_lock.read();
        remove_quietly(&self.entry_path(namespace, key));
        Ok(())
    }

    /// Drops every entry of `namespace` from both tiers.
    pub fn invalidate_namespace(&self, namespace: &str) -> Result<usize, IngestError> {
        validate_namespace(namespace)?;
        let _guard = self.tier2_lock.write();
        *self
            .generations
            .lock()
            .entry(namespace.to_string())
            .or_default() += 1;

        let removed_tier1 = {
            let mut tier1 = self.tier1.lock();
            let keys: Vec<CacheKey> = tier1
                .iter()
                .filter(|(key, _)| key.namespace == namespace)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                tier1.pop(key);
            }
            keys.len()
        };

        let dir = self.settings.root.join(namespace);
        if dir.as_std_path().exists() {
            fs::remove_dir_all(dir.as_std_path())
                .map_err(|err| IngestError::Cache(format!("clear {dir}: {err}")))?;
        }
        debug!(namespace, removed_tier1, "cache namespace invalidated");
        Ok(removed_tier1)
    }

    /// Removes expired tier-2 entries; returns how many files were deleted.
    pub fn purge_expired(&self) -> Result<usize, IngestError> {
        let _guard = self.tier2_lock.write();
        let now = Utc::now();
        let mut purged = 0usize;
        let root = self.settings.root.as_std_path();
        for ns_entry in fs::read_dir(root).map_err(|err| IngestError::Cache(err.to_string()))? {
            let ns_path = ns_entry
                .map_err(|err| IngestError::Cache(err.to_string()))?
                .path();
            if !ns_path.is_dir() {
                continue;
            }
            for entry in
                fs::read_dir(&ns_path).map_err(|err| IngestError::Cache(err.to_string()))?
            {
                let path = entry.map_err(|err| IngestError::Cache(err.to_string()))?.path();
                let Ok(utf8) = Utf8PathBuf::from_path_buf(path) else {
                    continue;
                };
                let expired = match read_tier2(&utf8) {
                    Ok(Some((header, _))) => header.expires_at <= now,
                    Ok(None) => false,
                    Err(_) => true,
                };
                if expired {
                    remove_quietly(&utf8);
                    purged += 1;
                }
            }
        }
        self.counters
            .expired
            .fetch_add(purged as u64, Ordering::Relaxed);
        Ok(purged)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            tier1_hits: self.counters.tier1_hits.load(Ordering::Relaxed),
            tier2_hits: self.counters.tier2_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    pub fn tier1_len(&self) -> usize {
        self.tier1.lock().len()
    }

    fn put_tier1(&self, key: CacheKey, entry: Tier1Entry) {
        let mut tier1 = self.tier1.lock();
        if let Some((evicted, _)) = tier1.push(key.clone(), entry) {
            if evicted != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn entry_path(&self, namespace: &str, key: &str) -> Utf8PathBuf {
        self.settings
            .root
            .join(namespace)
            .join(format!("{}.gz", hash_key(key)))
    }
}

/// Stable content hash used for cache file names and request keys.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn validate_namespace(namespace: &str) -> Result<(), IngestError> {
    let is_valid = !namespace.is_empty()
        && namespace
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-');
    if !is_valid {
        return Err(IngestError::Cache(format!("invalid namespace: {namespace}")));
    }
    Ok(())
}

// Layout: gzip( header-json "\n" raw-value-bytes )
fn write_tier2(path: &Utf8Path, header: &Tier2Header, value: &[u8]) -> Result<(), IngestError> {
    let parent = path
        .parent()
        .ok_or_else(|| IngestError::Cache("invalid cache path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| IngestError::Cache(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".entry")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| IngestError::Cache(err.to_string()))?;
    {
        let mut encoder = GzEncoder::new(temp.as_file_mut(), Compression::fast());
        serde_json::to_writer(&mut encoder, header)?;
        encoder.write_all(b"\n")?;
        encoder.write_all(value)?;
        encoder.finish()?;
    }
    temp.persist(path.as_std_path())
        .map_err(|err| IngestError::Cache(err.to_string()))?;
    Ok(())
}

fn read_tier2(path: &Utf8Path) -> Result<Option<(Tier2Header, Vec<u8>)>, IngestError> {
    let file = match fs::File::open(path.as_std_path()) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(IngestError::Cache(err.to_string())),
    };
    let mut reader = BufReader::new(GzDecoder::new(file));
    let mut header_line = String::new();
    if reader.read_line(&mut header_line).is_err() {
        warn!(path = %path, "corrupt cache entry, removing");
        remove_quietly(path);
        return Ok(None);
    }
    let header: Tier2Header = match serde_json::from_str(header_line.trim_end()) {
        Ok(header) => header,
        Err(_) => {
            warn!(path = %path, "corrupt cache header, removing");
            remove_quietly(path);
            return Ok(None);
        }
    };
    let mut value = Vec::new();
    reader
        .read_to_end(&mut value)
        .map_err(|err| IngestError::Cache(err.to_string()))?;
    Ok(Some((header, value)))
}

fn remove_quietly(path: &Utf8Path) {
    if let Err(err) = fs::remove_file(path.as_std_path()) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path, error = %err, "failed to remove cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(capacity: usize) -> (tempfile::TempDir, CacheService) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
        let mut settings = CacheSettings::new(root);
        settings.tier1_capacity = capacity;
        (temp, CacheService::new(settings).unwrap())
    }

    #[test]
    fn tier2_hit_repopulates_tier1() {
        let (_temp, cache) = service(2);
        cache.set("http", "a", b"alpha", None).unwrap();
        cache.set("http", "b", b"beta", None).unwrap();
        cache.set("http", "c", b"gamma", None).unwrap();
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.tier1_len(), 2);

        assert_eq!(cache.get("http", "a").unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(cache.stats().tier2_hits, 1);
        assert_eq!(cache.get("http", "a").unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(cache.stats().tier1_hits, 1);
    }

    #[test]
    fn expired_entries_are_misses_and_removed() {
        let (_temp, cache) = service(4);
        cache
            .set("scores", "k", b"v", Some(Duration::from_millis(5)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("scores", "k").unwrap(), None);
        assert!(!cache.entry_path("scores", "k").as_std_path().exists());
    }

    #[test]
    fn invalidation_discards_values_computed_before_it() {
        let (_temp, cache) = service(4);
        let before = cache.generation("scores");
        cache.invalidate_namespace("scores").unwrap();
        assert_ne!(cache.generation("scores"), before);

        assert!(!cache.set_json_if_current("scores", "gene:HGNC:1", &1u32, None, before).unwrap());
        assert_eq!(cache.get("scores", "gene:HGNC:1").unwrap(), None);

        let current = cache.generation("scores");
        assert!(cache.set_json_if_current("scores", "gene:HGNC:1", &2u32, None, current).unwrap());
        assert_eq!(cache.get_json::<u32>("scores", "gene:HGNC:1").unwrap(), Some(2));
        assert_eq!(cache.generation("http"), 0);
    }

    #[test]
    fn rejects_path_like_namespace() {
        let (_temp, cache) = service(4);
        assert!(cache.set("../etc", "k", b"v", None).is_err());
    }

    #[test]
    fn namespace_ttl_falls_back_to_default() {
        let (_temp, cache) = service(4);
        assert_eq!(cache.ttl_for("scores"), Duration::from_secs(300));
        assert_eq!(cache.ttl_for("unknown"), Duration::from_secs(3600));
    }
}
