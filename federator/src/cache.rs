//! Caching of merged responses, keyed by query fingerprint.
//!
//! The cache is process-wide shared state with its own internal
//! synchronization. Backend errors (a payload that no longer
//! decompresses, say) degrade to a miss and are never fatal to the
//! request. There is deliberately no request coalescing: concurrent
//! identical queries may each recompute and each store.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hyper::body::Bytes;
use moka::Expiry;

use crate::config::{CacheBackend, CacheConfig};

#[derive(Clone)]
struct Stored {
    data: Arc<Vec<u8>>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Stored> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Stored,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Content-addressed store of previously merged responses
pub enum Cache {
    /// A cache that doesn't cache
    Null,
    InMemory(MemoryCache),
}

impl Cache {
    pub fn from_config(config: &CacheConfig) -> Self {
        match config.backend {
            CacheBackend::Null => Cache::Null,
            CacheBackend::InMemory => Cache::InMemory(MemoryCache::new(config)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Cache::Null)
    }

    /// Look up a fingerprint; `None` on miss or backend error.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        match self {
            Cache::Null => None,
            Cache::InMemory(cache) => cache.get(key),
        }
    }

    /// Store a payload under a fingerprint with a per-entry TTL.
    pub fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        match self {
            Cache::Null => {}
            Cache::InMemory(cache) => cache.set(key, value, ttl),
        }
    }

    /// Whether a fingerprint is present, without loading the payload.
    pub fn exists(&self, key: &str) -> bool {
        match self {
            Cache::Null => false,
            Cache::InMemory(cache) => cache.cache.contains_key(key),
        }
    }

    pub fn delete(&self, key: &str) {
        match self {
            Cache::Null => {}
            Cache::InMemory(cache) => cache.cache.invalidate(key),
        }
    }
}

pub struct MemoryCache {
    cache: moka::sync::Cache<String, Stored>,
    compress: bool,
}

impl MemoryCache {
    fn new(config: &CacheConfig) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(PerEntryTtl)
            .build();

        Self {
            cache,
            compress: config.compress,
        }
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        let stored = self.cache.get(key)?;

        if !self.compress {
            return Some(Bytes::copy_from_slice(&stored.data));
        }

        let mut decoded = Vec::new();
        match GzDecoder::new(stored.data.as_slice()).read_to_end(&mut decoded) {
            Ok(_) => Some(Bytes::from(decoded)),
            Err(err) => {
                tracing::warn!(key, error = %err, "dropping undecodable cache entry");
                self.cache.invalidate(key);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        let data = if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            let encoded = encoder
                .write_all(value)
                .and_then(|_| encoder.finish());
            match encoded {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(key, error = %err, "failed to compress cache entry");
                    return;
                }
            }
        } else {
            value.to_vec()
        };

        self.cache.insert(
            key.to_string(),
            Stored {
                data: Arc::new(data),
                ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory(compress: bool) -> Cache {
        Cache::from_config(&CacheConfig {
            backend: CacheBackend::InMemory,
            ttl_secs: 300,
            max_capacity: 16,
            compress,
        })
    }

    #[test]
    fn test_round_trip_and_ttl_expiry() {
        let cache = in_memory(true);
        let ttl = Duration::from_millis(150);

        cache.set("k", b"payload", ttl);
        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"payload")));
        assert!(cache.exists("k"));

        std::thread::sleep(Duration::from_millis(300));
        assert!(!cache.exists("k"));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_set_overwrites() {
        let cache = in_memory(false);
        let ttl = Duration::from_secs(60);

        cache.set("k", b"old", ttl);
        cache.set("k", b"new", ttl);
        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"new")));
    }

    #[test]
    fn test_delete() {
        let cache = in_memory(true);

        cache.set("k", b"payload", Duration::from_secs(60));
        cache.delete("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_null_cache_never_stores() {
        let cache = Cache::from_config(&CacheConfig::default());

        assert!(!cache.is_enabled());
        cache.set("k", b"payload", Duration::from_secs(60));
        assert!(!cache.exists("k"));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_compressed_entries_transparent() {
        let cache = in_memory(true);
        let payload = vec![7u8; 64 * 1024];

        cache.set("k", &payload, Duration::from_secs(60));
        assert_eq!(cache.get("k").map(|b| b.len()), Some(payload.len()));
    }
}
