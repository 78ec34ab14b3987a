//! Quality verdict cache
//!
//! Pure-function cache keyed by artifact hash and check type. Hits
//! short-circuit repeated evaluation but never alter the verdict. Bounded by
//! capacity (LRU) and a TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::report::QualityReport;

/// Cache counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct Entry {
    report: QualityReport,
    inserted_at: Instant,
}

/// LRU + TTL cache for quality verdicts
pub struct QualityCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    /// Keys in recency order, oldest first
    order: Vec<String>,
}

impl QualityCache {
    /// Create a cache with the given capacity and TTL
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key: hash of the artifact plus the check type
    pub fn key(artifact: &str, check_type: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(artifact.as_bytes());
        format!("{}:{check_type}", hex::encode(hasher.finalize()))
    }

    /// Look up a verdict; refreshes recency on hit
    pub fn get(&self, key: &str) -> Option<QualityReport> {
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        inner.order.retain(|k| k != key);
        inner.order.push(key.to_string());
        self.hits.fetch_add(1, Ordering::Relaxed);

        inner.entries.get(key).map(|e| {
            let mut report = e.report.clone();
            report.from_cache = true;
            report
        })
    }

    /// Store a verdict, evicting the least recently used entry when full
    pub fn put(&self, key: String, report: QualityReport) {
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.first().cloned() {
                inner.entries.remove(&oldest);
                inner.order.remove(0);
            }
        }

        inner.order.retain(|k| k != &key);
        inner.order.push(key.clone());
        inner.entries.insert(
            key,
            Entry {
                report,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.inner.lock().entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::hard_rules::{evaluate, HardRules};
    use crate::quality::report::QualityReport;

    fn report() -> QualityReport {
        QualityReport::combine(evaluate(&HardRules::default(), "fine"), None)
    }

    #[test]
    fn test_hit_and_miss_counting() {
        let cache = QualityCache::new(10, Duration::from_secs(60));
        let key = QualityCache::key("artifact", "hard");

        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), report());

        let hit = cache.get(&key).unwrap();
        assert!(hit.from_cache);
        assert!(hit.passed);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_distinct_check_types_do_not_collide() {
        let a = QualityCache::key("same artifact", "hard");
        let b = QualityCache::key("same artifact", "full");
        assert_ne!(a, b);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = QualityCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), report());
        cache.put("b".into(), report());

        // Touch "a" so "b" becomes the eviction candidate
        assert!(cache.get("a").is_some());
        cache.put("c".into(), report());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = QualityCache::new(10, Duration::ZERO);
        cache.put("k".into(), report());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }
}
