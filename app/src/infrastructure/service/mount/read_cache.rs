use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

/// Windows at or below this size are cached.
pub const CACHE_WINDOW_MAX: u64 = 64 * 1024;
/// Sliding idle lifetime of a cached window.
const TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeKey {
    pub file_id: String,
    pub content_hash: String,
    pub offset: u64,
    pub length: u64,
}

struct CachedWindow {
    bytes: Bytes,
    last_touch: Instant,
}

/// Small-read cache for the mount: keyed by `(file id, content hash,
/// offset, length)` so a changed file never serves stale bytes.
#[derive(Default)]
pub struct RangeCache {
    entries: DashMap<RangeKey, CachedWindow>,
}

impl RangeCache {
    /// A hit slides the window's expiry forward.
    pub fn get(&self, key: &RangeKey) -> Option<Bytes> {
        let mut hit = self.entries.get_mut(key)?;
        if hit.last_touch.elapsed() > TTL {
            drop(hit);
            self.entries.remove(key);
            return None;
        }
        hit.last_touch = Instant::now();
        Some(hit.bytes.clone())
    }

    pub fn put(&self, key: RangeKey, bytes: Bytes) {
        if key.length > CACHE_WINDOW_MAX {
            return;
        }
        self.entries.retain(|_, window| window.last_touch.elapsed() <= TTL);
        self.entries.insert(
            key,
            CachedWindow {
                bytes,
                last_touch: Instant::now(),
            },
        );
    }

    /// Drop every window of one file, e.g. after it was rewritten.
    pub fn invalidate_file(&self, file_id: &str) {
        self.entries.retain(|key, _| key.file_id != file_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(offset: u64) -> RangeKey {
        RangeKey {
            file_id: "f1".into(),
            content_hash: "H".into(),
            offset,
            length: 16,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_ttl_keeps_touched_windows() {
        let cache = RangeCache::default();
        cache.put(key(0), Bytes::from_static(b"window"));

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(cache.get(&key(0)).is_some());

        // Touched above, so another four minutes stays within the window.
        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(cache.get(&key(0)).is_some());

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert!(cache.get(&key(0)).is_none());
    }

    #[tokio::test]
    async fn oversized_windows_are_not_cached() {
        let cache = RangeCache::default();
        let big = RangeKey {
            length: CACHE_WINDOW_MAX + 1,
            ..key(0)
        };
        cache.put(big.clone(), Bytes::from_static(b"x"));
        assert!(cache.get(&big).is_none());
    }

    #[tokio::test]
    async fn invalidation_is_per_file() {
        let cache = RangeCache::default();
        cache.put(key(0), Bytes::from_static(b"a"));
        let other = RangeKey {
            file_id: "f2".into(),
            ..key(0)
        };
        cache.put(other.clone(), Bytes::from_static(b"b"));

        cache.invalidate_file("f1");
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&other).is_some());
    }
}
