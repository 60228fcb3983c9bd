//! In-process file-state cache backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{FileState, FileStateCache, StateInner, StateKey};

/// Standalone backend: a sharded map of entries plus a TTL-bounded negative
/// existence cache. A background sweep calls [`FileStateCache::reap`].
pub struct StandaloneCache {
    entries: DashMap<StateKey, Arc<FileState>>,
    negative: moka::sync::Cache<StateKey, bool>,
}

impl StandaloneCache {
    pub fn new(negative_ttl: Duration) -> Arc<StandaloneCache> {
        Arc::new(StandaloneCache {
            entries: DashMap::new(),
            negative: moka::sync::Cache::builder()
                .max_capacity(16 * 1024)
                .time_to_live(negative_ttl)
                .build(),
        })
    }

    /// Number of live entries, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawns the periodic reaper sweep.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        ttl: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = cache.reap(ttl).await;
                if evicted > 0 {
                    debug!(evicted, "file state sweep");
                }
            }
        })
    }
}

#[async_trait]
impl FileStateCache for StandaloneCache {
    async fn acquire(&self, key: StateKey) -> Arc<FileState> {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(FileState::new(key)))
            .clone();
        entry.locked(|inner| {
            inner.refs += 1;
            inner.idle_since = None;
        });
        entry
    }

    async fn release(&self, entry: &Arc<FileState>) {
        entry.locked(|inner| {
            debug_assert!(inner.refs > 0, "file state refcount underflow");
            inner.refs = inner.refs.saturating_sub(1);
            if inner.refs == 0 {
                inner.idle_since = Some(Instant::now());
            }
        });
    }

    async fn with_locked(
        &self,
        entry: &Arc<FileState>,
        f: &mut (dyn for<'a> FnMut(&'a mut StateInner) + Send),
    ) {
        entry.locked(|inner| f(inner));
    }

    async fn reap(&self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.locked(|inner| {
                let quiescent = inner.refs == 0
                    && inner.oplock.is_none()
                    && inner.level_ii.is_empty()
                    && inner.locks.is_empty()
                    && inner.subscribers.is_empty();
                if !quiescent {
                    return true;
                }
                match inner.idle_since {
                    Some(idle) => idle.elapsed() < ttl,
                    None => true,
                }
            })
        });
        before - self.entries.len()
    }

    fn find(&self, key: &StateKey) -> Option<Arc<FileState>> {
        self.entries.get(key).map(|e| e.clone())
    }

    fn set_exists(&self, key: &StateKey, exists: bool) {
        self.negative.insert(key.clone(), exists);
        if let Some(entry) = self.find(key) {
            entry.locked(|inner| inner.exists = Some(exists));
        }
    }

    fn cached_exists(&self, key: &StateKey) -> Option<bool> {
        self.negative.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> StateKey {
        StateKey::new(1, path)
    }

    #[tokio::test]
    async fn acquire_release_tracks_references() {
        let cache = StandaloneCache::new(Duration::from_secs(5));
        let a = cache.acquire(key("\\f.txt")).await;
        let b = cache.acquire(key("\\F.TXT")).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.locked(|i| i.refs), 2);

        cache.release(&a).await;
        cache.release(&b).await;
        assert_eq!(a.locked(|i| i.refs), 0);
        assert!(a.locked(|i| i.idle_since.is_some()));
    }

    #[tokio::test]
    async fn reap_evicts_only_quiescent_idle_entries() {
        let cache = StandaloneCache::new(Duration::from_secs(5));
        let held = cache.acquire(key("\\held")).await;
        let idle = cache.acquire(key("\\idle")).await;
        cache.release(&idle).await;

        assert_eq!(cache.reap(Duration::from_secs(60)).await, 0);
        assert_eq!(cache.reap(Duration::ZERO).await, 1);
        assert!(cache.find(&key("\\idle")).is_none());
        assert!(cache.find(&key("\\held")).is_some());
        drop(held);
    }

    #[tokio::test]
    async fn interleaved_open_close_reaps_to_zero() {
        let cache = StandaloneCache::new(Duration::from_secs(5));
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(cache.acquire(key("\\busy.dat")).await);
        }
        for (i, entry) in handles.iter().enumerate() {
            assert_eq!(entry.locked(|inner| inner.refs), (handles.len() - i) as u32);
            cache.release(entry).await;
        }
        assert_eq!(cache.reap(Duration::ZERO).await, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn negative_cache_round_trip() {
        let cache = StandaloneCache::new(Duration::from_secs(5));
        assert_eq!(cache.cached_exists(&key("\\missing")), None);
        cache.set_exists(&key("\\missing"), false);
        assert_eq!(cache.cached_exists(&key("\\missing")), Some(false));
        cache.set_exists(&key("\\missing"), true);
        assert_eq!(cache.cached_exists(&key("\\missing")), Some(true));
    }
}
