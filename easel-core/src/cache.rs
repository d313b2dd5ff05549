use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{Error, Result};

type Slot<H> = Arc<OnceCell<H>>;

/// Loaded pipeline handles keyed by configuration.
///
/// Every key owns a [`OnceCell`], so concurrent first requests for the same
/// key wait on a single construction while different keys load independently.
/// A failed construction leaves nothing behind and the next request retries.
pub struct HandleCache<K, H> {
    name: &'static str,
    slots: Mutex<HashMap<K, Slot<H>>>,
}

impl<K, H> HandleCache<K, H>
where
    K: Eq + Hash + Clone + Display,
    H: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(HashMap::new()),
        }
    }

    // A panic while holding the lock cannot leave the map half-updated.
    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<H>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the handle stored under `key`, constructing it first on a miss.
    pub async fn get_or_create<F, Fut>(&self, key: &K, constructor: F) -> Result<H>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<H>>,
    {
        let slot = self.slots().entry(key.clone()).or_default().clone();
        if let Some(handle) = slot.get() {
            debug!(cache = self.name, %key, "cache hit");
            return Ok(handle.clone());
        }

        let result = slot
            .get_or_try_init(|| async {
                info!(cache = self.name, %key, "loading pipeline");
                constructor().await
            })
            .await;

        match result {
            Ok(handle) => Ok(handle.clone()),
            Err(source) => {
                warn!(cache = self.name, %key, "pipeline construction failed: {source:#}");
                let mut slots = self.slots();
                if let Some(current) = slots.get(key) {
                    if Arc::ptr_eq(current, &slot) && current.get().is_none() {
                        slots.remove(key);
                    }
                }
                Err(Error::Load {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    /// Drops every handle and returns how many were loaded.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.slots().drain().collect();
        let released = drained.iter().filter(|(_, slot)| slot.initialized()).count();
        if released > 0 {
            info!(cache = self.name, released, "released pipelines");
        }
        released
    }

    /// Number of fully constructed handles.
    pub fn len(&self) -> usize {
        self.slots().values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots().get(key).is_some_and(|slot| slot.initialized())
    }

    pub fn keys(&self) -> Vec<K> {
        self.slots()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn constructs_once_per_key() {
        let cache: HandleCache<String, Arc<usize>> = HandleCache::new("test");
        let built = AtomicUsize::new(0);
        for _ in 0..5 {
            let handle = cache
                .get_or_create(&"a".to_string(), || async {
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(7))
                })
                .await
                .unwrap();
            assert_eq!(*handle, 7);
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&"a".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_construction() {
        let cache = Arc::new(HandleCache::<String, Arc<usize>>::new("test"));
        let built = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let built = built.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_create(&"shared".to_string(), || async move {
                        built.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Arc::new(1))
                    })
                    .await
                    .map(|h| *h)
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 1);
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: HandleCache<String, Arc<usize>> = HandleCache::new("test");
        let key = "broken".to_string();
        let err = cache
            .get_or_create(&key, || async { Err(anyhow::anyhow!("no weights")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Load { ref key, .. } if key == "broken"));
        assert!(!cache.contains(&key));
        assert!(cache.is_empty());

        let handle = cache
            .get_or_create(&key, || async { Ok(Arc::new(3)) })
            .await
            .unwrap();
        assert_eq!(*handle, 3);
    }

    #[tokio::test]
    async fn clear_releases_handles() {
        let cache: HandleCache<String, Arc<usize>> = HandleCache::new("test");
        for key in ["a", "b"] {
            cache
                .get_or_create(&key.to_string(), || async { Ok(Arc::new(0)) })
                .await
                .unwrap();
        }
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }
}
