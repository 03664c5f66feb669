//! # Model Cache
//!
//! Process-wide keyed store for expensively-constructed objects (alignment
//! units and the models they own), populated lazily on first request.
//!
//! ## Concurrency:
//! The key map is guarded by a short-lived mutex that only hands out a per-key
//! [`OnceLock`]. The factory runs inside that once-cell, outside the map lock:
//! - two callers racing on the same key see the factory run exactly once,
//! - a slow factory for one key never blocks lookups of other keys.
//!
//! ## Lifetime:
//! There is no eviction. Entries live until the process exits, which for a
//! worker process means until the pool tears it down.
//!
//! ## Key Rust Concepts Used:
//! - **`OnceLock<T>`**: a cell written at most once; `get_or_init` blocks
//!   concurrent callers until the first initializer finishes
//! - **`Arc<dyn Any + Send + Sync>`**: type-erased shared value, recovered
//!   with `Arc::downcast::<T>()` (which fails instead of panicking)
//! - **`static` + `OnceLock`**: a lazily built global without `unsafe`

use chrono::{DateTime, Utc};              // Entry timestamps
use std::any::Any;                        // Type erasure for heterogeneous entries
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};    // Shared ownership, map lock, per-key once-cells
use thiserror::Error;
use tracing::debug;

/// The cache shared by everything in this process.
static GLOBAL_MODEL_CACHE: OnceLock<Arc<ModelCache>> = OnceLock::new();

#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    #[error("cache entry '{key}' holds a {stored}, not a {requested}")]
    TypeMismatch {
        key: String,
        stored: &'static str,
        requested: &'static str,
    },
}

/// A cached value together with its bookkeeping.
pub struct CachedEntry {
    pub key: String,
    /// The value itself; callers get a clone of this `Arc`.
    pub value: Arc<dyn Any + Send + Sync>,
    /// `std::any::type_name` of the stored type, for mismatch errors.
    pub type_name: &'static str,
    pub created_at: DateTime<Utc>,
}

/// One key's once-cell. Cloned out of the map so it can be initialized
/// after the map lock is dropped.
type Slot = Arc<OnceLock<CachedEntry>>;

/// Keyed, factory-once store.
///
/// ## Usage:
/// ```
/// use speech_align::ModelCache;
///
/// let cache = ModelCache::new();
/// let first = cache.get("answer", || 42u32).unwrap();
/// let again = cache.get("answer", || 7u32).unwrap();
/// assert_eq!((*first, *again), (42, 42));
/// ```
#[derive(Default)]
pub struct ModelCache {
    entries: Mutex<HashMap<String, Slot>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache instance.
    pub fn global() -> Arc<ModelCache> {
        GLOBAL_MODEL_CACHE
            .get_or_init(|| Arc::new(ModelCache::new()))
            .clone()
    }

    /// Return the value stored under `key`, creating it with `factory` on the
    /// first request.
    ///
    /// ## Errors:
    /// - **TypeMismatch**: `key` already holds a value of another type
    pub fn get<T, F>(&self, key: &str, factory: F) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let slot = self.slot(key);
        let entry = slot.get_or_init(|| {
            debug!(key, "Cache miss, constructing entry");
            CachedEntry {
                key: key.to_string(),
                value: Arc::new(factory()),
                type_name: std::any::type_name::<T>(),
                created_at: Utc::now(),
            }
        });

        entry
            .value
            .clone()
            .downcast::<T>()
            .map_err(|_| CacheError::TypeMismatch {
                key: key.to_string(),
                stored: entry.type_name,
                requested: std::any::type_name::<T>(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .get(key)
            .map(|slot| slot.get().is_some())
            .unwrap_or(false)
    }

    /// When the entry under `key` was constructed.
    pub fn created_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .get(key)
            .and_then(|slot| slot.get().map(|entry| entry.created_at))
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        self.lock().values().filter(|slot| slot.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &str) -> Slot {
        self.lock().entry(key.to_string()).or_default().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // factories never run under this lock
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.lock().keys().cloned().collect();
        f.debug_struct("ModelCache").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn test_factory_runs_once_per_key() {
        let cache = ModelCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..5 {
            let value = cache
                .get("alignment", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    String::from("model")
                })
                .unwrap();
            assert_eq!(value.as_str(), "model");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.contains("alignment"));
        assert!(cache.created_at("alignment").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_same_arc_is_returned() {
        let cache = ModelCache::new();
        let first = cache.get("k", || vec![1u8, 2, 3]).unwrap();
        let second = cache.get("k", || vec![9u8]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_concurrent_callers_share_one_construction() {
        let cache = Arc::new(ModelCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get("alignment", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            42u32
                        })
                        .map(|v| *v)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let cache = ModelCache::new();
        cache.get("alignment", || 1u32).unwrap();

        let err = cache.get("alignment", || String::new()).unwrap_err();
        assert!(matches!(err, CacheError::TypeMismatch { ref key, .. } if key == "alignment"));
    }

    #[test]
    fn test_empty_cache() {
        let cache = ModelCache::new();
        assert!(cache.is_empty());
        assert!(!cache.contains("missing"));
        assert!(cache.created_at("missing").is_none());
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&ModelCache::global(), &ModelCache::global()));
    }
}
