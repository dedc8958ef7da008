//! Bounded image info cache
//!
//! Keys are canonical image references. Only successful resolutions are
//! stored; the least recently used entry is evicted when full.

use lru::LruCache;
use ordertask_core::domain::image::ImageInfo;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

pub const DEFAULT_CAPACITY: usize = 1024;

pub struct ImageCache {
    entries: Mutex<LruCache<String, Arc<ImageInfo>>>,
}

impl ImageCache {
    /// Creates a cache holding at most `capacity` images (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<ImageInfo>> {
        self.lock().get(key).cloned()
    }

    pub fn put(&self, key: String, info: Arc<ImageInfo>) {
        self.lock().put(key, info);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<ImageInfo>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
