//! A reference-counted cache shared by the page, data item and entry layers.
//!
//! Capacity is an admission bound: when the cache is full and the key is not
//! present, `get` fails with [`Error::CacheFull`] instead of evicting. An item
//! leaves the cache when its last reference is released, at which point the
//! resource's `writeback` runs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// The data source behind a [`RefCache`].
pub trait Resource: Send + Sync {
    type Item: Send + Sync;

    /// Produces the item for `key` on a cache miss.
    fn load(&self, key: u64) -> Result<Self::Item>;

    /// Runs when the last reference to `item` is released.
    fn writeback(&self, key: u64, item: &Arc<Self::Item>) -> Result<()>;
}

enum Slot<T> {
    /// Another thread is loading this key.
    Loading,
    Ready { item: Arc<T>, refs: usize },
}

/// Owns a `Loading` slot while its load runs. On drop it clears the slot
/// unless the load filled it, then wakes the waiters, so a failed or
/// panicking load never strands them.
struct PendingLoad<'a, R: Resource> {
    cache: &'a RefCache<R>,
    key: u64,
}

impl<R: Resource> Drop for PendingLoad<'_, R> {
    fn drop(&mut self) {
        let mut slots = self.cache.slots.lock();
        if matches!(slots.get(&self.key), Some(Slot::Loading)) {
            slots.remove(&self.key);
        }
        drop(slots);
        self.cache.loaded.notify_all();
    }
}

pub struct RefCache<R: Resource> {
    resource: R,
    capacity: usize,
    slots: Mutex<HashMap<u64, Slot<R::Item>>>,
    loaded: Condvar,
}

impl<R: Resource> RefCache<R> {
    /// A `capacity` of zero means unbounded.
    pub fn new(resource: R, capacity: usize) -> Self {
        Self {
            resource,
            capacity,
            slots: Mutex::new(HashMap::new()),
            loaded: Condvar::new(),
        }
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Checks out `key`, loading it on a miss. Each successful call must be
    /// paired with a [`release`](Self::release).
    pub fn get(&self, key: u64) -> Result<Arc<R::Item>> {
        let mut slots = self.slots.lock();
        loop {
            match slots.get_mut(&key) {
                Some(Slot::Loading) => {
                    self.loaded.wait(&mut slots);
                }
                Some(Slot::Ready { item, refs }) => {
                    *refs += 1;
                    return Ok(Arc::clone(item));
                }
                None => {
                    if self.capacity > 0 && slots.len() >= self.capacity {
                        return Err(Error::CacheFull);
                    }
                    slots.insert(key, Slot::Loading);
                    break;
                }
            }
        }
        drop(slots);

        let pending = PendingLoad { cache: self, key };
        let item = Arc::new(self.resource.load(key)?);
        self.slots.lock().insert(
            key,
            Slot::Ready {
                item: Arc::clone(&item),
                refs: 1,
            },
        );
        drop(pending);
        Ok(item)
    }

    /// Drops one reference to `key`; the last one evicts and writes back.
    pub fn release(&self, key: u64) -> Result<()> {
        let mut slots = self.slots.lock();
        let evicted = match slots.get_mut(&key) {
            Some(Slot::Ready { refs, .. }) if *refs > 1 => {
                *refs -= 1;
                None
            }
            Some(Slot::Ready { .. }) => match slots.remove(&key) {
                Some(Slot::Ready { item, .. }) => Some(item),
                _ => None,
            },
            _ => {
                tracing::warn!(key, "release of a key that is not checked out");
                None
            }
        };
        // Written back under the lock so a concurrent miss cannot read stale bytes.
        match evicted {
            Some(item) => self.resource.writeback(key, &item),
            None => Ok(()),
        }
    }

    /// Writes back every cached item regardless of reference count and empties the cache.
    pub fn close(&self) -> Result<()> {
        let mut slots = self.slots.lock();
        let mut first_err = None;
        for (key, slot) in slots.drain() {
            if let Slot::Ready { item, .. } = slot {
                if let Err(e) = self.resource.writeback(key, &item) {
                    tracing::error!(key, error = %e, "writeback failed during close");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of keys currently cached or loading.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        loads: AtomicUsize,
        writebacks: Mutex<Vec<u64>>,
    }

    impl Resource for Counting {
        type Item = u64;

        fn load(&self, key: u64) -> Result<u64> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            if key == 13 {
                return Err(Error::RecordNotFound { uid: key });
            }
            if key == 66 {
                panic!("load of {key} blew up");
            }
            Ok(key * 10)
        }

        fn writeback(&self, key: u64, _item: &Arc<u64>) -> Result<()> {
            self.writebacks.lock().push(key);
            Ok(())
        }
    }

    #[test]
    fn test_refcount_and_writeback() {
        let cache = RefCache::new(Counting::default(), 0);
        assert_eq!(*cache.get(1).unwrap(), 10);
        assert_eq!(*cache.get(1).unwrap(), 10);
        assert_eq!(cache.resource().loads.load(Ordering::SeqCst), 1);

        cache.release(1).unwrap();
        assert!(cache.resource().writebacks.lock().is_empty());
        cache.release(1).unwrap();
        assert_eq!(*cache.resource().writebacks.lock(), vec![1]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_is_admission_bound() {
        let cache = RefCache::new(Counting::default(), 2);
        cache.get(1).unwrap();
        cache.get(2).unwrap();
        assert!(matches!(cache.get(3), Err(Error::CacheFull)));
        // cached keys are still served at capacity
        cache.get(1).unwrap();
        cache.release(2).unwrap();
        cache.get(3).unwrap();
    }

    #[test]
    fn test_concurrent_miss_loads_once() {
        let cache = Arc::new(RefCache::new(Counting::default(), 0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || *cache.get(5).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 50);
        }
        assert_eq!(cache.resource().loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_leaves_no_slot() {
        let cache = RefCache::new(Counting::default(), 1);
        assert!(cache.get(13).is_err());
        assert!(cache.is_empty());
        cache.get(1).unwrap();
    }

    #[test]
    fn test_panicking_load_leaves_no_slot() {
        let cache = Arc::new(RefCache::new(Counting::default(), 0));
        let first = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cache.get(66)));
        assert!(first.is_err());
        assert!(cache.is_empty());

        // a later miss loads again instead of waiting on the dead load
        let again = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get(66).map(|v| *v))
        };
        assert!(again.join().is_err());
        assert_eq!(cache.resource().loads.load(Ordering::SeqCst), 2);
        assert_eq!(*cache.get(6).unwrap(), 60);
    }

    #[test]
    fn test_close_writes_back_everything() {
        let cache = RefCache::new(Counting::default(), 0);
        cache.get(1).unwrap();
        cache.get(2).unwrap();
        cache.get(2).unwrap();
        cache.close().unwrap();
        let mut written = cache.resource().writebacks.lock().clone();
        written.sort();
        assert_eq!(written, vec![1, 2]);
        assert!(cache.is_empty());
    }
}
