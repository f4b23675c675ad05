use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

/// Arena of per-key mutexes. Holders of different keys never contend; a
/// key's slot is dropped once nobody holds or waits on it.
#[derive(Debug)]
pub(crate) struct LockTable<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Block until the lock for `key` is held.
    pub(crate) fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let slot = Arc::clone(
            self.slots
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        KeyGuard {
            table: self,
            key: key.clone(),
            guard: Some(slot.lock_arc()),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

pub(crate) struct KeyGuard<'a, K: Eq + Hash + Clone> {
    table: &'a LockTable<K>,
    key: K,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.table.slots.lock();
        // Only the table itself still references the slot: no waiters.
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}
