#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// One mutex per key, created on first use. Serializes decide-then-act sequences for a
/// single bot without blocking other bots.
#[derive(Debug)]
pub struct KeyedLocks<K: Ord + Clone> {
    slots: Mutex<BTreeMap<K, Arc<Mutex<()>>>>,
}

impl<K: Ord + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let _guard = slot.lock();
        f()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
