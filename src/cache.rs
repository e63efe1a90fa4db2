//! The page cache (spec.md §4.5): a bounded, thread-safe LRU keyed by page
//! offset, mapping to decoded page instances.
//!
//! Grounded on `src/pager/cache.rs`'s intrusive `Cache<K, V>` (a `NonNull`
//! doubly linked list driving FIFO eviction) and `src/lru.rs`'s `Lru<T>`
//! wrapper around the `lru` crate. Neither is reused directly: spec.md §5
//! requires the cache to be thread-safe ("concurrent `get`s on the same
//! offset return the same page without duplicate I/O"), so this
//! reimplements the same bounded-LRU shape as a `Mutex`-guarded index
//! slab instead of raw pointers — no `unsafe` needed for the same O(1)
//! touch/evict behavior.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Hash + Eq + Clone, V> Inner<K, V> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("slot occupied");
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn attach_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().expect("slot occupied");
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.attach_front(idx);
    }

    fn pop_tail(&mut self) {
        let Some(idx) = self.tail else { return };
        self.detach(idx);
        let slot = self.slots[idx].take().expect("slot occupied");
        self.free.push(idx);
        self.map.remove(&slot.key);
    }
}

/// A bounded LRU cache. Eviction only drops the cache's own strong
/// reference to a value (typically an `Arc<Page<..>>`); a reader that
/// already cloned the `Arc` out keeps the page alive regardless (spec.md
/// §9 Design Notes, "Ownership").
pub struct Cache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> Cache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns a clone of the cached value and marks it most-recently-used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let idx = *inner.map.get(key)?;
        inner.touch(idx);
        Some(inner.slots[idx].as_ref().unwrap().value.clone())
    }

    /// Inserts or overwrites an entry, evicting the least-recently-used
    /// entry first if the cache is at capacity. Idempotent: inserting the
    /// same key again just updates the value and recency.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&idx) = inner.map.get(&key) {
            inner.slots[idx].as_mut().unwrap().value = value;
            inner.touch(idx);
            return;
        }

        if inner.map.len() >= self.capacity {
            inner.pop_tail();
            log::trace!("page cache evicted an entry (capacity {})", self.capacity);
        }

        let idx = match inner.free.pop() {
            Some(i) => i,
            None => {
                inner.slots.push(None);
                inner.slots.len() - 1
            }
        };

        inner.slots[idx] = Some(Slot {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        inner.map.insert(key, idx);
        inner.attach_front(idx);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache = Cache::new(2);
        cache.insert(1, "one");
        cache.insert(2, "two");

        // Touch 1 so 2 becomes the LRU entry.
        assert_eq!(cache.get(&1), Some("one"));

        cache.insert(3, "three");

        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&3), Some("three"));
    }

    #[test]
    fn reinsert_is_idempotent_and_updates_recency() {
        let cache = Cache::new(2);
        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(1, "one-updated");

        cache.insert(3, "three");

        // 2 was least recently touched, should be evicted instead of 1.
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("one-updated"));
    }

    #[test]
    fn capacity_one_still_works() {
        let cache = Cache::new(1);
        cache.insert(1, "one");
        cache.insert(2, "two");
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some("two"));
    }
}
