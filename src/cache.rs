//! Sharded LRU cache with reference-counted, pinnable entries.
//!
//! The cache is split into 16 shards selected by the top four bits of the
//! key's hash; each shard owns its own lock, chained hash table, and a pair
//! of intrusive lists:
//!
//! - `lru`: cached entries nobody holds a handle to, oldest at the head.
//!   Eviction only ever takes from here.
//! - `in_use`: entries pinned by outstanding handles, unordered.
//!
//! Every entry carries a reference count plus an `in_cache` flag. The cache
//! itself owns one reference; each live [`Handle`] owns another. An entry
//! evicted or erased while pinned stays allocated until its last handle
//! drops, so readers never observe a freed value.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use xxhash_rust::xxh32::xxh32;

const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

/// Observes entries as they are destroyed: the point where the cached value
/// is released.
pub type EvictionCallback<V> = Box<dyn Fn(&[u8], &V) + Send + Sync>;

struct Entry<V> {
    key: Vec<u8>,
    value: V,
    hash: u32,
    charge: usize,
    /// References held: one for the cache while `in_cache`, one per handle.
    refs: u32,
    /// Whether the cache still indexes this entry. Cleared by erase,
    /// replacement, and eviction; the entry may outlive the flag.
    in_cache: bool,
    next_hash: *mut Entry<V>,
    next: *mut Entry<V>,
    prev: *mut Entry<V>,
}

/// Doubly-linked list of entries; head is oldest, tail newest.
struct List<V> {
    head: *mut Entry<V>,
    tail: *mut Entry<V>,
}

impl<V> List<V> {
    fn new() -> List<V> {
        List {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    unsafe fn push_back(&mut self, e: *mut Entry<V>) {
        (*e).next = ptr::null_mut();
        (*e).prev = self.tail;
        if self.tail.is_null() {
            self.head = e;
        } else {
            (*self.tail).next = e;
        }
        self.tail = e;
    }

    unsafe fn unlink(&mut self, e: *mut Entry<V>) {
        let prev = (*e).prev;
        let next = (*e).next;
        if prev.is_null() {
            self.head = next;
        } else {
            (*prev).next = next;
        }
        if next.is_null() {
            self.tail = prev;
        } else {
            (*next).prev = prev;
        }
        (*e).prev = ptr::null_mut();
        (*e).next = ptr::null_mut();
    }
}

/// Chained hash table over entry pointers, grown when the element count
/// passes the bucket count.
struct HandleTable<V> {
    buckets: Vec<*mut Entry<V>>,
    elems: usize,
}

impl<V> HandleTable<V> {
    fn new() -> HandleTable<V> {
        HandleTable {
            buckets: vec![ptr::null_mut(); 4],
            elems: 0,
        }
    }

    /// Slot holding the matching entry, or the trailing null slot of its
    /// bucket chain.
    unsafe fn find_slot(&mut self, key: &[u8], hash: u32) -> *mut *mut Entry<V> {
        let idx = (hash as usize) & (self.buckets.len() - 1);
        let mut slot: *mut *mut Entry<V> = &mut self.buckets[idx];
        while !(*slot).is_null() && ((**slot).hash != hash || (**slot).key != key) {
            slot = ptr::addr_of_mut!((**slot).next_hash);
        }
        slot
    }

    unsafe fn lookup(&mut self, key: &[u8], hash: u32) -> *mut Entry<V> {
        *self.find_slot(key, hash)
    }

    /// Inserts, returning the displaced entry with the same key if any.
    unsafe fn insert(&mut self, e: *mut Entry<V>) -> *mut Entry<V> {
        let hash = (*e).hash;
        let slot = {
            let key = &*ptr::addr_of!((*e).key);
            self.find_slot(key, hash)
        };
        let old = *slot;
        (*e).next_hash = if old.is_null() {
            ptr::null_mut()
        } else {
            (*old).next_hash
        };
        *slot = e;
        if old.is_null() {
            self.elems += 1;
            if self.elems > self.buckets.len() {
                self.resize();
            }
        }
        old
    }

    unsafe fn remove(&mut self, key: &[u8], hash: u32) -> *mut Entry<V> {
        let slot = self.find_slot(key, hash);
        let e = *slot;
        if !e.is_null() {
            *slot = (*e).next_hash;
            self.elems -= 1;
        }
        e
    }

    unsafe fn resize(&mut self) {
        let mut new_len = 4;
        while new_len < self.elems {
            new_len *= 2;
        }
        let mut new_buckets: Vec<*mut Entry<V>> = vec![ptr::null_mut(); new_len];
        for idx in 0..self.buckets.len() {
            let mut e = self.buckets[idx];
            while !e.is_null() {
                let next = (*e).next_hash;
                let slot = &mut new_buckets[((*e).hash as usize) & (new_len - 1)];
                (*e).next_hash = *slot;
                *slot = e;
                e = next;
            }
        }
        self.buckets = new_buckets;
    }
}

/// One lock's worth of cache.
struct Shard<V> {
    capacity: usize,
    usage: usize,
    lru: List<V>,
    in_use: List<V>,
    table: HandleTable<V>,
}

impl<V> Shard<V> {
    fn new(capacity: usize) -> Shard<V> {
        Shard {
            capacity,
            usage: 0,
            lru: List::new(),
            in_use: List::new(),
            table: HandleTable::new(),
        }
    }

    unsafe fn ref_entry(&mut self, e: *mut Entry<V>) {
        if (*e).refs == 1 && (*e).in_cache {
            // Gaining its first external reference; pin it.
            self.lru.unlink(e);
            self.in_use.push_back(e);
        }
        (*e).refs += 1;
    }

    unsafe fn unref_entry(&mut self, e: *mut Entry<V>, callback: &Option<EvictionCallback<V>>) {
        debug_assert!((*e).refs > 0);
        (*e).refs -= 1;
        if (*e).refs == 0 {
            debug_assert!(!(*e).in_cache);
            let entry = Box::from_raw(e);
            if let Some(callback) = callback {
                callback(&entry.key, &entry.value);
            }
            drop(entry);
        } else if (*e).in_cache && (*e).refs == 1 {
            // Last external reference gone; becomes evictable.
            self.in_use.unlink(e);
            self.lru.push_back(e);
        }
    }

    unsafe fn lookup(&mut self, key: &[u8], hash: u32) -> *mut Entry<V> {
        let e = self.table.lookup(key, hash);
        if !e.is_null() {
            self.ref_entry(e);
        }
        e
    }

    unsafe fn insert(
        &mut self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
        callback: &Option<EvictionCallback<V>>,
    ) -> *mut Entry<V> {
        let e = Box::into_raw(Box::new(Entry {
            key: key.to_vec(),
            value,
            hash,
            charge,
            refs: 1, // the returned handle
            in_cache: false,
            next_hash: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }));

        if self.capacity > 0 {
            (*e).refs += 1; // the cache's reference
            (*e).in_cache = true;
            self.in_use.push_back(e);
            self.usage += charge;
            let displaced = self.table.insert(e);
            self.finish_erase(displaced, callback);
        }
        // capacity == 0 turns caching off; the entry lives only as long as
        // the caller's handle.

        while self.usage > self.capacity && !self.lru.head.is_null() {
            let old = self.lru.head;
            debug_assert_eq!((*old).refs, 1);
            let removed = {
                let key = &*ptr::addr_of!((*old).key);
                self.table.remove(key, (*old).hash)
            };
            self.finish_erase(removed, callback);
        }

        e
    }

    /// Completes removal of an entry already taken out of the hash table.
    unsafe fn finish_erase(&mut self, e: *mut Entry<V>, callback: &Option<EvictionCallback<V>>) {
        if e.is_null() {
            return;
        }
        debug_assert!((*e).in_cache);
        if (*e).refs == 1 {
            self.lru.unlink(e);
        } else {
            self.in_use.unlink(e);
        }
        (*e).in_cache = false;
        self.usage -= (*e).charge;
        self.unref_entry(e, callback);
    }

    unsafe fn erase(&mut self, key: &[u8], hash: u32, callback: &Option<EvictionCallback<V>>) {
        let e = self.table.remove(key, hash);
        self.finish_erase(e, callback);
    }

    unsafe fn prune(&mut self, callback: &Option<EvictionCallback<V>>) {
        while !self.lru.head.is_null() {
            let e = self.lru.head;
            debug_assert_eq!((*e).refs, 1);
            let removed = {
                let key = &*ptr::addr_of!((*e).key);
                self.table.remove(key, (*e).hash)
            };
            self.finish_erase(removed, callback);
        }
    }
}

/// A cache of byte-string keys to values of type `V`, sharded 16 ways.
pub struct ShardedCache<V> {
    shards: Vec<Mutex<Shard<V>>>,
    callback: Option<EvictionCallback<V>>,
    last_id: AtomicU64,
}

// Entries only move between threads under a shard lock; values are shared
// read-only through handles.
unsafe impl<V: Send + Sync> Send for ShardedCache<V> {}
unsafe impl<V: Send + Sync> Sync for ShardedCache<V> {}

impl<V> ShardedCache<V> {
    pub fn new(capacity: usize) -> ShardedCache<V> {
        Self::build(capacity, None)
    }

    /// A cache that reports every destroyed entry to `callback`.
    pub fn with_eviction_callback(capacity: usize, callback: EvictionCallback<V>) -> ShardedCache<V> {
        Self::build(capacity, Some(callback))
    }

    fn build(capacity: usize, callback: Option<EvictionCallback<V>>) -> ShardedCache<V> {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        ShardedCache {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(Shard::new(per_shard))).collect(),
            callback,
            last_id: AtomicU64::new(0),
        }
    }

    fn hash(key: &[u8]) -> u32 {
        xxh32(key, 0)
    }

    fn shard(&self, hash: u32) -> &Mutex<Shard<V>> {
        &self.shards[(hash >> (32 - NUM_SHARD_BITS)) as usize]
    }

    /// Inserts `value` under `key`, accounting `charge` bytes against the
    /// capacity, and returns a handle pinning it.
    pub fn insert(&self, key: &[u8], value: V, charge: usize) -> Handle<'_, V> {
        let hash = Self::hash(key);
        let mut shard = self.shard(hash).lock().unwrap();
        let entry = unsafe { shard.insert(key, hash, value, charge, &self.callback) };
        Handle { cache: self, entry }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<Handle<'_, V>> {
        let hash = Self::hash(key);
        let mut shard = self.shard(hash).lock().unwrap();
        let entry = unsafe { shard.lookup(key, hash) };
        if entry.is_null() {
            None
        } else {
            Some(Handle { cache: self, entry })
        }
    }

    /// Drops `handle`, releasing its pin. Equivalent to `drop(handle)`.
    pub fn release(&self, handle: Handle<'_, V>) {
        drop(handle);
    }

    pub fn erase(&self, key: &[u8]) {
        let hash = Self::hash(key);
        let mut shard = self.shard(hash).lock().unwrap();
        unsafe { shard.erase(key, hash, &self.callback) };
    }

    /// Evicts everything not currently pinned.
    pub fn prune(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            unsafe { shard.prune(&self.callback) };
        }
    }

    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().usage).sum()
    }

    /// A fresh id for partitioning one cache among several clients.
    pub fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl<V> Drop for ShardedCache<V> {
    fn drop(&mut self) {
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            // Handles borrow the cache, so none can be alive here.
            debug_assert!(shard.in_use.head.is_null());
            unsafe { shard.prune(&self.callback) };
        }
    }
}

/// A pinned reference to a cache entry. The entry cannot be destroyed while
/// the handle is alive, even if it gets evicted or erased; dropping the
/// handle releases the pin.
pub struct Handle<'a, V> {
    cache: &'a ShardedCache<V>,
    entry: *mut Entry<V>,
}

unsafe impl<V: Send + Sync> Send for Handle<'_, V> {}
unsafe impl<V: Send + Sync> Sync for Handle<'_, V> {}

impl<V> Handle<'_, V> {
    pub fn value(&self) -> &V {
        // The value field is immutable for the entry's whole life; only the
        // bookkeeping fields change under the shard lock.
        unsafe { &*ptr::addr_of!((*self.entry).value) }
    }
}

impl<V> Drop for Handle<'_, V> {
    fn drop(&mut self) {
        let hash = unsafe { (*self.entry).hash };
        let mut shard = self.cache.shard(hash).lock().unwrap();
        unsafe { shard.unref_entry(self.entry, &self.cache.callback) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records destroyed (key, value) pairs for assertions.
    fn counting_cache(capacity: usize) -> (ShardedCache<u32>, Arc<Mutex<Vec<(Vec<u8>, u32)>>>) {
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&destroyed);
        let cache = ShardedCache::with_eviction_callback(
            capacity,
            Box::new(move |key: &[u8], value: &u32| {
                sink.lock().unwrap().push((key.to_vec(), *value));
            }),
        );
        (cache, destroyed)
    }

    fn get(cache: &ShardedCache<u32>, key: &[u8]) -> Option<u32> {
        cache.lookup(key).map(|handle| *handle.value())
    }

    #[test]
    fn hit_and_miss() {
        let (cache, destroyed) = counting_cache(1000);
        assert_eq!(get(&cache, b"100"), None);

        cache.insert(b"100", 101, 1);
        assert_eq!(get(&cache, b"100"), Some(101));
        assert_eq!(get(&cache, b"200"), None);

        cache.insert(b"200", 201, 1);
        assert_eq!(get(&cache, b"100"), Some(101));
        assert_eq!(get(&cache, b"200"), Some(201));

        // Replacement destroys the old value.
        cache.insert(b"100", 102, 1);
        assert_eq!(get(&cache, b"100"), Some(102));
        let destroyed = destroyed.lock().unwrap();
        assert_eq!(destroyed.as_slice(), &[(b"100".to_vec(), 101)]);
    }

    #[test]
    fn erase_destroys_unpinned_entries() {
        let (cache, destroyed) = counting_cache(1000);
        cache.erase(b"nope"); // erasing a missing key is a no-op

        cache.insert(b"100", 101, 1);
        cache.insert(b"200", 201, 1);
        cache.erase(b"100");
        assert_eq!(get(&cache, b"100"), None);
        assert_eq!(get(&cache, b"200"), Some(201));
        assert_eq!(destroyed.lock().unwrap().len(), 1);

        cache.erase(b"100");
        assert_eq!(destroyed.lock().unwrap().len(), 1);
    }

    #[test]
    fn pinned_entries_survive_erase() {
        let (cache, destroyed) = counting_cache(1000);
        cache.insert(b"100", 101, 1);
        let pin = cache.lookup(b"100").unwrap();

        cache.erase(b"100");
        // Gone from the index but still alive through the pin.
        assert_eq!(get(&cache, b"100"), None);
        assert_eq!(*pin.value(), 101);
        assert!(destroyed.lock().unwrap().is_empty());

        drop(pin);
        assert_eq!(destroyed.lock().unwrap().as_slice(), &[(b"100".to_vec(), 101)]);
    }

    #[test]
    fn pinned_entries_survive_replacement() {
        let (cache, destroyed) = counting_cache(1000);
        cache.insert(b"k", 1, 1);
        let pin = cache.lookup(b"k").unwrap();

        cache.insert(b"k", 2, 1);
        assert_eq!(get(&cache, b"k"), Some(2));
        assert_eq!(*pin.value(), 1);
        assert!(destroyed.lock().unwrap().is_empty());

        drop(pin);
        assert_eq!(destroyed.lock().unwrap().as_slice(), &[(b"k".to_vec(), 1)]);
    }

    // Small-capacity behavior is per shard; use single-shard-sized keys by
    // spreading entries and asserting totals instead of specific victims
    // where sharding would make the test flaky. For deterministic eviction
    // order, all keys in one test must land in one shard, which is not
    // guaranteed by the hash. The promotion test therefore uses a capacity
    // large enough that only explicit pressure evicts.

    #[test]
    fn eviction_prefers_oldest_unpinned() {
        // Single-entry shards: capacity 16 spreads one unit to each shard,
        // so a shard evicts as soon as it holds two unpinned units.
        let (cache, _destroyed) = counting_cache(16);

        cache.insert(b"a", 1, 1);
        // Re-inserting the same key replaces in place and does not grow
        // usage beyond one unit for this shard.
        cache.insert(b"a", 2, 1);
        assert_eq!(get(&cache, b"a"), Some(2));
        assert_eq!(cache.total_charge(), 1);
    }

    #[test]
    fn pinned_entries_are_never_evicted() {
        let (cache, destroyed) = counting_cache(16);

        let pin = cache.insert(b"pinned", 7, 64); // far over any shard budget
        for i in 0..100u32 {
            cache.insert(format!("filler{i}").as_bytes(), i, 1);
        }
        // The oversized pinned entry is still reachable.
        assert_eq!(*pin.value(), 7);
        assert_eq!(get(&cache, b"pinned"), Some(7));
        drop(pin);

        // Now unpinned and far over budget: the next insert in its shard
        // evicts it. Prune reaches every shard deterministically.
        cache.prune();
        assert_eq!(get(&cache, b"pinned"), None);
        assert!(destroyed.lock().unwrap().iter().any(|(k, _)| k == b"pinned"));
    }

    #[test]
    fn lru_promotion_under_pressure() {
        // One shard's worth of traffic, forced by using the same capacity
        // accounting as the two-list design: pinned entries sit in `in_use`
        // and are skipped; the oldest `lru` entry goes first.
        let (cache, destroyed) = counting_cache(16);

        // Fill one unit per key; all inserts released immediately.
        for key in [&b"A"[..], b"B", b"C"] {
            cache.insert(key, key[0] as u32, 1);
        }
        let pin_a = cache.lookup(b"A").unwrap();

        // Evict everything evictable: A is pinned and must survive.
        cache.prune();
        assert_eq!(get(&cache, b"B"), None);
        assert_eq!(get(&cache, b"C"), None);
        assert_eq!(*pin_a.value(), b'A' as u32);
        assert_eq!(get(&cache, b"A"), Some(b'A' as u32));

        let evicted: Vec<Vec<u8>> =
            destroyed.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert!(evicted.contains(&b"B".to_vec()));
        assert!(evicted.contains(&b"C".to_vec()));
        assert!(!evicted.contains(&b"A".to_vec()));

        // Released, A becomes evictable.
        drop(pin_a);
        cache.prune();
        assert_eq!(get(&cache, b"A"), None);
    }

    #[test]
    fn usage_tracks_charges() {
        let (cache, _) = counting_cache(100_000);
        let mut expected = 0;
        for i in 0..50u32 {
            let charge = (i as usize % 7) + 1;
            expected += charge;
            cache.insert(format!("key{i}").as_bytes(), i, charge);
        }
        assert_eq!(cache.total_charge(), expected);

        cache.erase(b"key0");
        assert_eq!(cache.total_charge(), expected - 1);

        cache.prune();
        assert_eq!(cache.total_charge(), 0);
    }

    #[test]
    fn prune_spares_pinned_entries() {
        let (cache, _) = counting_cache(1000);
        cache.insert(b"gone", 1, 1);
        let pin = cache.insert(b"kept", 2, 1);

        cache.prune();
        assert_eq!(get(&cache, b"gone"), None);
        assert_eq!(get(&cache, b"kept"), Some(2));
        drop(pin);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let (cache, destroyed) = counting_cache(0);
        let handle = cache.insert(b"k", 9, 1);
        assert_eq!(*handle.value(), 9);
        // Never indexed.
        assert_eq!(get(&cache, b"k"), None);
        drop(handle);
        assert_eq!(destroyed.lock().unwrap().len(), 1);
    }

    #[test]
    fn new_ids_are_distinct() {
        let (cache, _) = counting_cache(16);
        let a = cache.new_id();
        let b = cache.new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn dropping_the_cache_destroys_entries() {
        let (cache, destroyed) = counting_cache(1000);
        for i in 0..10u32 {
            cache.insert(format!("k{i}").as_bytes(), i, 1);
        }
        drop(cache);
        assert_eq!(destroyed.lock().unwrap().len(), 10);
    }

    #[test]
    fn concurrent_lookups_and_inserts() {
        let cache = Arc::new(ShardedCache::<u64>::new(512));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..2000u64 {
                        let key = format!("key{}", i % 300);
                        if (i + t) % 3 == 0 {
                            cache.insert(key.as_bytes(), i, 1);
                        } else if let Some(handle) = cache.lookup(key.as_bytes()) {
                            // Hold the pin across a reinsertion window.
                            let v = *handle.value();
                            assert!(v < 2000);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
