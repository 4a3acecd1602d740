//! A probabilistic ordered set over opaque byte keys, allocated inside an
//! [`Arena`](crate::arena::Arena).
//!
//! Readers never lock. A node is published by first initializing its own
//! forward pointers, then splicing it into each predecessor bottom-up with
//! release stores; traversal uses acquire loads, so a reader either misses a
//! node entirely or sees it fully initialized. Inserts are serialized
//! internally; the structure assumes a single writer at a time.
//!
//! There are no backward pointers. `prev` re-searches from the head for the
//! predecessor, keeping the reader-side invariant trivial.

use std::cmp::Ordering;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as MemOrder};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::arena::Arena;

pub const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

/// Three-way comparison over the encoded keys the list stores.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Node header followed in memory by `height` forward pointers; only the
/// first tower slot is part of the declared struct, the rest live in the
/// tail of the same arena region.
#[repr(C)]
struct Node {
    key_ptr: *const u8,
    key_len: usize,
    height: usize,
    tower: [AtomicPtr<Node>; 1],
}

impl Node {
    fn key(&self) -> &[u8] {
        // Key bytes live in the arena and are immutable after insert.
        unsafe { std::slice::from_raw_parts(self.key_ptr, self.key_len) }
    }

    fn slot(&self, level: usize) -> &AtomicPtr<Node> {
        debug_assert!(level < self.height);
        unsafe {
            let first = ptr::addr_of!(self.tower) as *const AtomicPtr<Node>;
            &*first.add(level)
        }
    }

    fn next(&self, level: usize) -> *mut Node {
        // Acquire pairs with the release store in `set_next`, so any node we
        // observe here is fully initialized.
        self.slot(level).load(MemOrder::Acquire)
    }

    fn set_next(&self, level: usize, node: *mut Node) {
        self.slot(level).store(node, MemOrder::Release)
    }

    fn nobarrier_next(&self, level: usize) -> *mut Node {
        self.slot(level).load(MemOrder::Relaxed)
    }

    fn nobarrier_set_next(&self, level: usize, node: *mut Node) {
        self.slot(level).store(node, MemOrder::Relaxed)
    }
}

fn new_node(arena: &Arena, key: &[u8], height: usize) -> *mut Node {
    debug_assert!((1..=MAX_HEIGHT).contains(&height));
    let size = mem::size_of::<Node>() + (height - 1) * mem::size_of::<AtomicPtr<Node>>();
    let node = arena.allocate_aligned(size) as *mut Node;
    let key_ptr = arena.allocate_copy(key);
    unsafe {
        ptr::addr_of_mut!((*node).key_ptr).write(key_ptr);
        ptr::addr_of_mut!((*node).key_len).write(key.len());
        ptr::addr_of_mut!((*node).height).write(height);
        let first = ptr::addr_of_mut!((*node).tower) as *mut AtomicPtr<Node>;
        for level in 0..height {
            first.add(level).write(AtomicPtr::new(ptr::null_mut()));
        }
    }
    node
}

pub struct SkipList<C: KeyComparator> {
    cmp: C,
    arena: Arc<Arena>,
    head: *mut Node,
    // Grows monotonically; read racily by readers. A stale value is safe
    // because head pointers above the true height are null.
    max_height: AtomicUsize,
    // Serializes writers and owns the height generator.
    writer: Mutex<StdRng>,
}

unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    pub fn new(cmp: C, arena: Arc<Arena>) -> SkipList<C> {
        let head = new_node(&arena, b"", MAX_HEIGHT);
        SkipList {
            cmp,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            writer: Mutex::new(StdRng::seed_from_u64(0xdeadbeef)),
        }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    fn current_max_height(&self) -> usize {
        self.max_height.load(MemOrder::Relaxed)
    }

    fn random_height(rng: &mut StdRng) -> usize {
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING) == 0 {
            height += 1;
        }
        height
    }

    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        !node.is_null() && self.cmp.compare(unsafe { (*node).key() }, key) == Ordering::Less
    }

    /// First node whose key is >= `key`, or null. When `prev` is supplied it
    /// receives the predecessor at every level, for splicing.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut node = self.head;
        let mut level = self.current_max_height() - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if self.key_is_after_node(key, next) {
                node = next;
            } else {
                if let Some(prev) = prev.as_mut() {
                    prev[level] = node;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Latest node whose key is < `key`; the head when there is none.
    fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut node = self.head;
        let mut level = self.current_max_height() - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            let keep_going =
                !next.is_null() && self.cmp.compare(unsafe { (*next).key() }, key) == Ordering::Less;
            if keep_going {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }

    /// Last node in the list; the head when the list is empty.
    fn find_last(&self) -> *mut Node {
        let mut node = self.head;
        let mut level = self.current_max_height() - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if !next.is_null() {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }

    /// Inserts `key`, which must not already be present.
    pub fn insert(&self, key: &[u8]) {
        let mut rng = self.writer.lock().unwrap();

        let mut prev = [ptr::null_mut(); MAX_HEIGHT];
        let node = self.find_greater_or_equal(key, Some(&mut prev));
        debug_assert!(
            node.is_null() || self.cmp.compare(unsafe { (*node).key() }, key) != Ordering::Equal,
            "duplicate key inserted into skiplist"
        );

        let height = Self::random_height(&mut rng);
        if height > self.current_max_height() {
            for slot in prev.iter_mut().take(height).skip(self.current_max_height()) {
                *slot = self.head;
            }
            // Relaxed is enough: a reader that sees the new height before the
            // new node finds null at the extra levels and drops down, which
            // is the pre-insert picture.
            self.max_height.store(height, MemOrder::Relaxed);
        }

        let node = new_node(&self.arena, key, height);
        for level in 0..height {
            unsafe {
                // The node is unpublished, so its own pointer needs no
                // barrier; the store into prev is the publication point.
                (*node).nobarrier_set_next(level, (*prev[level]).nobarrier_next(level));
                (*prev[level]).set_next(level, node);
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let node = self.find_greater_or_equal(key, None);
        !node.is_null() && self.cmp.compare(unsafe { (*node).key() }, key) == Ordering::Equal
    }

    pub fn iter(&self) -> SkipListIter<'_, C> {
        SkipListIter {
            list: self,
            node: ptr::null_mut(),
        }
    }
}

/// A cursor over the list. Keys it yields stay valid as long as the list
/// (and therefore its arena) is alive.
pub struct SkipListIter<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *mut Node,
}

impl<'a, C: KeyComparator> SkipListIter<'a, C> {
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    pub fn key(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { mem::transmute::<&[u8], &'a [u8]>((*self.node).key()) }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let node = self.list.find_less_than(unsafe { (*self.node).key() });
        self.node = if node == self.list.head {
            ptr::null_mut()
        } else {
            node
        };
    }

    /// Positions at the first entry with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    pub fn seek_to_last(&mut self) {
        let node = self.list.find_last();
        self.node = if node == self.list.head {
            ptr::null_mut()
        } else {
            node
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicBool;

    #[derive(Clone)]
    struct Bytewise;

    impl KeyComparator for Bytewise {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
    }

    fn new_list() -> SkipList<Bytewise> {
        SkipList::new(Bytewise, Arc::new(Arena::new()))
    }

    fn encode(n: u64) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    #[test]
    fn empty_list() {
        let list = new_list();
        assert!(!list.contains(b"anything"));

        let mut iter = list.iter();
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"x");
        assert!(!iter.valid());
    }

    #[test]
    fn insert_and_lookup() {
        let mut rng = StdRng::seed_from_u64(1000);
        let mut model = BTreeSet::new();
        let list = new_list();

        for _ in 0..2000 {
            let key = encode(rng.gen_range(0..5000u64));
            if model.insert(key.clone()) {
                list.insert(&key);
            }
        }

        for n in 0..5000u64 {
            assert_eq!(list.contains(&encode(n)), model.contains(&encode(n)), "key {n}");
        }

        // Forward iteration yields the model's order.
        let mut iter = list.iter();
        iter.seek_to_first();
        for expected in &model {
            assert!(iter.valid());
            assert_eq!(iter.key(), expected.as_slice());
            iter.next();
        }
        assert!(!iter.valid());

        // Backward iteration yields reverse order.
        let mut iter = list.iter();
        iter.seek_to_last();
        for expected in model.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), expected.as_slice());
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn seek_finds_first_at_or_after() {
        let list = new_list();
        for n in [10u64, 20, 30, 40] {
            list.insert(&encode(n));
        }

        let mut iter = list.iter();
        iter.seek(&encode(20));
        assert!(iter.valid());
        assert_eq!(iter.key(), encode(20).as_slice());

        iter.seek(&encode(25));
        assert!(iter.valid());
        assert_eq!(iter.key(), encode(30).as_slice());

        iter.seek(&encode(45));
        assert!(!iter.valid());
    }

    #[test]
    fn prev_from_first_invalidates() {
        let list = new_list();
        list.insert(b"only");
        let mut iter = list.iter();
        iter.seek_to_first();
        assert!(iter.valid());
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn insertion_order_is_irrelevant() {
        let forward = new_list();
        let backward = new_list();
        for n in 0..500u64 {
            forward.insert(&encode(n));
            backward.insert(&encode(499 - n));
        }
        let (mut fi, mut bi) = (forward.iter(), backward.iter());
        fi.seek_to_first();
        bi.seek_to_first();
        while fi.valid() {
            assert!(bi.valid());
            assert_eq!(fi.key(), bi.key());
            fi.next();
            bi.next();
        }
        assert!(!bi.valid());
    }

    #[test]
    fn concurrent_readers_see_sorted_prefixes() {
        // One writer inserts while readers continuously scan. Every scan
        // must observe a strictly sorted sequence of previously inserted
        // keys, regardless of where the writer is.
        let list = Arc::new(new_list());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let list = Arc::clone(&list);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(MemOrder::Acquire) {
                        let mut iter = list.iter();
                        iter.seek_to_first();
                        let mut last: Option<Vec<u8>> = None;
                        while iter.valid() {
                            let key = iter.key().to_vec();
                            if let Some(prev) = &last {
                                assert!(prev < &key, "scan observed unsorted keys");
                            }
                            last = Some(key);
                            iter.next();
                        }
                    }
                })
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(7);
        let mut inserted = BTreeSet::new();
        for _ in 0..3000 {
            let key = encode(rng.gen::<u32>() as u64);
            if inserted.insert(key.clone()) {
                list.insert(&key);
            }
        }
        done.store(true, MemOrder::Release);
        for reader in readers {
            reader.join().unwrap();
        }

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, inserted.len());
    }
}
