//! Bump-pointer allocation for memtable entries and skiplist nodes.
//!
//! The arena hands out raw regions from a current chunk and retains every
//! chunk it ever allocated; nothing is freed until the arena itself drops.
//! That discipline is what lets skiplist readers hold bare pointers into
//! entries without per-node lifetime tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const CHUNK_SIZE: usize = 4096;

pub struct Arena {
    inner: Mutex<Inner>,
    // Read without the lock; eventual consistency is fine for a gauge.
    memory_usage: AtomicUsize,
}

struct Inner {
    alloc_ptr: *mut u8,
    alloc_remaining: usize,
    chunks: Vec<Box<[u8]>>,
}

// The raw pointer inside `Inner` always points into one of the owned chunks,
// and all mutation happens under the mutex.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Arena {
        Arena {
            inner: Mutex::new(Inner {
                alloc_ptr: std::ptr::null_mut(),
                alloc_remaining: 0,
                chunks: Vec::new(),
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Returns `bytes` of uninitialized storage.
    ///
    /// The region lives until the arena drops. Callers must not read it
    /// before writing, and must not alias writes with other live references.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let mut inner = self.inner.lock().unwrap();
        if bytes <= inner.alloc_remaining {
            let result = inner.alloc_ptr;
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(bytes) };
            inner.alloc_remaining -= bytes;
            return result;
        }
        self.allocate_fallback(&mut inner, bytes)
    }

    /// Like `allocate`, but the returned address is aligned to
    /// `max(size_of::<usize>(), 8)`, enough for any node header.
    pub fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let align = std::mem::size_of::<usize>().max(8);
        debug_assert!(align.is_power_of_two());

        let mut inner = self.inner.lock().unwrap();
        let current_mod = inner.alloc_ptr as usize & (align - 1);
        let slop = if current_mod == 0 { 0 } else { align - current_mod };
        let needed = bytes + slop;

        let result = if needed <= inner.alloc_remaining {
            let result = unsafe { inner.alloc_ptr.add(slop) };
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(needed) };
            inner.alloc_remaining -= needed;
            result
        } else {
            // Fresh chunks come from the global allocator and are already
            // aligned beyond our requirement.
            self.allocate_fallback(&mut inner, bytes)
        };
        debug_assert_eq!(result as usize & (align - 1), 0);
        result
    }

    /// Copies `data` into the arena and returns the stable address.
    pub fn allocate_copy(&self, data: &[u8]) -> *const u8 {
        let dst = self.allocate(data.len().max(1));
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        dst
    }

    fn allocate_fallback(&self, inner: &mut Inner, bytes: usize) -> *mut u8 {
        if bytes > CHUNK_SIZE / 4 {
            // Large requests get a dedicated chunk so the leftover of the
            // current chunk is not wasted.
            return self.new_chunk(inner, bytes);
        }

        let ptr = self.new_chunk(inner, CHUNK_SIZE);
        inner.alloc_ptr = unsafe { ptr.add(bytes) };
        inner.alloc_remaining = CHUNK_SIZE - bytes;
        ptr
    }

    fn new_chunk(&self, inner: &mut Inner, chunk_bytes: usize) -> *mut u8 {
        let mut chunk = vec![0u8; chunk_bytes].into_boxed_slice();
        let ptr = chunk.as_mut_ptr();
        inner.chunks.push(chunk);
        self.memory_usage.fetch_add(
            chunk_bytes + std::mem::size_of::<usize>(),
            Ordering::Relaxed,
        );
        ptr
    }

    /// Total bytes obtained from the OS, plus per-chunk pointer overhead.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }
}

impl Default for Arena {
    fn default() -> Arena {
        Arena::new()
    }
}
