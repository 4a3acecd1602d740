//! The mutable in-memory table: a typed facade over the arena skiplist.
//!
//! Entries are stored as a single encoded record so the skiplist only ever
//! sees opaque byte strings:
//!
//! ```text
//! +---------------+--------------+---------------+-------------+
//! | klen varint32 | internal key | vlen varint32 | value bytes |
//! +---------------+--------------+---------------+-------------+
//! ```
//!
//! Readers share the memtable through `Arc`; the flush path drains it with
//! [`MemTable::iter`]. Writes are serialized by the skiplist's writer lock.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::arena::Arena;
use crate::coding::{
    decode_fixed64, get_length_prefixed_slice, put_fixed64, put_varint32, varint_length,
};
use crate::comparator::Comparator;
use crate::key::{
    extract_user_key, pack_sequence_and_type, InternalKeyComparator, LookupKey,
    MemtableKeyComparator, SequenceNumber, ValueType, TAG_LEN,
};
use crate::skiplist::{KeyComparator, SkipList, SkipListIter};

impl KeyComparator for MemtableKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.compare_encoded(a, b)
    }
}

/// Outcome of a point lookup against one memtable.
#[derive(Debug, PartialEq, Eq)]
pub enum LookupResult {
    /// The newest visible entry is a live value.
    Found(Vec<u8>),
    /// The newest visible entry is a tombstone; stop searching older tables.
    Deleted,
    /// No entry for this user key; continue to older tables.
    Missing,
}

pub struct MemTable {
    cmp: InternalKeyComparator,
    list: SkipList<MemtableKeyComparator>,
}

impl MemTable {
    pub fn new(cmp: InternalKeyComparator) -> MemTable {
        let arena = Arc::new(Arena::new());
        let list = SkipList::new(MemtableKeyComparator { internal: cmp.clone() }, arena);
        MemTable { cmp, list }
    }

    /// Bytes the underlying arena has obtained from the OS.
    pub fn approximate_memory_usage(&self) -> usize {
        self.list.arena().memory_usage()
    }

    /// Adds an entry. Distinct writes to the same user key must carry
    /// distinct sequence numbers.
    pub fn add(&self, seq: SequenceNumber, ty: ValueType, user_key: &[u8], value: &[u8]) {
        let internal_key_len = user_key.len() + TAG_LEN;
        let encoded_len = varint_length(internal_key_len as u64)
            + internal_key_len
            + varint_length(value.len() as u64)
            + value.len();

        let mut buf = Vec::with_capacity(encoded_len);
        put_varint32(&mut buf, internal_key_len as u32);
        buf.extend_from_slice(user_key);
        put_fixed64(&mut buf, pack_sequence_and_type(seq, ty));
        put_varint32(&mut buf, value.len() as u32);
        buf.extend_from_slice(value);
        debug_assert_eq!(buf.len(), encoded_len);

        self.list.insert(&buf);
    }

    /// Looks up the newest entry visible at the probe's sequence number.
    pub fn get(&self, key: &LookupKey) -> LookupResult {
        let mut iter = self.list.iter();
        iter.seek(key.memtable_key());
        if !iter.valid() {
            return LookupResult::Missing;
        }

        let entry = iter.key();
        let (internal_key, consumed) =
            get_length_prefixed_slice(entry).expect("corrupt memtable entry");

        // The seek may have landed on a different user key entirely.
        let user_cmp = self.cmp.user_comparator();
        if user_cmp.compare(extract_user_key(internal_key), key.user_key()) != Ordering::Equal {
            return LookupResult::Missing;
        }

        let tag = decode_fixed64(&internal_key[internal_key.len() - TAG_LEN..]);
        match ValueType::from_u8((tag & 0xff) as u8) {
            Some(ValueType::Value) => {
                let (value, _) =
                    get_length_prefixed_slice(&entry[consumed..]).expect("corrupt memtable entry");
                LookupResult::Found(value.to_vec())
            }
            Some(ValueType::Deletion) => LookupResult::Deleted,
            None => LookupResult::Missing,
        }
    }

    pub fn iter(&self) -> MemTableIter<'_> {
        MemTableIter {
            iter: self.list.iter(),
            scratch: Vec::new(),
        }
    }
}

/// Iterates the memtable in internal-key order, yielding decoded keys and
/// values.
pub struct MemTableIter<'a> {
    iter: SkipListIter<'a, MemtableKeyComparator>,
    scratch: Vec<u8>,
}

impl<'a> MemTableIter<'a> {
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// Positions at the first entry with internal key >= `internal_key`.
    pub fn seek(&mut self, internal_key: &[u8]) {
        self.scratch.clear();
        put_varint32(&mut self.scratch, internal_key.len() as u32);
        self.scratch.extend_from_slice(internal_key);
        self.iter.seek(&self.scratch);
    }

    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    pub fn next(&mut self) {
        self.iter.next();
    }

    pub fn prev(&mut self) {
        self.iter.prev();
    }

    /// The current internal key.
    pub fn key(&self) -> &'a [u8] {
        let (key, _) = get_length_prefixed_slice(self.iter.key()).expect("corrupt memtable entry");
        key
    }

    pub fn value(&self) -> &'a [u8] {
        let entry = self.iter.key();
        let (_, consumed) = get_length_prefixed_slice(entry).expect("corrupt memtable entry");
        let (value, _) =
            get_length_prefixed_slice(&entry[consumed..]).expect("corrupt memtable entry");
        value
    }
}
