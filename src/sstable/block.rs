//! Prefix-compressed key-value blocks.
//!
//! Each entry stores only the suffix of its key that differs from the
//! previous entry. Every `restart_interval`-th entry resets the shared
//! prefix to zero and its offset is recorded in a trailing restart array, so
//! seeks binary-search the restarts and then scan forward.
//!
//! ```text
//! entry:  shared varint32 | unshared varint32 | vlen varint32 | key suffix | value
//! block:  entry* | restart offset fixed32 * n | restart count fixed32
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::{decode_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::comparator::Comparator;
use crate::error::{Error, Result};

pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    /// Entries appended since the last restart point.
    counter: usize,
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> BlockBuilder {
        assert!(restart_interval >= 1);
        BlockBuilder {
            restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// Appends an entry. Keys must arrive in strictly increasing order; the
    /// table builder enforces that with its comparator.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.counter <= self.restart_interval);

        let shared = if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            let mut shared = 0;
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
            shared
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Appends the restart array and count, returning the block payload.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Size of the block if `finish` were called now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// An immutable block, parsed enough to locate its restart array.
pub struct Block {
    data: Vec<u8>,
    /// Offset where entries end and the restart array begins.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too small".to_string()));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]);
        let max_restarts = ((data.len() - 4) / 4) as u32;
        if num_restarts > max_restarts {
            return Err(Error::Corruption("bad restart count in block".to_string()));
        }
        let restart_offset = data.len() - 4 * (num_restarts as usize + 1);
        Ok(Block {
            data,
            restart_offset,
            num_restarts,
        })
    }

    /// Payload size in bytes; the cache charges entries by this.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(self: &Arc<Self>, cmp: Arc<dyn Comparator>) -> BlockIter {
        BlockIter::new(Arc::clone(self), cmp)
    }

    fn restart_point(&self, index: u32) -> u32 {
        debug_assert!(index < self.num_restarts);
        decode_fixed32(&self.data[self.restart_offset + 4 * index as usize..])
    }
}

/// Cursor over one block. Holds the block alive, so iterators handed out by
/// the cache outlive evictions.
pub struct BlockIter {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    /// Offset of the current entry; `restart_offset` when invalid.
    current: usize,
    restart_index: u32,
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    status: Option<Error>,
}

impl BlockIter {
    fn new(block: Arc<Block>, cmp: Arc<dyn Comparator>) -> BlockIter {
        let restart_offset = block.restart_offset;
        let num_restarts = block.num_restarts;
        BlockIter {
            block,
            cmp,
            current: restart_offset,
            restart_index: num_restarts,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            status: None,
        }
    }

    pub fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }

    /// The first decode failure, if iteration hit one.
    pub fn status(&self) -> Result<()> {
        match &self.status {
            None => Ok(()),
            Some(err) => Err(err.duplicate()),
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    /// Steps backward by rescanning from the nearest restart point; entries
    /// carry no reverse links.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());

        let original = self.current;
        while self.block.restart_point(self.restart_index) as usize >= original {
            if self.restart_index == 0 {
                // No entries precede the first one.
                self.current = self.block.restart_offset;
                self.restart_index = self.block.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        // Scan forward until the entry just before `original`.
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    /// Positions at the first entry with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            return;
        }

        // Binary search the restart array for the last restart whose key is
        // < target.
        let mut left: u32 = 0;
        let mut right: u32 = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.decode_restart_key(mid) {
                Some(mid_key) => {
                    if self.cmp.compare(&mid_key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                None => {
                    self.corruption_error();
                    return;
                }
            }
        }

        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    pub fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    pub fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {}
    }

    /// Offset just past the current entry.
    fn next_entry_offset(&self) -> usize {
        self.value_start + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        // Park the value cursor so `parse_next_key` begins at the restart.
        self.value_start = self.block.restart_point(index) as usize;
        self.value_len = 0;
        self.current = self.value_start;
    }

    fn corruption_error(&mut self) {
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts;
        self.key.clear();
        self.value_start = 0;
        self.value_len = 0;
        if self.status.is_none() {
            self.status = Some(Error::Corruption("bad entry in block".to_string()));
        }
    }

    /// Decodes the entry at `next_entry_offset`, returning false at the end
    /// of the block or on corruption.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restart_offset {
            // No more entries; mark invalid.
            self.current = self.block.restart_offset;
            self.restart_index = self.block.num_restarts;
            return false;
        }

        match decode_entry(&self.block.data[..self.block.restart_offset], self.current) {
            Some(entry) => {
                if entry.shared > self.key.len() {
                    self.corruption_error();
                    return false;
                }
                self.key.truncate(entry.shared);
                self.key
                    .extend_from_slice(&self.block.data[entry.key_start..entry.key_start + entry.non_shared]);
                self.value_start = entry.key_start + entry.non_shared;
                self.value_len = entry.value_len;
                while self.restart_index + 1 < self.block.num_restarts
                    && (self.block.restart_point(self.restart_index + 1) as usize) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
            None => {
                self.corruption_error();
                false
            }
        }
    }

    /// Full key at a restart point; `shared` must be zero there.
    fn decode_restart_key(&self, index: u32) -> Option<Vec<u8>> {
        let offset = self.block.restart_point(index) as usize;
        let entry = decode_entry(&self.block.data[..self.block.restart_offset], offset)?;
        if entry.shared != 0 {
            return None;
        }
        Some(self.block.data[entry.key_start..entry.key_start + entry.non_shared].to_vec())
    }
}

struct EntryHeader {
    shared: usize,
    non_shared: usize,
    value_len: usize,
    /// Offset of the unshared key bytes.
    key_start: usize,
}

fn decode_entry(data: &[u8], offset: usize) -> Option<EntryHeader> {
    // A corrupt restart offset may point anywhere; never slice past the end.
    if offset >= data.len() {
        return None;
    }
    let mut pos = offset;
    let (shared, used) = get_varint32(&data[pos..])?;
    pos += used;
    let (non_shared, used) = get_varint32(&data[pos..])?;
    pos += used;
    let (value_len, used) = get_varint32(&data[pos..])?;
    pos += used;

    if data.len() - pos < non_shared as usize + value_len as usize {
        return None;
    }
    Some(EntryHeader {
        shared: shared as usize,
        non_shared: non_shared as usize,
        value_len: value_len as usize,
        key_start: pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    fn build(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Arc::new(Block::new(builder.finish().to_vec()).unwrap())
    }

    fn collect_forward(block: &Arc<Block>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        let mut out = Vec::new();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        out
    }

    #[test]
    fn empty_block() {
        let block = build(&[], 16);
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn single_entry() {
        let block = build(&[(b"key", b"value")], 16);
        assert_eq!(collect_forward(&block), vec![(b"key".to_vec(), b"value".to_vec())]);
    }

    #[test]
    fn shared_prefixes_round_trip() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"apple", b"fruit"),
            (b"application", b"software"),
            (b"banana", b"fruit"),
            (b"band", b"music"),
            (b"bandana", b"clothing"),
        ];
        for restart_interval in [1, 2, 16] {
            let block = build(&entries, restart_interval);
            let got = collect_forward(&block);
            assert_eq!(got.len(), entries.len());
            for ((gk, gv), (ek, ev)) in got.iter().zip(&entries) {
                assert_eq!(gk.as_slice(), *ek);
                assert_eq!(gv.as_slice(), *ev);
            }
        }
    }

    fn numbered_entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    format!("key{i:06}").into_bytes(),
                    format!("value{i}").into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn seek_lands_on_first_at_or_after() {
        let entries = numbered_entries(100);
        let refs: Vec<(&[u8], &[u8])> =
            entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
        let block = build(&refs, 16);
        let mut iter = block.iter(cmp());

        // Exact hits.
        for (key, value) in &entries {
            iter.seek(key);
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_slice());
            assert_eq!(iter.value(), value.as_slice());
        }

        // Between keys: "key000010x" lands on key000011.
        iter.seek(b"key000010x");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key000011");

        // Before the first and past the last.
        iter.seek(b"a");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key000000");
        iter.seek(b"z");
        assert!(!iter.valid());
    }

    #[test]
    fn forward_iteration_is_strictly_increasing() {
        let entries = numbered_entries(200);
        let refs: Vec<(&[u8], &[u8])> =
            entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
        let block = build(&refs, 7);
        let got = collect_forward(&block);
        assert_eq!(got.len(), entries.len());
        for pair in got.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn backward_iteration_visits_all_entries() {
        let entries = numbered_entries(100);
        let refs: Vec<(&[u8], &[u8])> =
            entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
        for restart_interval in [1, 3, 16, 128] {
            let block = build(&refs, restart_interval);
            let mut iter = block.iter(cmp());
            iter.seek_to_last();
            let mut got = Vec::new();
            while iter.valid() {
                got.push(iter.key().to_vec());
                iter.prev();
            }
            got.reverse();
            let expected: Vec<Vec<u8>> = entries.iter().map(|(k, _)| k.clone()).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn mixed_stepping_around_a_seek() {
        let entries = numbered_entries(50);
        let refs: Vec<(&[u8], &[u8])> =
            entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
        let block = build(&refs, 4);
        let mut iter = block.iter(cmp());

        iter.seek(b"key000025");
        iter.prev();
        assert_eq!(iter.key(), b"key000024");
        iter.next();
        assert_eq!(iter.key(), b"key000025");
        iter.next();
        assert_eq!(iter.key(), b"key000026");
    }

    #[test]
    fn prev_from_first_entry_invalidates() {
        let block = build(&[(b"a", b"1"), (b"b", b"2")], 16);
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn truncated_block_is_rejected() {
        assert!(Block::new(vec![0, 0]).is_err());

        // A restart count larger than the block can hold.
        let mut data = Vec::new();
        put_fixed32(&mut data, 1000);
        assert!(Block::new(data).is_err());
    }

    #[test]
    fn corrupt_entry_invalidates_iterator() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"aaa", b"1");
        builder.add(b"bbb", &[0u8; 64]);
        let mut data = builder.finish().to_vec();
        // Inflate the second entry's value length varint so it overruns the
        // block.
        let entry2 = 3 + 3 + 1 + 2; // three header varints + "aaa" + "1"
        data[entry2 + 2] = 0xf0;
        let block = Arc::new(Block::new(data).unwrap());

        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        assert!(iter.valid());
        iter.next();
        assert!(!iter.valid());
        assert!(matches!(iter.status(), Err(Error::Corruption(_))));
    }

    #[test]
    fn estimate_tracks_finished_size() {
        let mut builder = BlockBuilder::new(16);
        assert_eq!(builder.current_size_estimate(), 8); // one restart + count
        builder.add(b"key", b"value");
        let estimate = builder.current_size_estimate();
        assert_eq!(builder.finish().len(), estimate);
    }
}
