//! Partitioned filter blocks.
//!
//! One filter summarizes the keys of every data block that begins within a
//! 2 KiB stride of the file. A lookup divides the data block's file offset
//! by the stride to pick the filter to probe.
//!
//! ```text
//! filter bytes* | offset fixed32 per filter | offset-array start fixed32 | log2(stride) u8
//! ```

use std::sync::Arc;

use tracing::warn;

use crate::coding::{decode_fixed32, put_fixed32};
use crate::filter::FilterPolicy;

/// Generate a new filter every 2 KiB of file space.
pub const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Flattened key bytes accumulated since the last filter was cut.
    keys: Vec<u8>,
    /// Start offset of each key inside `keys`.
    starts: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> FilterBlockBuilder {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            starts: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Called whenever a data block begins at `block_offset`; cuts filters
    /// for every stride boundary the file has crossed, emitting empty
    /// filters for strides without keys.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.starts.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.starts.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;
        for &offset in &self.filter_offsets {
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG);
        &self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.starts.len();
        self.filter_offsets.push(self.result.len() as u32);
        if num_keys == 0 {
            // No keys fell in this stride; record an empty filter.
            return;
        }

        // Sentinel start simplifies computing the last key's length.
        self.starts.push(self.keys.len());
        let key_refs: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.starts[i]..self.starts[i + 1]])
            .collect();
        self.policy.create_filter(&key_refs, &mut self.result);

        self.keys.clear();
        self.starts.clear();
    }
}

/// Probes a finished filter block.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Offset of the filter-offset array within `data`.
    array_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> FilterBlockReader {
        let mut reader = FilterBlockReader {
            policy,
            data: Vec::new(),
            array_start: 0,
            num_filters: 0,
            base_lg: 0,
        };
        let n = data.len();
        if n < 5 {
            // 1 byte for base_lg and 4 for the array start; anything shorter
            // is unusable and every probe will report a potential match.
            warn!(len = n, "filter block too short, disabling filter");
            return reader;
        }
        let base_lg = data[n - 1];
        let array_start = decode_fixed32(&data[n - 5..]) as usize;
        if array_start > n - 5 {
            warn!(array_start, "filter block offset array out of range");
            return reader;
        }
        reader.num_filters = (n - 5 - array_start) / 4;
        reader.array_start = array_start;
        reader.base_lg = base_lg;
        reader.data = data;
        reader
    }

    /// Whether the filter covering `block_offset` may contain `key`.
    /// Malformed filters answer true; absent coverage answers true.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            return true;
        }

        let slot = self.array_start + index * 4;
        let start = decode_fixed32(&self.data[slot..]) as usize;
        let limit = decode_fixed32(&self.data[slot + 4..]) as usize;
        if start == limit {
            // An empty filter covers a stride with no keys.
            return false;
        }
        if start < limit && limit <= self.array_start {
            return self.policy.key_may_match(key, &self.data[start..limit]);
        }

        // Inconsistent offsets; err on the side of reading the block.
        warn!(index, start, limit, "filter block entry malformed");
        true
    }
}
