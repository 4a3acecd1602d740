//! Table construction and read options.

use std::sync::Arc;

use crate::cache::ShardedCache;
use crate::comparator::{BytewiseComparator, Comparator};
use crate::compress::CompressionType;
use crate::filter::FilterPolicy;
use crate::sstable::block::Block;

/// Options shared by the table builder and reader.
///
/// The comparator here orders whatever keys the caller feeds the table; the
/// engine passes its internal-key comparator, tests often use plain
/// bytewise ordering.
#[derive(Clone)]
pub struct Options {
    /// Key ordering for data and index blocks.
    pub comparator: Arc<dyn Comparator>,

    /// Uncompressed payload size at which a data block is cut (default 4 KiB).
    pub block_size: usize,

    /// Keys between restart points in data blocks (default 16).
    pub block_restart_interval: usize,

    /// Compression applied to data, index, and metaindex blocks.
    pub compression: CompressionType,

    /// Per-block membership filters; `None` disables the filter block.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Shared block cache; `None` reads every block from the file.
    pub block_cache: Option<Arc<ShardedCache<Arc<Block>>>>,

    /// Verify block checksums on every read, not only where requested.
    pub paranoid_checks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            block_size: 4 * 1024,
            block_restart_interval: 16,
            compression: CompressionType::None,
            filter_policy: None,
            block_cache: None,
            paranoid_checks: false,
        }
    }
}

impl Options {
    /// Set the key comparator.
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Set the data block size threshold.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the restart interval for data blocks.
    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    /// Set the block compression type.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Enable a filter policy.
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Attach a shared block cache.
    pub fn block_cache(mut self, cache: Arc<ShardedCache<Arc<Block>>>) -> Self {
        self.block_cache = Some(cache);
        self
    }

    /// Check every checksum the reader encounters.
    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.paranoid_checks = enabled;
        self
    }
}

/// Per-read knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Verify the checksum of each block this read touches.
    pub verify_checksums: bool,

    /// Add blocks read from the file to the block cache.
    pub fill_cache: bool,
}

impl ReadOptions {
    pub fn new() -> ReadOptions {
        ReadOptions {
            verify_checksums: false,
            fill_cache: true,
        }
    }
}
