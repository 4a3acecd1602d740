//! Storage and indexing core of a log-structured merge-tree key-value
//! store: the write-ahead log, the arena-backed memtable, immutable sorted
//! tables with prefix-compressed blocks and Bloom filters, and the sharded
//! block cache that serves reads.
//!
//! Writes carry a monotonic sequence number, land in the log and then the
//! memtable; flushes stream memtable contents through a table builder into
//! a table file. Reads walk memtable first, then tables newest to oldest,
//! with every key ordered by (user key ascending, sequence descending).

pub mod arena;
pub mod cache;
pub mod checksum;
pub mod coding;
pub mod comparator;
pub mod compress;
pub mod config;
pub mod error;
pub mod filter;
pub mod fs;
pub mod key;
pub mod memtable;
pub mod skiplist;
pub mod sstable;
pub mod wal;

pub use cache::ShardedCache;
pub use comparator::{BytewiseComparator, Comparator};
pub use config::{Options, ReadOptions};
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use key::{InternalKeyComparator, LookupKey, SequenceNumber, ValueType};
pub use memtable::{LookupResult, MemTable};
pub use sstable::{Table, TableBuilder};
