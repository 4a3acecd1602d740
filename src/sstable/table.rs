//! Reading tables: footer and index at open, data blocks on demand through
//! the shared block cache.

use std::sync::Arc;

use tracing::warn;

use crate::coding::put_fixed64;
use crate::config::{Options, ReadOptions};
use crate::corruption;
use crate::error::Result;
use crate::filter::FilterPolicy;
use crate::fs::RandomAccessFile;

use super::block::{Block, BlockIter};
use super::filter_block::FilterBlockReader;
use super::format::{read_block, BlockHandle, Footer, FOOTER_LEN};

pub struct Table {
    options: Options,
    file: Box<dyn RandomAccessFile>,
    /// Distinguishes this table's blocks from other tables sharing the
    /// cache.
    cache_id: u64,
    metaindex_handle: BlockHandle,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
}

impl Table {
    /// Opens a table of `size` bytes. The footer and index block are read
    /// eagerly; a missing or damaged filter block only disables filtering.
    pub fn open(options: Options, file: Box<dyn RandomAccessFile>, size: u64) -> Result<Table> {
        if size < FOOTER_LEN as u64 {
            return corruption!("file is too short to be a table");
        }

        let mut footer_bytes = vec![0u8; FOOTER_LEN];
        let read = file.read_at(size - FOOTER_LEN as u64, &mut footer_bytes)?;
        if read != FOOTER_LEN {
            return corruption!("truncated footer read");
        }
        let footer = Footer::decode_from(&footer_bytes)?;

        let index_contents = read_block(
            file.as_ref(),
            // The index is read once and trusted for the table's lifetime.
            true,
            &footer.index_handle,
        )?;
        let index_block = Arc::new(Block::new(index_contents)?);

        let cache_id = options
            .block_cache
            .as_ref()
            .map_or(0, |cache| cache.new_id());

        let mut table = Table {
            options,
            file,
            cache_id,
            metaindex_handle: footer.metaindex_handle,
            index_block,
            filter: None,
        };
        table.read_meta(&footer);
        Ok(table)
    }

    /// Loads the filter block named in the metaindex. Failures here are not
    /// fatal: the table serves reads without a filter.
    fn read_meta(&mut self, footer: &Footer) {
        let policy = match &self.options.filter_policy {
            Some(policy) => policy.clone(),
            None => return,
        };

        let contents = match read_block(
            self.file.as_ref(),
            self.options.paranoid_checks,
            &footer.metaindex_handle,
        ) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable metaindex block");
                return;
            }
        };
        let meta = match Block::new(contents) {
            Ok(block) => Arc::new(block),
            Err(err) => {
                warn!(error = %err, "ignoring malformed metaindex block");
                return;
            }
        };

        // Metaindex keys are plain strings, compared bytewise.
        let mut iter = meta.iter(Arc::new(crate::comparator::BytewiseComparator));
        let key = format!("filter.{}", policy.name());
        iter.seek(key.as_bytes());
        if iter.valid() && iter.key() == key.as_bytes() {
            let handle = match BlockHandle::decode_from(iter.value()) {
                Ok((handle, _)) => handle,
                Err(err) => {
                    warn!(error = %err, "ignoring bad filter block handle");
                    return;
                }
            };
            match read_block(self.file.as_ref(), self.options.paranoid_checks, &handle) {
                Ok(filter_data) => {
                    self.filter = Some(FilterBlockReader::new(policy, filter_data));
                }
                Err(err) => {
                    warn!(error = %err, "ignoring unreadable filter block");
                }
            }
        }
    }

    /// Materializes an iterator over the data block an index entry points
    /// at, consulting the block cache first.
    fn block_reader(&self, options: &ReadOptions, index_value: &[u8]) -> Result<BlockIter> {
        let (handle, _) = BlockHandle::decode_from(index_value)?;

        let block: Arc<Block> = match &self.options.block_cache {
            Some(cache) => {
                let mut cache_key = Vec::with_capacity(16);
                put_fixed64(&mut cache_key, self.cache_id);
                put_fixed64(&mut cache_key, handle.offset);

                match cache.lookup(&cache_key) {
                    Some(pinned) => pinned.value().clone(),
                    None => {
                        let contents = read_block(
                            self.file.as_ref(),
                            options.verify_checksums || self.options.paranoid_checks,
                            &handle,
                        )?;
                        let block = Arc::new(Block::new(contents)?);
                        if options.fill_cache {
                            cache.insert(&cache_key, Arc::clone(&block), block.size());
                        }
                        block
                    }
                }
            }
            None => {
                let contents = read_block(
                    self.file.as_ref(),
                    options.verify_checksums || self.options.paranoid_checks,
                    &handle,
                )?;
                Arc::new(Block::new(contents)?)
            }
        };

        Ok(block.iter(self.options.comparator.clone()))
    }

    /// Point lookup. Seeks the index, consults the filter, and if the data
    /// block holds an entry at or after `key`, hands it to `visitor`. The
    /// visitor applies its own sequence/type filtering.
    pub fn get<F>(&self, options: &ReadOptions, key: &[u8], visitor: F) -> Result<()>
    where
        F: FnOnce(&[u8], &[u8]),
    {
        let mut index_iter = self.index_block.iter(self.options.comparator.clone());
        index_iter.seek(key);
        if !index_iter.valid() {
            return index_iter.status();
        }

        let index_value = index_iter.value().to_vec();
        if let Some(filter) = &self.filter {
            let (handle, _) = BlockHandle::decode_from(&index_value)?;
            if !filter.key_may_match(handle.offset, key) {
                return Ok(());
            }
        }

        let mut block_iter = self.block_reader(options, &index_value)?;
        block_iter.seek(key);
        if block_iter.valid() {
            visitor(block_iter.key(), block_iter.value());
        }
        block_iter.status()?;
        index_iter.status()
    }

    /// Byte offset where `key`'s data block begins; the metaindex offset
    /// (near the file's end) once past the last key.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.options.comparator.clone());
        index_iter.seek(key);
        if index_iter.valid() {
            match BlockHandle::decode_from(index_iter.value()) {
                Ok((handle, _)) => handle.offset,
                Err(_) => self.metaindex_handle.offset,
            }
        } else {
            self.metaindex_handle.offset
        }
    }

    pub fn iter(&self, options: ReadOptions) -> TableIterator<'_> {
        TableIterator {
            table: self,
            options,
            index_iter: self.index_block.iter(self.options.comparator.clone()),
            data_iter: None,
            data_block_handle: Vec::new(),
            status: None,
        }
    }
}

/// Two-level iteration: the outer cursor walks index entries, the inner one
/// walks the data block the current index entry points at.
pub struct TableIterator<'a> {
    table: &'a Table,
    options: ReadOptions,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    /// Encoded handle backing `data_iter`, to skip redundant block loads
    /// when the outer cursor has not moved.
    data_block_handle: Vec<u8>,
    status: Option<crate::error::Error>,
}

impl<'a> TableIterator<'a> {
    pub fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|iter| iter.valid())
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().unwrap().key()
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().unwrap().value()
    }

    pub fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(data_iter) = &self.data_iter {
            data_iter.status()?;
        }
        match &self.status {
            None => Ok(()),
            Some(err) => Err(err.duplicate()),
        }
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    pub fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    pub fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().next();
        self.skip_empty_data_blocks_forward();
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().prev();
        self.skip_empty_data_blocks_backward();
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |iter| !iter.valid()) {
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |iter| !iter.valid()) {
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_last();
            }
        }
    }

    fn set_data_iter(&mut self, iter: Option<BlockIter>) {
        if let Some(old) = &self.data_iter {
            if self.status.is_none() {
                if let Err(err) = old.status() {
                    self.status = Some(err);
                }
            }
        }
        self.data_iter = iter;
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.set_data_iter(None);
            return;
        }
        let handle = self.index_iter.value();
        if self.data_iter.is_some() && self.data_block_handle == handle {
            // Still inside the same block; nothing to load.
            return;
        }
        let handle = handle.to_vec();
        match self.table.block_reader(&self.options, &handle) {
            Ok(iter) => {
                self.data_block_handle = handle;
                self.set_data_iter(Some(iter));
            }
            Err(err) => {
                if self.status.is_none() {
                    self.status = Some(err);
                }
                self.set_data_iter(None);
            }
        }
    }
}
