//! Streaming table construction: data blocks as keys arrive, then the
//! filter block, metaindex, index, and footer.

use std::cmp::Ordering;

use crate::checksum;
use crate::coding::put_fixed32;
use crate::comparator::Comparator;
use crate::compress::{CompressionType, Compressor, SnappyCompressor};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::filter::FilterPolicy;
use crate::fs::WritableFile;

use super::block::BlockBuilder;
use super::filter_block::FilterBlockBuilder;
use super::format::{BlockHandle, Footer, BLOCK_TRAILER_SIZE};

pub struct TableBuilder<W: WritableFile> {
    options: Options,
    file: W,
    /// Bytes written so far; the offset the next block will start at.
    offset: u64,
    /// First error hit; everything afterwards is a no-op.
    status: Option<Error>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,
    filter_block: Option<FilterBlockBuilder>,
    /// Set after a data block is flushed: its index entry is deferred until
    /// the next key arrives, so the index key can be a short separator
    /// between the two blocks rather than the full last key.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

impl<W: WritableFile> TableBuilder<W> {
    pub fn new(options: Options, file: W) -> TableBuilder<W> {
        let mut filter_block = options
            .filter_policy
            .as_ref()
            .map(|policy| FilterBlockBuilder::new(policy.clone()));
        if let Some(filter) = &mut filter_block {
            filter.start_block(0);
        }
        TableBuilder {
            data_block: BlockBuilder::new(options.block_restart_interval),
            // Every index entry is a restart point so lookups binary-search
            // the whole index.
            index_block: BlockBuilder::new(1),
            options,
            file,
            offset: 0,
            status: None,
            last_key: Vec::new(),
            num_entries: 0,
            closed: false,
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_none()
    }

    /// The sticky status: the first error encountered, if any.
    pub fn status(&self) -> Result<()> {
        match &self.status {
            None => Ok(()),
            Some(err) => Err(err.duplicate()),
        }
    }

    /// Adds an entry. Keys must arrive in strictly increasing order under
    /// the table's comparator.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.closed);
        if !self.ok() {
            return;
        }
        if self.num_entries > 0 {
            debug_assert_eq!(
                self.options.comparator.compare(key, &self.last_key),
                Ordering::Greater,
                "keys added out of order"
            );
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            self.index_block
                .add(&self.last_key.clone(), &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }

        if let Some(filter) = &mut self.filter_block {
            filter.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush();
        }
    }

    /// Finishes the current data block and writes it out.
    pub fn flush(&mut self) {
        assert!(!self.closed);
        if !self.ok() || self.data_block.is_empty() {
            return;
        }
        debug_assert!(!self.pending_index_entry);

        let raw = self.data_block.finish().to_vec();
        self.data_block.reset();
        self.pending_handle = match self.write_block(&raw) {
            Ok(handle) => handle,
            Err(err) => {
                self.status = Some(err);
                return;
            }
        };
        self.pending_index_entry = true;
        if let Err(err) = self.file.flush() {
            self.status = Some(err);
            return;
        }
        if let Some(filter) = &mut self.filter_block {
            filter.start_block(self.offset);
        }
    }

    /// Compresses if profitable and writes payload + trailer.
    fn write_block(&mut self, raw: &[u8]) -> Result<BlockHandle> {
        let (contents, ty) = match self.options.compression {
            CompressionType::None => (None, CompressionType::None),
            CompressionType::Snappy => match SnappyCompressor.compress(raw) {
                // Keep the compressed form only when it saves at least 12.5%.
                Some(compressed) if compressed.len() < raw.len() - raw.len() / 8 => {
                    (Some(compressed), CompressionType::Snappy)
                }
                _ => (None, CompressionType::None),
            },
        };
        self.write_raw_block(contents.as_deref().unwrap_or(raw), ty)
    }

    fn write_raw_block(&mut self, contents: &[u8], ty: CompressionType) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        self.file.append(contents)?;

        let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
        trailer.push(ty as u8);
        let crc = checksum::extended(contents, &[ty as u8]);
        put_fixed32(&mut trailer, checksum::mask(crc));
        self.file.append(&trailer)?;

        self.offset += (contents.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }

    /// Writes the filter, metaindex, index, and footer. Terminal: the
    /// builder accepts nothing afterwards.
    pub fn finish(&mut self) -> Result<()> {
        self.flush();
        assert!(!self.closed);
        self.closed = true;
        if let Some(err) = &self.status {
            return Err(err.duplicate());
        }

        // Filter block, stored raw: it is mostly hash bits and would not
        // compress anyway.
        let mut filter_handle = None;
        if let Some(filter) = &mut self.filter_block {
            let contents = filter.finish().to_vec();
            match self.write_raw_block(&contents, CompressionType::None) {
                Ok(handle) => filter_handle = Some(handle),
                Err(err) => {
                    self.status = Some(err.duplicate());
                    return Err(err);
                }
            }
        }

        // Metaindex: one entry mapping the filter's name to its handle.
        let mut metaindex = BlockBuilder::new(self.options.block_restart_interval);
        if let (Some(handle), Some(policy)) = (filter_handle, &self.options.filter_policy) {
            let key = format!("filter.{}", policy.name());
            metaindex.add(key.as_bytes(), &handle.encoded());
        }
        let raw = metaindex.finish().to_vec();
        let metaindex_handle = match self.write_block(&raw) {
            Ok(handle) => handle,
            Err(err) => {
                self.status = Some(err.duplicate());
                return Err(err);
            }
        };

        // Index block, closed out with a short successor of the last key.
        if self.pending_index_entry {
            self.options.comparator.find_short_successor(&mut self.last_key);
            self.index_block
                .add(&self.last_key.clone(), &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }
        let raw = self.index_block.finish().to_vec();
        let index_handle = match self.write_block(&raw) {
            Ok(handle) => handle,
            Err(err) => {
                self.status = Some(err.duplicate());
                return Err(err);
            }
        };

        let mut footer_encoding = Vec::new();
        Footer {
            metaindex_handle,
            index_handle,
        }
        .encode_to(&mut footer_encoding);
        if let Err(err) = self.file.append(&footer_encoding) {
            self.status = Some(err.duplicate());
            return Err(err);
        }
        self.offset += footer_encoding.len() as u64;
        self.file.flush()?;
        Ok(())
    }

    /// Closes the builder without writing a footer; the output is not a
    /// valid table.
    pub fn abandon(&mut self) {
        assert!(!self.closed);
        self.closed = true;
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far; after `finish`, the final file size.
    pub fn file_size(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;
    use std::io;

    #[test]
    fn empty_table_has_footer_and_blocks() {
        let mut file = MemFile::new();
        let mut builder = TableBuilder::new(Options::default(), &mut file);
        builder.finish().unwrap();
        let size = builder.file_size();

        // Empty metaindex block (8) + trailer (5), empty index block (8) +
        // trailer (5), footer (48).
        assert_eq!(size, 8 + 5 + 8 + 5 + 48);
        assert_eq!(file.data.len() as u64, size);
    }

    #[test]
    fn entries_and_size_are_tracked() {
        let mut file = MemFile::new();
        let mut builder = TableBuilder::new(Options::default(), &mut file);
        builder.add(b"aaa", b"1");
        builder.add(b"bbb", b"2");
        assert_eq!(builder.num_entries(), 2);
        // Nothing flushed yet.
        assert_eq!(builder.file_size(), 0);
        builder.flush();
        assert!(builder.file_size() > 0);
        builder.finish().unwrap();
    }

    #[test]
    fn abandon_writes_no_footer() {
        let mut file = MemFile::new();
        let mut builder = TableBuilder::new(Options::default(), &mut file);
        builder.add(b"k", b"v");
        builder.abandon();
        // The unflushed data block is discarded along with the footer.
        assert!(file.data.is_empty());
    }

    struct FailingFile {
        fail_after: usize,
        written: usize,
    }

    impl WritableFile for FailingFile {
        fn append(&mut self, data: &[u8]) -> Result<()> {
            if self.written + data.len() > self.fail_after {
                return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
            }
            self.written += data.len();
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn sync(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn errors_are_sticky() {
        let file = FailingFile {
            fail_after: 100,
            written: 0,
        };
        let mut builder = TableBuilder::new(Options::default().block_size(64), file);
        for i in 0..100u32 {
            builder.add(format!("key{i:04}").as_bytes(), &[0u8; 32]);
            if !builder.ok() {
                break;
            }
        }
        assert!(!builder.ok());
        let entries_at_failure = builder.num_entries();

        // Further adds are ignored.
        builder.add(b"zzz", b"ignored");
        assert_eq!(builder.num_entries(), entries_at_failure);

        // Finish surfaces the first error.
        assert!(matches!(builder.finish(), Err(Error::Io(_))));
    }
}
