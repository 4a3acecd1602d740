use crate::checksum;
use crate::coding::put_fixed32;
use crate::error::Result;
use crate::fs::WritableFile;

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Appends logical records to the log, fragmenting across 32 KiB blocks.
pub struct Writer<W: WritableFile> {
    dest: W,
    /// Offset within the current block, always in `0..BLOCK_SIZE`.
    block_offset: usize,
}

impl<W: WritableFile> Writer<W> {
    /// Writer for a fresh log file.
    pub fn new(dest: W) -> Writer<W> {
        Writer {
            dest,
            block_offset: 0,
        }
    }

    /// Writer resuming at the end of an existing log of `dest_length` bytes.
    pub fn with_length(dest: W, dest_length: u64) -> Writer<W> {
        Writer {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Appends one logical record and flushes it to the file.
    pub fn append_record(&mut self, record: &[u8]) -> Result<()> {
        let mut left = record.len();
        let mut offset = 0;
        let mut begin = true;

        // An empty record still emits one zero-length Full fragment.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too little room for a header; zero-fill and start a new
                // block.
                if leftover > 0 {
                    self.dest.append(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.min(avail);
            let end = left == fragment_len;

            let ty = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(ty, &record[offset..offset + fragment_len])?;
            offset += fragment_len;
            left -= fragment_len;
            begin = false;
            if left == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Forces buffered bytes down to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    fn emit_physical_record(&mut self, ty: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let crc = checksum::mask(checksum::extended(&[ty as u8], data));
        let mut header = Vec::with_capacity(HEADER_SIZE);
        put_fixed32(&mut header, crc);
        header.push((data.len() & 0xff) as u8);
        header.push((data.len() >> 8) as u8);
        header.push(ty as u8);

        self.dest.append(&header)?;
        self.dest.append(data)?;
        self.dest.flush()?;
        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }
}
