//! Minimal file abstractions the storage core reads and writes through.
//!
//! Production code hands in `std::fs::File`; tests substitute in-memory
//! implementations to inject short reads and corruption.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;

/// Forward-only reads, with a coarse `skip` instead of general seeking.
pub trait SequentialFile: Send {
    /// Reads up to `buf.len()` bytes, returning how many were read. Zero
    /// means end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Skips `n` bytes from the current position.
    fn skip(&mut self, n: u64) -> Result<()>;
}

/// Positional reads, safe to issue from multiple threads at once.
pub trait RandomAccessFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how
    /// many were read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Append-only writes with explicit flush and durability points.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

impl SequentialFile for File {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(Read::read(self, buf)?)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

impl RandomAccessFile for File {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        // pread: never moves the shared cursor, so concurrent table reads
        // do not need a lock around the handle.
        let mut total = 0;
        while total < buf.len() {
            let n = FileExt::read_at(self, &mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut clone = self.try_clone()?;
        clone.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = Read::read(&mut clone, &mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

impl WritableFile for File {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(Write::flush(self)?)
    }

    fn sync(&mut self) -> Result<()> {
        self.sync_data()?;
        Ok(())
    }
}

/// An in-memory writable file, also readable back; the WAL and table tests
/// use it to avoid touching disk and to corrupt bytes surgically.
#[derive(Default)]
pub struct MemFile {
    pub data: Vec<u8>,
}

impl MemFile {
    pub fn new() -> MemFile {
        MemFile::default()
    }
}

impl WritableFile for &mut MemFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

impl RandomAccessFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

/// Sequential view over a byte buffer.
pub struct MemSequentialFile {
    data: Vec<u8>,
    pos: usize,
}

impl MemSequentialFile {
    pub fn new(data: Vec<u8>) -> MemSequentialFile {
        MemSequentialFile { data, pos: 0 }
    }
}

impl SequentialFile for MemSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.pos = (self.pos + n as usize).min(self.data.len());
        Ok(())
    }
}
