use crate::checksum;
use crate::coding::{decode_fixed32, get_varint64, put_fixed32, put_varint64};
use crate::corruption;
use crate::compress::{CompressionType, Compressor, SnappyCompressor};
use crate::error::{Error, Result};
use crate::fs::RandomAccessFile;

/// 1-byte compression type + 4-byte masked CRC32C after every block payload.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Two varint64 handles at up to 10 bytes each.
pub const MAX_ENCODED_HANDLE_LEN: usize = 20;

/// Footer: two padded handles plus the 8-byte magic.
pub const FOOTER_LEN: usize = 2 * MAX_ENCODED_HANDLE_LEN + 8;

pub const TABLE_MAGIC: u64 = 0xdb4775248b80fb57;

/// Locates a block within the file: byte offset of its payload and the
/// payload's length, trailer excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> BlockHandle {
        BlockHandle { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_ENCODED_HANDLE_LEN);
        self.encode_to(&mut out);
        out
    }

    /// Decodes from the front of `src`, returning the handle and bytes
    /// consumed.
    pub fn decode_from(src: &[u8]) -> Result<(BlockHandle, usize)> {
        let (offset, a) =
            get_varint64(src).ok_or_else(|| Error::Corruption("bad block handle".to_string()))?;
        let (size, b) = get_varint64(&src[a..])
            .ok_or_else(|| Error::Corruption("bad block handle".to_string()))?;
        Ok((BlockHandle { offset, size }, a + b))
    }
}

/// The fixed trailer of every table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        self.metaindex_handle.encode_to(dst);
        self.index_handle.encode_to(dst);
        dst.resize(start + 2 * MAX_ENCODED_HANDLE_LEN, 0);
        put_fixed32(dst, (TABLE_MAGIC & 0xffffffff) as u32);
        put_fixed32(dst, (TABLE_MAGIC >> 32) as u32);
        debug_assert_eq!(dst.len() - start, FOOTER_LEN);
    }

    pub fn decode_from(src: &[u8]) -> Result<Footer> {
        if src.len() < FOOTER_LEN {
            return corruption!("footer too short");
        }
        let magic_lo = decode_fixed32(&src[FOOTER_LEN - 8..]) as u64;
        let magic_hi = decode_fixed32(&src[FOOTER_LEN - 4..]) as u64;
        if (magic_hi << 32) | magic_lo != TABLE_MAGIC {
            return corruption!("not a table file (bad magic number)");
        }

        let (metaindex_handle, used) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(&src[used..])?;
        Ok(Footer {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Reads a block's payload, verifies its trailer, and undoes compression.
///
/// The returned bytes are the uncompressed block contents, ready for
/// [`Block::new`](super::block::Block::new).
pub fn read_block(
    file: &dyn RandomAccessFile,
    verify_checksums: bool,
    handle: &BlockHandle,
) -> Result<Vec<u8>> {
    let n = handle.size as usize;
    let mut buf = vec![0u8; n + BLOCK_TRAILER_SIZE];
    let read = file.read_at(handle.offset, &mut buf)?;
    if read != buf.len() {
        return corruption!("truncated block read");
    }

    if verify_checksums {
        let expected = checksum::unmask(decode_fixed32(&buf[n + 1..]));
        let actual = checksum::value(&buf[..n + 1]);
        if actual != expected {
            return corruption!("block checksum mismatch");
        }
    }

    let ty = buf[n];
    buf.truncate(n);
    match CompressionType::from_u8(ty) {
        Some(CompressionType::None) => Ok(buf),
        Some(CompressionType::Snappy) => SnappyCompressor.uncompress(&buf),
        None => Err(Error::NotSupported(format!("compression type {ty}"))),
    }
}
