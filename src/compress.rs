//! Optional block compression. The table format reserves one byte per block
//! for the compression type; the engine only prescribes the framing, not the
//! algorithm.

use crate::error::{Error, Result};

/// Block compression codes as stored in the per-block trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl CompressionType {
    pub fn from_u8(byte: u8) -> Option<CompressionType> {
        match byte {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

/// A block codec. `compress` may decline (returning `None`) when the input
/// does not shrink; the caller then stores the block raw.
pub trait Compressor: Send + Sync {
    fn compress(&self, raw: &[u8]) -> Option<Vec<u8>>;
    fn uncompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Snappy, the one built-in codec.
pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn compress(&self, raw: &[u8]) -> Option<Vec<u8>> {
        snap::raw::Encoder::new().compress_vec(raw).ok()
    }

    fn uncompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|_| Error::Corruption("corrupted compressed block contents".to_string()))
    }
}
