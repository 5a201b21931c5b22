//! Zstd envelope compression for module sections.
//!
//! Compressed metadata blocks carry their inner sizes as a prefix:
//! `string_buffer_size: u64 LE ‖ metadata_size: u64 LE ‖ string buffer ‖
//! metadata rows`, all zstd-compressed as one frame.

use crate::error::{Result, UmdfError};

/// Compression level for module sections. Matches the level the format
/// has always been written with; readers accept any level.
pub const ZSTD_LEVEL: i32 = 15;

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let compressed = zstd::stream::encode_all(data, ZSTD_LEVEL)
        .map_err(|e| UmdfError::Format(format!("zstd compression failed: {e}")))?;
    tracing::trace!(
        original = data.len(),
        compressed = compressed.len(),
        "zstd compress"
    );
    Ok(compressed)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let decompressed = zstd::stream::decode_all(data)
        .map_err(|e| UmdfError::Format(format!("zstd decompression failed: {e}")))?;
    tracing::trace!(
        compressed = data.len(),
        original = decompressed.len(),
        "zstd decompress"
    );
    Ok(decompressed)
}
