//! 冷节点压缩。quicklist 中间的节点很少被访问，压缩后可以省下不少内存。
//!
//! Blocks are raw LZ4 without a size prefix: the owning segment already
//! records the uncompressed length.

use tracing::{debug, warn};

use super::error::{ZLError, ZLResult};

/// 小于这个字节数的 buffer 不值得压缩
pub const MIN_COMPRESS_BYTES: usize = 48;
/// 压缩后至少要省下这么多字节，否则保留明文
pub const MIN_COMPRESS_IMPROVE: usize = 8;

/// 压缩成功且确实更小时返回压缩结果，否则返回 None，调用方继续使用明文。
pub fn compress(src: &[u8]) -> Option<Vec<u8>> {
    if src.len() < MIN_COMPRESS_BYTES {
        return None;
    }
    let max_compressed_size = lz4::block::compress_bound(src.len()).ok()?;
    let mut buffer = vec![0u8; max_compressed_size];
    let size = match lz4::block::compress_to_buffer(
        src,
        Some(lz4::block::CompressionMode::FAST(1)),
        false,
        &mut buffer,
    ) {
        Ok(size) => size,
        Err(e) => {
            debug!(error = %e, len = src.len(), "lz4 compression failed, keeping plaintext");
            return None;
        }
    };
    if size + MIN_COMPRESS_IMPROVE >= src.len() {
        return None;
    }
    buffer.truncate(size);
    buffer.shrink_to_fit();
    Some(buffer)
}

/// 解压，结果长度必须正好是 `expected_len`。
pub fn decompress(blob: &[u8], expected_len: usize) -> ZLResult<Vec<u8>> {
    let expected = i32::try_from(expected_len).map_err(|_| {
        ZLError::InvalidArgument(format!("cannot decompress {} bytes in one block", expected_len))
    })?;
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(expected_len)
        .map_err(|_| ZLError::AllocationFailure(expected_len))?;
    buffer.resize(expected_len, 0);
    let size = lz4::block::decompress_to_buffer(blob, Some(expected), &mut buffer).map_err(|e| {
        warn!(error = %e, blob = blob.len(), "lz4 block is corrupted");
        ZLError::Corruption(format!("lz4 block failed to decode, {}", e))
    })?;
    if size != expected_len {
        return Err(ZLError::LengthMismatch {
            expected: expected_len,
            actual: size,
        });
    }
    Ok(buffer)
}
