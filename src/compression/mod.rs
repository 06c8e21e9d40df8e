//! 页压缩/解压（LZ4 / None）

use crate::common::{LakeError, Result};
use crate::field_type::CompressionType;

pub fn compress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| LakeError::IoError(format!("lz4 compress: {e}"))),
    }
}

pub fn decompress(
    data:             &[u8],
    codec:            CompressionType,
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    let out = match codec {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4  => {
            let size = i32::try_from(uncompressed_len)
                .map_err(|_| LakeError::Corruption(format!("page too large: {uncompressed_len}")))?;
            lz4::block::decompress(data, Some(size))
                .map_err(|e| LakeError::Corruption(format!("lz4 decompress: {e}")))?
        }
    };
    if out.len() != uncompressed_len {
        return Err(LakeError::Corruption(format!(
            "decompressed size mismatch: expected {uncompressed_len}, got {}", out.len()
        )));
    }
    Ok(out)
}

pub(crate) fn codec_to_tag(codec: CompressionType) -> u8 {
    match codec {
        CompressionType::None => 0,
        CompressionType::Lz4  => 1,
    }
}

pub(crate) fn codec_from_tag(tag: u8) -> Result<CompressionType> {
    match tag {
        0 => Ok(CompressionType::None),
        1 => Ok(CompressionType::Lz4),
        _ => Err(LakeError::Corruption(format!("unknown compression tag {tag}"))),
    }
}
