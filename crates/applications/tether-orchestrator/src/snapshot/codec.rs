//! Chunk compression

use tether_core::traits::Result;
use tether_core::{ChunkCodec, TetherError};

/// zstd, one independent frame per chunk
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ChunkCodec for ZstdCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(data, self.level).map_err(|e| TetherError::Codec(format!("zstd compress: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(data).map_err(|e| TetherError::Codec(format!("zstd decode: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_decode_independently() {
        let codec = ZstdCodec::default();
        let a = codec.compress(&[7u8; 4096]).unwrap();
        let b = codec.compress(b"second chunk").unwrap();

        assert!(a.len() < 4096);
        assert_eq!(codec.decompress(&b).unwrap(), b"second chunk");
        assert_eq!(codec.decompress(&a).unwrap(), vec![7u8; 4096]);
        assert_eq!(codec.decompress(&codec.compress(b"").unwrap()).unwrap(), b"");
    }

    #[test]
    fn test_garbage_is_codec_error() {
        let err = ZstdCodec::default().decompress(b"definitely not zstd").unwrap_err();
        assert!(matches!(err, TetherError::Codec(_)));
    }
}
