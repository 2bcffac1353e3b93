// packages/engine/src/recording/compressor.rs
//! LZ4 block compression for event blocks
//!
//! Blocks are stored in the raw LZ4 block format (no frame header); the
//! uncompressed size travels in the block header instead.

use crate::utils::errors::{EngineError, Result};
use lz4_flex::block;
use tracing::debug;

const INITIAL_SCRATCH_SIZE: usize = 1024;

/// Compressor owning a scratch buffer grown to the worst-case bound
pub struct Lz4Compressor {
    scratch: Vec<u8>,
}

impl Lz4Compressor {
    /// Create a new compressor
    pub fn new() -> Self {
        Self {
            scratch: vec![0; INITIAL_SCRATCH_SIZE],
        }
    }

    /// Compress data into the scratch buffer, returning the compressed bytes
    pub fn compress(&mut self, data: &[u8]) -> Result<&[u8]> {
        let bound = block::get_maximum_output_size(data.len());
        if self.scratch.len() < bound {
            debug!("Growing compression scratch from {} to {} bytes", self.scratch.len(), bound);
            self.scratch.resize(bound, 0);
        }

        let compressed_size = block::compress_into(data, &mut self.scratch).map_err(|e| {
            EngineError::Compression(format!("Compression error: {}", e))
        })?;

        debug!(
            "Compressed {} bytes -> {} bytes",
            data.len(),
            compressed_size
        );

        Ok(&self.scratch[..compressed_size])
    }

    /// Current scratch capacity in bytes
    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest output a raw LZ4 block of `compressed_size` bytes can expand to
pub fn max_decompressed_size(compressed_size: usize) -> usize {
    compressed_size.saturating_mul(255).saturating_add(16)
}

/// Decompress a raw LZ4 block of known uncompressed size
pub fn decompress(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    if uncompressed_size > max_decompressed_size(data.len()) {
        return Err(EngineError::Compression(format!(
            "declared size {} is impossible for a {} byte block",
            uncompressed_size,
            data.len()
        )));
    }
    let mut output = vec![0; uncompressed_size];
    let written = block::decompress_into(data, &mut output).map_err(|e| {
        EngineError::Compression(format!("Decompression error: {}", e))
    })?;
    if written != uncompressed_size {
        return Err(EngineError::TruncatedBuffer {
            needed: uncompressed_size,
            available: written,
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let mut compressor = Lz4Compressor::new();

        let data = b"Hello, World! This is test data.".repeat(100);

        let compressed = compressor.compress(&data).unwrap().to_vec();
        assert!(compressed.len() < data.len());

        let decompressed = decompress(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_tiny_input() {
        let mut compressor = Lz4Compressor::new();
        let compressed = compressor.compress(&[1, 2, 3]).unwrap().to_vec();
        assert_eq!(decompress(&compressed, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_scratch_grows_for_large_blocks() {
        let mut compressor = Lz4Compressor::new();
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i * 7 % 251) as u8).collect();

        compressor.compress(&data).unwrap();

        assert!(compressor.scratch_len() >= block::get_maximum_output_size(data.len()));
    }

    #[test]
    fn test_json_compression() {
        let mut compressor = Lz4Compressor::new();

        let json_data = r#"{"CallFromInbound":{"Request":"GET /test"},"Actions":[]}"#.repeat(1000);

        let compressed = compressor.compress(json_data.as_bytes()).unwrap();

        let ratio = json_data.len() as f64 / compressed.len() as f64;
        assert!(ratio > 5.0);
    }

    #[test]
    fn test_decompress_wrong_size_fails() {
        let mut compressor = Lz4Compressor::new();
        let compressed = compressor.compress(b"some event body").unwrap().to_vec();
        assert!(decompress(&compressed, 4).is_err());
    }

    #[test]
    fn test_decompress_rejects_impossible_size() {
        let mut compressor = Lz4Compressor::new();
        let compressed = compressor.compress(b"some event body").unwrap().to_vec();

        let err = decompress(&compressed, u32::MAX as usize).unwrap_err();
        assert!(matches!(err, EngineError::Compression(_)));
    }

    #[test]
    fn test_highly_compressible_block_within_bound() {
        let mut compressor = Lz4Compressor::new();
        let data = vec![0u8; 1 << 20];
        let compressed = compressor.compress(&data).unwrap().to_vec();

        assert!(data.len() <= max_decompressed_size(compressed.len()));
        assert_eq!(decompress(&compressed, data.len()).unwrap(), data);
    }
}
