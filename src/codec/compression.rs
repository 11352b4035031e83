//! Block compression with size and ratio thresholds

use crate::{Error, Result};
use std::sync::Arc;
use tracing::trace;

/// Compression tag recorded next to an encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionType {
    /// Stored as-is because it was below the size threshold
    None = 0,
    /// Compression was attempted but did not clear the ratio threshold
    Incompressible = 5,
    /// Snappy raw block format
    Snappy = 6,
}

impl CompressionType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CompressionType::None),
            5 => Ok(CompressionType::Incompressible),
            6 => Ok(CompressionType::Snappy),
            other => Err(Error::UnsupportedCompression(other)),
        }
    }

    /// Whether the payload is stored verbatim.
    pub fn is_raw(self) -> bool {
        matches!(self, CompressionType::None | CompressionType::Incompressible)
    }
}

/// Pluggable block compressor.
pub trait BlockCompressor: Send + Sync {
    /// Tag written for payloads this compressor produced.
    fn compression_type(&self) -> CompressionType;

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> Result<Vec<u8>>;
}

/// Snappy raw-format compressor.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnappyCompressor;

impl BlockCompressor for SnappyCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Snappy
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(snap::raw::Encoder::new().compress_vec(input)?)
    }

    fn decompress(&self, input: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let declared = snap::raw::decompress_len(input)?;
        if declared != uncompressed_len {
            return Err(Error::Codec(format!(
                "snappy block declares {} bytes but {} were recorded",
                declared, uncompressed_len
            )));
        }
        Ok(snap::raw::Decoder::new().decompress_vec(input)?)
    }
}

/// Thresholds deciding whether compression is worth it.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Inputs shorter than this are stored without invoking the compressor
    pub min_size: usize,
    /// Compressed output must be at most this percentage of the input
    pub max_ratio_percent: u8,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size: 1024,
            max_ratio_percent: 90,
        }
    }
}

/// Output of [`Compressor::compress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub compression_type: CompressionType,
    pub uncompressed_len: usize,
    pub data: Vec<u8>,
}

/// Applies a [`BlockCompressor`] under a [`CompressionConfig`] policy.
#[derive(Clone)]
pub struct Compressor {
    config: CompressionConfig,
    backend: Arc<dyn BlockCompressor>,
}

impl Compressor {
    pub fn new(config: CompressionConfig, backend: Arc<dyn BlockCompressor>) -> Self {
        Self { config, backend }
    }

    pub fn snappy(config: CompressionConfig) -> Self {
        Self::new(config, Arc::new(SnappyCompressor))
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn compress(&self, input: Vec<u8>) -> Result<Compressed> {
        let uncompressed_len = input.len();
        if uncompressed_len < self.config.min_size {
            return Ok(Compressed {
                compression_type: CompressionType::None,
                uncompressed_len,
                data: input,
            });
        }

        let output = self.backend.compress(&input)?;
        let limit = uncompressed_len * self.config.max_ratio_percent as usize / 100;
        if output.len() > limit {
            trace!(
                uncompressed_len,
                compressed_len = output.len(),
                "Payload did not compress enough, storing raw"
            );
            return Ok(Compressed {
                compression_type: CompressionType::Incompressible,
                uncompressed_len,
                data: input,
            });
        }

        Ok(Compressed {
            compression_type: self.backend.compression_type(),
            uncompressed_len,
            data: output,
        })
    }

    pub fn decompress(
        &self,
        compression_type: CompressionType,
        uncompressed_len: usize,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        if compression_type.is_raw() {
            if data.len() != uncompressed_len {
                return Err(Error::Codec(format!(
                    "raw payload is {} bytes but {} were recorded",
                    data.len(),
                    uncompressed_len
                )));
            }
            return Ok(data.to_vec());
        }
        if compression_type != self.backend.compression_type() {
            return Err(Error::UnsupportedCompression(compression_type.code()));
        }
        let output = self.backend.decompress(data, uncompressed_len)?;
        if output.len() != uncompressed_len {
            return Err(Error::Codec(format!(
                "decompressed {} bytes but {} were recorded",
                output.len(),
                uncompressed_len
            )));
        }
        Ok(output)
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("config", &self.config)
            .field("backend", &self.backend.compression_type())
            .finish()
    }
}
