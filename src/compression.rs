//! Optional compression of writer flushes.
//!
//! A compressor turns one flushed buffer into one self-contained unit. For gzip that unit is a
//! complete gzip member; members concatenate into a valid multi-member stream, which is what
//! lets shard files be merged by plain byte copying.

use crate::error::{DumpError, Result};
use flate2::write::GzEncoder;
use std::fmt;
use std::io::Write;

pub trait Compressor: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Compress `data` as one independently decodable unit, appended to `output`.
    fn compress_append(&self, data: &[u8], output: &mut Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    /// `level` is clamped to gzip's 1..=9
    pub fn new(level: u32) -> GzipCompressor {
        GzipCompressor {
            level: level.max(1).min(9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Compressor for GzipCompressor {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress_append(&self, data: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let mut encoder = GzEncoder::new(output, flate2::Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| DumpError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| DumpError::Compression(e.to_string()))?;

        Ok(())
    }
}
