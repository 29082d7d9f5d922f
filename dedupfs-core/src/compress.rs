//! Per-block compression.
//!
//! `compress`/`decompress` form a pair where `decompress(compress(x)) ==
//! x` for every input, including the empty slice. Identity (`"none"`) is
//! always available; `zlib` is the one general-purpose method supported,
//! chosen as the most broadly available pure-Rust-friendly codec for
//! this kind of block store.

use crate::error::DedupResult;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,
    Zlib,
}

impl CompressionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Zlib => "zlib",
        }
    }

    pub fn parse(name: &str) -> DedupResult<Self> {
        match name {
            "none" => Ok(CompressionMethod::None),
            "zlib" => Ok(CompressionMethod::Zlib),
            other => Err(crate::error::DedupError::FatalIntegrity(format!(
                "unsupported compression method {other:?}"
            ))),
        }
    }

    pub fn compress(&self, block: &[u8]) -> Vec<u8> {
        match self {
            CompressionMethod::None => block.to_vec(),
            CompressionMethod::Zlib => {
                let mut encoder = ZlibEncoder::new(block, Compression::default());
                let mut out = Vec::new();
                encoder
                    .read_to_end(&mut out)
                    .expect("in-memory zlib encode cannot fail");
                out
            }
        }
    }

    pub fn decompress(&self, bytes: &[u8]) -> DedupResult<Vec<u8>> {
        match self {
            CompressionMethod::None => Ok(bytes.to_vec()),
            CompressionMethod::Zlib => {
                let mut decoder = ZlibDecoder::new(bytes);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl Default for CompressionMethod {
    fn default() -> Self {
        CompressionMethod::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_identity() {
        let data = b"hello world!";
        let compressed = CompressionMethod::None.compress(data);
        assert_eq!(compressed, data);
        assert_eq!(CompressionMethod::None.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn zlib_roundtrips() {
        let data = b"hello world! hello world! hello world!";
        let compressed = CompressionMethod::Zlib.compress(data);
        let restored = CompressionMethod::Zlib.decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn zlib_roundtrips_empty_input() {
        let compressed = CompressionMethod::Zlib.compress(b"");
        let restored = CompressionMethod::Zlib.decompress(&compressed).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn parse_rejects_unknown_name() {
        assert!(CompressionMethod::parse("lzo").is_err());
    }
}
