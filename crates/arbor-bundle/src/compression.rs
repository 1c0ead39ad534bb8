//! Packet compression codecs.
//!
//! Packets, not nodes, are the unit of compression. A codec is selected at
//! runtime from the format tag stored in the bundle header; asking for a
//! format without a codec is an explicit [`BundleError::UnsupportedCodec`],
//! never a silent fallback to another format.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{BundleError, BundleResult};

/// Compression format tag stored in the bundle header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    None,
    #[default]
    Lz4,
    Gzip,
    /// Reserved for a proprietary high-throughput codec. Readable as a tag,
    /// but no codec ships for it.
    Oodle,
    Zstd,
}

impl CompressionFormat {
    pub fn tag(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Gzip => 2,
            Self::Oodle => 3,
            Self::Zstd => 4,
        }
    }

    pub fn from_tag(tag: u64) -> BundleResult<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Gzip),
            3 => Ok(Self::Oodle),
            4 => Ok(Self::Zstd),
            other => Err(BundleError::UnknownCompression(other)),
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Gzip => "gzip",
            Self::Oodle => "oodle",
            Self::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// A packet codec.
///
/// `decompress` receives an output buffer of exactly the decoded length and
/// must fill it completely.
pub trait Codec: Send + Sync {
    fn format(&self) -> CompressionFormat;

    fn compress(&self, input: &[u8]) -> BundleResult<Vec<u8>>;

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> BundleResult<()>;
}

/// Stores packets verbatim.
pub struct NoCompression;

impl Codec for NoCompression {
    fn format(&self) -> CompressionFormat {
        CompressionFormat::None
    }

    fn compress(&self, input: &[u8]) -> BundleResult<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> BundleResult<()> {
        if input.len() != output.len() {
            return Err(BundleError::DecompressionFailed(format!(
                "uncompressed packet is {} bytes, expected {}",
                input.len(),
                output.len()
            )));
        }
        output.copy_from_slice(input);
        Ok(())
    }
}

/// LZ4 block format, without a size prefix (the header stores it).
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn format(&self) -> CompressionFormat {
        CompressionFormat::Lz4
    }

    fn compress(&self, input: &[u8]) -> BundleResult<Vec<u8>> {
        lz4::block::compress(input, None, false)
            .map_err(|e| BundleError::CompressionFailed(e.to_string()))
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> BundleResult<()> {
        let expected = i32::try_from(output.len()).map_err(|_| {
            BundleError::DecompressionFailed(format!("packet too large for lz4: {}", output.len()))
        })?;
        let written = lz4::block::decompress_to_buffer(input, Some(expected), output)
            .map_err(|e| BundleError::DecompressionFailed(e.to_string()))?;
        check_length(written, output.len())
    }
}

pub struct GzipCodec;

impl Codec for GzipCodec {
    fn format(&self) -> CompressionFormat {
        CompressionFormat::Gzip
    }

    fn compress(&self, input: &[u8]) -> BundleResult<Vec<u8>> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(input)
            .map_err(|e| BundleError::CompressionFailed(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| BundleError::CompressionFailed(e.to_string()))
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> BundleResult<()> {
        let mut decoder = flate2::read::GzDecoder::new(input);
        decoder
            .read_exact(output)
            .map_err(|e| BundleError::DecompressionFailed(e.to_string()))?;
        let mut probe = [0u8; 1];
        match decoder.read(&mut probe) {
            Ok(0) => Ok(()),
            Ok(_) => Err(BundleError::DecompressionFailed(
                "gzip stream is longer than the declared packet length".into(),
            )),
            Err(e) => Err(BundleError::DecompressionFailed(e.to_string())),
        }
    }
}

pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub const fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Codec for ZstdCodec {
    fn format(&self) -> CompressionFormat {
        CompressionFormat::Zstd
    }

    fn compress(&self, input: &[u8]) -> BundleResult<Vec<u8>> {
        zstd::bulk::compress(input, self.level)
            .map_err(|e| BundleError::CompressionFailed(e.to_string()))
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> BundleResult<()> {
        let written = zstd::bulk::decompress_to_buffer(input, output)
            .map_err(|e| BundleError::DecompressionFailed(e.to_string()))?;
        check_length(written, output.len())
    }
}

fn check_length(written: usize, expected: usize) -> BundleResult<()> {
    if written != expected {
        return Err(BundleError::DecompressionFailed(format!(
            "decoded {written} bytes, expected {expected}"
        )));
    }
    Ok(())
}

static NONE: NoCompression = NoCompression;
static LZ4: Lz4Codec = Lz4Codec;
static GZIP: GzipCodec = GzipCodec;
static ZSTD: ZstdCodec = ZstdCodec::new(3);

/// Look up the codec for a format.
pub fn codec(format: CompressionFormat) -> BundleResult<&'static dyn Codec> {
    match format {
        CompressionFormat::None => Ok(&NONE),
        CompressionFormat::Lz4 => Ok(&LZ4),
        CompressionFormat::Gzip => Ok(&GZIP),
        CompressionFormat::Zstd => Ok(&ZSTD),
        CompressionFormat::Oodle => Err(BundleError::UnsupportedCodec(format)),
    }
}

/// Compress one packet. The encoded length is the length of the result.
pub fn compress(format: CompressionFormat, input: &[u8]) -> BundleResult<Vec<u8>> {
    codec(format)?.compress(input)
}

/// Decompress one packet into a buffer of exactly its decoded length.
pub fn decompress(format: CompressionFormat, input: &[u8], output: &mut [u8]) -> BundleResult<()> {
    codec(format)?.decompress(input, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..4096u32).flat_map(|i| (i % 17).to_le_bytes()).collect()
    }

    #[test]
    fn available_codecs_roundtrip() {
        let input = sample();
        for format in [
            CompressionFormat::None,
            CompressionFormat::Lz4,
            CompressionFormat::Gzip,
            CompressionFormat::Zstd,
        ] {
            let encoded = compress(format, &input).unwrap();
            let mut output = vec![0u8; input.len()];
            decompress(format, &encoded, &mut output).unwrap();
            assert_eq!(output, input, "{format} roundtrip");
        }
    }

    #[test]
    fn repetitive_data_shrinks() {
        let input = sample();
        for format in [CompressionFormat::Lz4, CompressionFormat::Gzip, CompressionFormat::Zstd] {
            assert!(compress(format, &input).unwrap().len() < input.len());
        }
    }

    #[test]
    fn reserved_codec_is_an_explicit_error() {
        let err = compress(CompressionFormat::Oodle, b"data").unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedCodec(CompressionFormat::Oodle)));
        let mut out = [0u8; 4];
        let err = decompress(CompressionFormat::Oodle, b"data", &mut out).unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedCodec(_)));
    }

    #[test]
    fn wrong_output_length_fails() {
        let input = sample();
        for format in [CompressionFormat::None, CompressionFormat::Gzip, CompressionFormat::Zstd] {
            let encoded = compress(format, &input).unwrap();
            let mut short = vec![0u8; input.len() + 8];
            assert!(decompress(format, &encoded, &mut short).is_err(), "{format}");
        }
    }

    #[test]
    fn tags_roundtrip_and_unknown_fails() {
        for tag in 0..5 {
            assert_eq!(CompressionFormat::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(matches!(
            CompressionFormat::from_tag(9),
            Err(BundleError::UnknownCompression(9))
        ));
    }
}
