use std::path::Path;

use arbor_bundle::{CompressionFormat, PRELUDE_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Tuning for [`TreeWriter`](crate::TreeWriter).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// A bundle seals once its uncompressed size exceeds this (default: 1 MiB).
    pub max_blob_size: usize,
    /// Packets are compressed once they reach this size (default: 16 KiB).
    pub min_packet_size: usize,
    /// A packet is closed before a node would push it past this size
    /// (default: 256 KiB).
    pub max_packet_size: usize,
    /// Node admission waits while sealed, unwritten bundles hold more than
    /// this many uncompressed bytes (default: 64 MiB).
    pub max_in_flight_bytes: usize,
    pub compression: CompressionFormat,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_blob_size: MIB,
            min_packet_size: 16 * KIB,
            max_packet_size: 256 * KIB,
            max_in_flight_bytes: 64 * MIB,
            compression: CompressionFormat::default(),
        }
    }
}

/// Tuning for [`TreeReader`](crate::TreeReader).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Size of the speculative first read of a bundle (default: 64 KiB).
    pub header_prefetch_size: usize,
    /// Ceiling for one coalesced packet read (default: 1 MiB).
    pub max_fetch_size: usize,
    /// Fetch workers; at most one request per blob is in flight (default: 4).
    pub worker_count: usize,
    /// Byte budget of the encoded packet cache (default: 32 MiB).
    pub encoded_cache_bytes: u64,
    /// Byte budget of the decoded packet cache (default: 64 MiB).
    pub decoded_cache_bytes: u64,
    /// Number of parsed bundle headers kept (default: 1024).
    pub header_cache_entries: u64,
    /// Bundles declaring a larger decoded packet are rejected as corrupt
    /// before anything is allocated (default: 256 MiB).
    pub max_decoded_packet_size: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            header_prefetch_size: 64 * KIB,
            max_fetch_size: MIB,
            worker_count: 4,
            encoded_cache_bytes: 32 * MIB as u64,
            decoded_cache_bytes: 64 * MIB as u64,
            header_cache_entries: 1024,
            max_decoded_packet_size: 256 * MIB,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCacheOptions {
    /// Maximum number of dedup keys; 0 disables the cache (default: 65536).
    pub max_keys: usize,
}

impl Default for NodeCacheOptions {
    fn default() -> Self {
        Self { max_keys: 65536 }
    }
}

/// Complete configuration of a [`StorageClient`](crate::StorageClient).
///
/// ```
/// use arbor_tree::StorageConfig;
///
/// let config = StorageConfig::from_toml_str(
///     "[writer]\ncompression = \"zstd\"\n\n[reader]\nworker_count = 2\n",
/// )
/// .unwrap();
/// assert_eq!(config.reader.worker_count, 2);
/// assert_eq!(config.writer.max_blob_size, 1024 * 1024);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub writer: WriterOptions,
    pub reader: ReaderOptions,
    pub node_cache: NodeCacheOptions,
}

impl StorageConfig {
    /// Parse and validate a TOML document. Missing fields take defaults.
    pub fn from_toml_str(input: &str) -> StorageResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&input)
    }

    pub fn to_toml_string(&self) -> StorageResult<String> {
        toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))
    }

    pub fn validate(&self) -> StorageResult<()> {
        self.writer.validate()?;
        self.reader.validate()
    }
}

impl WriterOptions {
    pub fn validate(&self) -> StorageResult<()> {
        if self.max_blob_size == 0 || self.max_packet_size == 0 || self.max_in_flight_bytes == 0 {
            return Err(StorageError::Config(
                "writer sizes must be greater than zero".into(),
            ));
        }
        if self.min_packet_size > self.max_packet_size {
            return Err(StorageError::Config(format!(
                "min_packet_size ({}) exceeds max_packet_size ({})",
                self.min_packet_size, self.max_packet_size
            )));
        }
        Ok(())
    }
}

impl ReaderOptions {
    pub fn validate(&self) -> StorageResult<()> {
        if self.header_prefetch_size < PRELUDE_LEN {
            return Err(StorageError::Config(format!(
                "header_prefetch_size must be at least {PRELUDE_LEN} bytes"
            )));
        }
        if self.max_fetch_size == 0 {
            return Err(StorageError::Config("max_fetch_size must be greater than zero".into()));
        }
        if self.max_decoded_packet_size == 0 {
            return Err(StorageError::Config(
                "max_decoded_packet_size must be greater than zero".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(StorageError::Config("worker_count must be at least 1".into()));
        }
        if self.header_cache_entries == 0 {
            return Err(StorageError::Config(
                "header_cache_entries must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        let c = StorageConfig::default();
        assert_eq!(c.writer.max_blob_size, 1024 * 1024);
        assert_eq!(c.writer.min_packet_size, 16 * 1024);
        assert_eq!(c.writer.max_packet_size, 256 * 1024);
        assert_eq!(c.writer.max_in_flight_bytes, 64 * 1024 * 1024);
        assert_eq!(c.writer.compression, CompressionFormat::Lz4);
        assert_eq!(c.reader.header_prefetch_size, 64 * 1024);
        assert_eq!(c.reader.worker_count, 4);
        assert_eq!(c.node_cache.max_keys, 65536);
        c.validate().unwrap();
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(StorageConfig::from_toml_str("").unwrap(), StorageConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let c = StorageConfig::from_toml_str(
            "[writer]\nmax_blob_size = 4096\ncompression = \"gzip\"\n\n[node_cache]\nmax_keys = 8\n",
        )
        .unwrap();
        assert_eq!(c.writer.max_blob_size, 4096);
        assert_eq!(c.writer.compression, CompressionFormat::Gzip);
        assert_eq!(c.writer.max_packet_size, 256 * 1024);
        assert_eq!(c.node_cache.max_keys, 8);
        assert_eq!(c.reader, ReaderOptions::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = StorageConfig::from_toml_str("[reader]\nworker_count = 0\n").unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        let err = StorageConfig::from_toml_str(
            "[writer]\nmin_packet_size = 10\nmax_packet_size = 5\n",
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        let err = StorageConfig::from_toml_str("[writer]\ncompression = \"brotli\"\n").unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn load_from_file_and_print() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[reader]\nheader_prefetch_size = 128").unwrap();
        let c = StorageConfig::load(file.path()).unwrap();
        assert_eq!(c.reader.header_prefetch_size, 128);

        let printed = c.to_toml_string().unwrap();
        assert_eq!(StorageConfig::from_toml_str(&printed).unwrap(), c);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = StorageConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
