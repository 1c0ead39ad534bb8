//! Bundle header: the self-describing table of contents of a bundle.
//!
//! Layout:
//!
//! ```text
//! prelude   "ARBN" | u32 BE header length (including the prelude)
//! version   varint
//! format    varint compression tag
//! types     varint n, n × (16-byte GUID, varint version)
//! imports   varint n, n × (string locator, varint m, m × varint export index)
//! exports   varint n, n × (varint type index, 32-byte hash, varint length,
//!                          varint r, r × varint reference index,
//!                          string alias   -- version >= ExportAliases only)
//! packets   varint n, n × (varint encoded length, varint decoded length)
//!                          -- omitted when format is None
//! ```
//!
//! References index a flat table: every imported export, grouped by import
//! in declared order, followed by every local export.

use serde::Serialize;

use arbor_types::{BlobLocator, ContentHash, NodeType};

use crate::compression::CompressionFormat;
use crate::error::{BundleError, BundleResult};
use crate::varint::{encode_string, encode_varint, ByteCursor};

/// Four-byte signature at the start of every bundle.
pub const BUNDLE_SIGNATURE: [u8; 4] = *b"ARBN";

/// Signature plus the big-endian header length.
pub const PRELUDE_LEN: usize = 8;

/// Largest header length the u32 prelude can declare.
const MAX_HEADER_LEN: usize = u32::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum BundleVersion {
    Initial,
    /// Exports carry an optional alias.
    ExportAliases,
}

impl BundleVersion {
    pub const LATEST: Self = Self::ExportAliases;

    pub fn tag(self) -> u64 {
        match self {
            Self::Initial => 0,
            Self::ExportAliases => 1,
        }
    }

    pub fn from_tag(tag: u64) -> BundleResult<Self> {
        match tag {
            0 => Ok(Self::Initial),
            1 => Ok(Self::ExportAliases),
            other => Err(BundleError::UnsupportedVersion(other)),
        }
    }
}

/// Exports of another, already written bundle referenced from this one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BundleImport {
    pub locator: BlobLocator,
    pub exports: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BundleExport {
    pub type_index: usize,
    pub hash: ContentHash,
    /// Uncompressed length of the node's bytes.
    pub length: usize,
    /// Indices into the bundle's reference table.
    pub references: Vec<usize>,
    pub alias: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BundlePacket {
    pub encoded_length: usize,
    pub decoded_length: usize,
}

/// Position of one export's bytes inside the decoded packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportSpan {
    pub packet: usize,
    pub offset: usize,
    pub length: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BundleHeader {
    pub version: BundleVersion,
    pub compression: CompressionFormat,
    pub types: Vec<NodeType>,
    pub imports: Vec<BundleImport>,
    pub exports: Vec<BundleExport>,
    pub packets: Vec<BundlePacket>,
}

impl BundleHeader {
    /// Number of reference-table slots taken by imports.
    pub fn import_reference_count(&self) -> usize {
        self.imports.iter().map(|import| import.exports.len()).sum()
    }

    /// Size of the flat reference table.
    pub fn reference_count(&self) -> usize {
        self.import_reference_count() + self.exports.len()
    }

    /// Total encoded size of the packet bodies following the header.
    pub fn encoded_body_len(&self) -> BundleResult<usize> {
        self.packets
            .iter()
            .try_fold(0usize, |total, p| total.checked_add(p.encoded_length))
            .ok_or_else(|| BundleError::Corrupt("packet lengths overflow".into()))
    }

    /// Parse the prelude and return the declared header length.
    pub fn read_prelude(data: &[u8]) -> BundleResult<usize> {
        if data.len() < PRELUDE_LEN {
            return Err(BundleError::Truncated {
                offset: data.len(),
                context: "bundle prelude",
            });
        }
        if data[0..4] != BUNDLE_SIGNATURE {
            return Err(BundleError::InvalidSignature {
                expected: String::from_utf8_lossy(&BUNDLE_SIGNATURE).into(),
                actual: String::from_utf8_lossy(&data[0..4]).into(),
            });
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[4..8]);
        let header_len = u32::from_be_bytes(len) as usize;
        if header_len < PRELUDE_LEN {
            return Err(BundleError::Corrupt(format!(
                "declared header length {header_len} is shorter than the prelude"
            )));
        }
        Ok(header_len)
    }

    pub fn encode(&self) -> BundleResult<Vec<u8>> {
        self.validate()?;

        let mut body = Vec::new();
        encode_varint(&mut body, self.version.tag());
        encode_varint(&mut body, self.compression.tag());

        encode_varint(&mut body, self.types.len() as u64);
        for node_type in &self.types {
            body.extend_from_slice(node_type.guid.as_bytes());
            encode_varint(&mut body, node_type.version as u64);
        }

        encode_varint(&mut body, self.imports.len() as u64);
        for import in &self.imports {
            encode_string(&mut body, import.locator.as_str());
            encode_varint(&mut body, import.exports.len() as u64);
            for &index in &import.exports {
                encode_varint(&mut body, index as u64);
            }
        }

        encode_varint(&mut body, self.exports.len() as u64);
        for export in &self.exports {
            encode_varint(&mut body, export.type_index as u64);
            body.extend_from_slice(export.hash.as_bytes());
            encode_varint(&mut body, export.length as u64);
            encode_varint(&mut body, export.references.len() as u64);
            for &reference in &export.references {
                encode_varint(&mut body, reference as u64);
            }
            if self.version >= BundleVersion::ExportAliases {
                encode_string(&mut body, export.alias.as_deref().unwrap_or(""));
            }
        }

        if self.compression != CompressionFormat::None {
            encode_varint(&mut body, self.packets.len() as u64);
            for packet in &self.packets {
                encode_varint(&mut body, packet.encoded_length as u64);
                encode_varint(&mut body, packet.decoded_length as u64);
            }
        }

        let header_len = u32::try_from(PRELUDE_LEN + body.len())
            .map_err(|_| BundleError::Corrupt("bundle header exceeds 4 GiB".into()))?;
        let mut out = Vec::with_capacity(header_len as usize);
        out.extend_from_slice(&BUNDLE_SIGNATURE);
        out.extend_from_slice(&header_len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a header. `data` must hold at least the declared header length;
    /// anything after it is ignored.
    pub fn decode(data: &[u8]) -> BundleResult<Self> {
        let header_len = Self::read_prelude(data)?;
        if data.len() < header_len {
            return Err(BundleError::Truncated {
                offset: data.len(),
                context: "bundle header",
            });
        }
        let mut cursor = ByteCursor::new(&data[PRELUDE_LEN..header_len]);

        let version = BundleVersion::from_tag(cursor.read_varint("version")?)?;
        let compression = CompressionFormat::from_tag(cursor.read_varint("compression")?)?;

        let type_count = cursor.read_usize("type count")?;
        let mut types = Vec::with_capacity(type_count.min(cursor.remaining()));
        for _ in 0..type_count {
            let guid = cursor.read_guid("type guid")?;
            let version = u32::try_from(cursor.read_varint("type version")?)
                .map_err(|_| BundleError::Corrupt("type version out of range".into()))?;
            types.push(NodeType::new(guid, version));
        }

        let import_count = cursor.read_usize("import count")?;
        let mut imports = Vec::with_capacity(import_count.min(cursor.remaining()));
        for _ in 0..import_count {
            let locator = BlobLocator::new(cursor.read_string("import locator")?)?;
            let count = cursor.read_usize("import export count")?;
            let mut exports = Vec::with_capacity(count.min(cursor.remaining()));
            for _ in 0..count {
                exports.push(cursor.read_usize("import export index")?);
            }
            imports.push(BundleImport { locator, exports });
        }

        let export_count = cursor.read_usize("export count")?;
        let mut exports = Vec::with_capacity(export_count.min(cursor.remaining()));
        for _ in 0..export_count {
            let type_index = cursor.read_usize("export type index")?;
            let hash = cursor.read_hash("export hash")?;
            let length = cursor.read_usize("export length")?;
            let ref_count = cursor.read_usize("export reference count")?;
            let mut references = Vec::with_capacity(ref_count.min(cursor.remaining()));
            for _ in 0..ref_count {
                references.push(cursor.read_usize("export reference")?);
            }
            let alias = if version >= BundleVersion::ExportAliases {
                Some(cursor.read_string("export alias")?).filter(|alias| !alias.is_empty())
            } else {
                None
            };
            exports.push(BundleExport {
                type_index,
                hash,
                length,
                references,
                alias,
            });
        }

        let packets = if compression != CompressionFormat::None {
            let packet_count = cursor.read_usize("packet count")?;
            let mut packets = Vec::with_capacity(packet_count.min(cursor.remaining()));
            for _ in 0..packet_count {
                let encoded_length = cursor.read_usize("packet encoded length")?;
                let decoded_length = cursor.read_usize("packet decoded length")?;
                packets.push(BundlePacket {
                    encoded_length,
                    decoded_length,
                });
            }
            packets
        } else if exports.is_empty() {
            Vec::new()
        } else {
            // Uncompressed bundles store every export in one implicit packet.
            let total = exports
                .iter()
                .try_fold(0usize, |total, e| total.checked_add(e.length))
                .ok_or_else(|| BundleError::Corrupt("export lengths overflow".into()))?;
            vec![BundlePacket {
                encoded_length: total,
                decoded_length: total,
            }]
        };

        if !cursor.is_empty() {
            return Err(BundleError::Corrupt(format!(
                "{} trailing bytes in bundle header",
                cursor.remaining()
            )));
        }

        let header = Self {
            version,
            compression,
            types,
            imports,
            exports,
            packets,
        };
        header.validate()?;
        Ok(header)
    }

    /// Check internal consistency: type and reference indices are in range,
    /// aliases match the version, and the packing invariant holds.
    pub fn validate(&self) -> BundleResult<()> {
        let reference_count = self.reference_count();
        for (i, export) in self.exports.iter().enumerate() {
            if export.type_index >= self.types.len() {
                return Err(BundleError::Corrupt(format!(
                    "export {i} has type index {} but only {} types are declared",
                    export.type_index,
                    self.types.len()
                )));
            }
            if let Some(&bad) = export.references.iter().find(|&&r| r >= reference_count) {
                return Err(BundleError::Corrupt(format!(
                    "export {i} references slot {bad} but the reference table has {reference_count} entries"
                )));
            }
            if export.alias.is_some() && self.version < BundleVersion::ExportAliases {
                return Err(BundleError::Corrupt(format!(
                    "export {i} has an alias, which requires version {:?}",
                    BundleVersion::ExportAliases
                )));
            }
        }
        if self.compression == CompressionFormat::None {
            if self.packets.len() > 1 {
                return Err(BundleError::Corrupt(
                    "uncompressed bundles hold a single packet".into(),
                ));
            }
            if let Some(p) = self.packets.iter().find(|p| p.encoded_length != p.decoded_length) {
                return Err(BundleError::Corrupt(format!(
                    "uncompressed packet has encoded length {} but decoded length {}",
                    p.encoded_length, p.decoded_length
                )));
            }
        }
        self.packet_offsets(MAX_HEADER_LEN)?;
        self.export_spans().map(|_| ())
    }

    /// Map every export to its packet and offset within the decoded packet.
    ///
    /// Exports are laid out back to back in packet order and never straddle
    /// a packet boundary; the lengths of the exports in packet `P` sum to
    /// `packets[P].decoded_length`.
    pub fn export_spans(&self) -> BundleResult<Vec<ExportSpan>> {
        let mut spans = Vec::with_capacity(self.exports.len());
        let mut used = vec![0usize; self.packets.len()];
        let mut packet = 0usize;
        let mut offset = 0usize;

        for (i, export) in self.exports.iter().enumerate() {
            loop {
                let current = self.packets.get(packet).ok_or_else(|| {
                    BundleError::Corrupt(format!("export {i} lies beyond the last packet"))
                })?;
                let end = offset.checked_add(export.length).ok_or_else(|| {
                    BundleError::Corrupt(format!("export {i} length overflows"))
                })?;
                if end <= current.decoded_length {
                    break;
                }
                if offset != current.decoded_length {
                    return Err(BundleError::Corrupt(format!(
                        "export {i} straddles the end of packet {packet}"
                    )));
                }
                packet += 1;
                offset = 0;
            }
            spans.push(ExportSpan {
                packet,
                offset,
                length: export.length,
            });
            used[packet] += export.length;
            offset += export.length;
        }

        for (index, (packet, used)) in self.packets.iter().zip(&used).enumerate() {
            if packet.decoded_length != *used {
                return Err(BundleError::Corrupt(format!(
                    "packet {index} decodes to {} bytes but its exports hold {used}",
                    packet.decoded_length
                )));
            }
        }
        Ok(spans)
    }

    /// Absolute byte offset of every packet within the bundle blob, given the
    /// header length. Fails if the end of the last packet is not addressable.
    pub fn packet_offsets(&self, header_len: usize) -> BundleResult<Vec<usize>> {
        let mut offsets = Vec::with_capacity(self.packets.len());
        let mut offset = header_len;
        for (index, packet) in self.packets.iter().enumerate() {
            offsets.push(offset);
            offset = offset.checked_add(packet.encoded_length).ok_or_else(|| {
                BundleError::Corrupt(format!("packet {index} ends past the addressable range"))
            })?;
        }
        Ok(offsets)
    }
}
