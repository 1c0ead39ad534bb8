//! Parsed bundle header plus the lookups a reader needs.

use arbor_bundle::{BundleExport, BundleHeader, ExportSpan};
use arbor_types::{BlobLocator, NodeLocator, NodeType};

use crate::error::{StorageError, StorageResult};

/// A bundle header resolved against the blob it came from.
#[derive(Clone, Debug)]
pub struct BundleInfo {
    pub locator: BlobLocator,
    pub header: BundleHeader,
    /// Length of the encoded header, including the prelude.
    pub header_len: usize,
    packet_offsets: Vec<usize>,
    spans: Vec<ExportSpan>,
    /// Flat reference table: imported exports, then this bundle's exports.
    references: Vec<NodeLocator>,
}

impl BundleInfo {
    pub fn new(locator: BlobLocator, header: BundleHeader, header_len: usize) -> StorageResult<Self> {
        let spans = header.export_spans()?;
        let packet_offsets = header.packet_offsets(header_len)?;
        let mut references = Vec::with_capacity(header.reference_count());
        for import in &header.imports {
            references.extend(import.exports.iter().map(|&index| import.locator.node(index)));
        }
        references.extend((0..header.exports.len()).map(|index| locator.node(index)));
        Ok(Self {
            locator,
            header,
            header_len,
            packet_offsets,
            spans,
            references,
        })
    }

    pub fn export_count(&self) -> usize {
        self.header.exports.len()
    }

    pub fn packet_count(&self) -> usize {
        self.header.packets.len()
    }

    pub fn export(&self, index: usize) -> StorageResult<&BundleExport> {
        self.header.exports.get(index).ok_or_else(|| self.out_of_range(index))
    }

    pub fn span(&self, index: usize) -> StorageResult<ExportSpan> {
        self.spans.get(index).copied().ok_or_else(|| self.out_of_range(index))
    }

    pub fn node_type(&self, index: usize) -> StorageResult<NodeType> {
        let export = self.export(index)?;
        self.header
            .types
            .get(export.type_index)
            .copied()
            .ok_or_else(|| {
                StorageError::Consistency(format!(
                    "{}: export {index} has type index {} out of range",
                    self.locator, export.type_index
                ))
            })
    }

    /// Resolved locators of the nodes an export references, in order.
    pub fn export_refs(&self, index: usize) -> StorageResult<Vec<NodeLocator>> {
        self.export(index)?
            .references
            .iter()
            .map(|&slot| {
                self.references.get(slot).cloned().ok_or_else(|| {
                    StorageError::Consistency(format!(
                        "{}: export {index} references slot {slot} out of range",
                        self.locator
                    ))
                })
            })
            .collect()
    }

    /// Absolute offset and length of packets `first..=last` in the blob.
    pub fn packet_range(&self, first: usize, last: usize) -> (usize, usize) {
        let start = self.packet_offsets[first];
        let end = self.packet_offsets[last] + self.header.packets[last].encoded_length;
        (start, end - start)
    }

    /// Packets whose encoded bytes lie entirely within the first `prefix`
    /// bytes of the blob.
    pub fn packets_within(&self, prefix: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.packet_count()).take_while(move |&index| {
            self.packet_offsets[index] + self.header.packets[index].encoded_length <= prefix
        })
    }

    fn out_of_range(&self, index: usize) -> StorageError {
        StorageError::Consistency(format!(
            "{}: export index {index} out of range ({} exports)",
            self.locator,
            self.export_count()
        ))
    }
}

#[cfg(test)]
mod tests {
    use arbor_bundle::{BundleImport, BundlePacket, BundleVersion, CompressionFormat};
    use arbor_types::ContentHash;

    use super::*;

    const T: NodeType = NodeType::from_u128(0xAB, 1);

    fn export(length: usize, references: Vec<usize>) -> BundleExport {
        BundleExport {
            type_index: 0,
            hash: ContentHash::of(&length.to_le_bytes()),
            length,
            references,
            alias: None,
        }
    }

    fn info() -> BundleInfo {
        let other = BlobLocator::new("bundles/other").unwrap();
        let header = BundleHeader {
            version: BundleVersion::LATEST,
            compression: CompressionFormat::Lz4,
            types: vec![T],
            imports: vec![BundleImport {
                locator: other,
                exports: vec![4, 2],
            }],
            exports: vec![export(10, vec![1]), export(5, vec![0, 2]), export(7, vec![])],
            packets: vec![
                BundlePacket {
                    encoded_length: 9,
                    decoded_length: 15,
                },
                BundlePacket {
                    encoded_length: 6,
                    decoded_length: 7,
                },
            ],
        };
        BundleInfo::new(BlobLocator::new("bundles/self").unwrap(), header, 100).unwrap()
    }

    #[test]
    fn references_resolve_imports_then_locals() {
        let info = info();
        let other = BlobLocator::new("bundles/other").unwrap();
        let own = BlobLocator::new("bundles/self").unwrap();
        assert_eq!(info.export_refs(0).unwrap(), vec![other.node(2)]);
        assert_eq!(info.export_refs(1).unwrap(), vec![other.node(4), own.node(0)]);
        assert!(info.export_refs(2).unwrap().is_empty());
        assert!(matches!(info.export_refs(3), Err(StorageError::Consistency(_))));
    }

    #[test]
    fn spans_and_ranges() {
        let info = info();
        assert_eq!(info.span(1).unwrap().offset, 10);
        assert_eq!(info.span(2).unwrap().packet, 1);
        assert_eq!(info.packet_range(0, 0), (100, 9));
        assert_eq!(info.packet_range(1, 1), (109, 6));
        assert_eq!(info.packet_range(0, 1), (100, 15));
        assert_eq!(info.node_type(2).unwrap(), T);
    }

    #[test]
    fn packets_within_prefix() {
        let info = info();
        assert_eq!(info.packets_within(108).count(), 0);
        assert_eq!(info.packets_within(109).collect::<Vec<_>>(), vec![0]);
        assert_eq!(info.packets_within(4096).collect::<Vec<_>>(), vec![0, 1]);
    }
}
