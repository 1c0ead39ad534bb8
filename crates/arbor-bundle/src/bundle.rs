//! A whole bundle: header plus its encoded packets.
//!
//! Readers normally work from the header and fetch packets by range; this
//! type is for tools and tests that hold the entire blob in memory.

use bytes::Bytes;
use tracing::trace;

use crate::compression;
use crate::error::{BundleError, BundleResult};
use crate::header::BundleHeader;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bundle {
    pub header: BundleHeader,
    /// Encoded packet bodies, one per header packet.
    pub packets: Vec<Bytes>,
}

impl Bundle {
    pub fn new(header: BundleHeader, packets: Vec<Bytes>) -> BundleResult<Self> {
        let bundle = Self { header, packets };
        bundle.check_packets()?;
        Ok(bundle)
    }

    fn check_packets(&self) -> BundleResult<()> {
        if self.packets.len() != self.header.packets.len() {
            return Err(BundleError::Corrupt(format!(
                "header declares {} packets but {} were supplied",
                self.header.packets.len(),
                self.packets.len()
            )));
        }
        for (i, (declared, body)) in self.header.packets.iter().zip(&self.packets).enumerate() {
            if declared.encoded_length != body.len() {
                return Err(BundleError::Corrupt(format!(
                    "packet {i} is {} bytes but the header declares {}",
                    body.len(),
                    declared.encoded_length
                )));
            }
        }
        Ok(())
    }

    /// Serialize header and packets into one blob.
    pub fn to_bytes(&self) -> BundleResult<Vec<u8>> {
        self.check_packets()?;
        let mut out = self.header.encode()?;
        out.reserve(self.header.encoded_body_len()?);
        for packet in &self.packets {
            out.extend_from_slice(packet);
        }
        Ok(out)
    }

    /// Parse a complete bundle blob. The body must be exactly the sum of the
    /// declared packet lengths.
    pub fn from_bytes(data: &[u8]) -> BundleResult<Self> {
        let header_len = BundleHeader::read_prelude(data)?;
        let header = BundleHeader::decode(data)?;
        let body_len = header.encoded_body_len()?;
        let actual = data.len() - header_len;
        if actual < body_len {
            return Err(BundleError::Truncated {
                offset: data.len(),
                context: "bundle packets",
            });
        }
        if actual > body_len {
            return Err(BundleError::Corrupt(format!(
                "{} trailing bytes after the last packet",
                actual - body_len
            )));
        }

        let offsets = header.packet_offsets(header_len)?;
        let packets = offsets
            .iter()
            .zip(&header.packets)
            .map(|(&offset, packet)| {
                Bytes::copy_from_slice(&data[offset..offset + packet.encoded_length])
            })
            .collect();
        trace!(
            header_len,
            packets = header.packets.len(),
            exports = header.exports.len(),
            "parsed bundle"
        );
        Ok(Self { header, packets })
    }

    /// Decompress one packet.
    pub fn decode_packet(&self, index: usize) -> BundleResult<Vec<u8>> {
        let declared = self.header.packets.get(index).ok_or_else(|| {
            BundleError::Corrupt(format!("packet index {index} out of range"))
        })?;
        let body = self.packets.get(index).ok_or_else(|| {
            BundleError::Corrupt(format!("packet {index} body missing"))
        })?;
        let mut output = vec![0u8; declared.decoded_length];
        compression::decompress(self.header.compression, body, &mut output)?;
        Ok(output)
    }

    /// The uncompressed bytes of one export.
    pub fn export_data(&self, index: usize) -> BundleResult<Vec<u8>> {
        let spans = self.header.export_spans()?;
        let span = spans.get(index).ok_or_else(|| {
            BundleError::Corrupt(format!("export index {index} out of range"))
        })?;
        let packet = self.decode_packet(span.packet)?;
        Ok(packet[span.offset..span.offset + span.length].to_vec())
    }
}
