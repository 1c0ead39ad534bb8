//! Bundle container format for the Arbor tree store.
//!
//! A bundle is one immutable blob holding many serialized nodes ("exports").
//! Node bytes are concatenated into packets, each packet compressed as a
//! unit, and a header describes types, imports, exports, and packets.
//!
//! # Architecture
//!
//! - **Header** ([`BundleHeader`]): signature, version, compression tag, and the type, import, export, and packet tables
//! - **Packets**: concatenated node bytes, compressed independently so readers can fetch a slice of the blob
//! - **Codecs** ([`Codec`]): none, LZ4, gzip, and zstd, selected by the header's format tag
//! - **Varints**: LEB128 integers and a bounds-checked [`ByteCursor`]

pub mod bundle;
pub mod compression;
pub mod error;
pub mod header;
pub mod varint;

pub use bundle::Bundle;
pub use compression::{codec, compress, decompress, Codec, CompressionFormat};
pub use error::{BundleError, BundleResult};
pub use header::{
    BundleExport, BundleHeader, BundleImport, BundlePacket, BundleVersion, ExportSpan,
    BUNDLE_SIGNATURE, PRELUDE_LEN,
};
pub use varint::{decode_varint, encode_bytes, encode_string, encode_varint, varint_len, ByteCursor};
