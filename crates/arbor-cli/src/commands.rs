use std::path::Path;

use anyhow::Context;
use arbor_bundle::{Bundle, BundleHeader};
use arbor_tree::StorageConfig;
use arbor_types::ContentHash;
use colored::Colorize;
use serde::Serialize;
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Inspect(args) => cmd_inspect(args, cli.format),
        Command::Config(args) => cmd_config(args, cli.format),
    }
}

/// Everything `inspect` reports about one bundle file.
#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub file: String,
    pub size: usize,
    pub header_len: usize,
    pub header: BundleHeader,
    /// Exports whose bytes matched their hash, when `--verify` was given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<usize>,
}

pub fn inspect_file(path: &Path, verify: bool) -> anyhow::Result<InspectReport> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let header_len = BundleHeader::read_prelude(&data)?;
    let bundle =
        Bundle::from_bytes(&data).with_context(|| format!("decoding {}", path.display()))?;
    debug!(
        file = %path.display(),
        exports = bundle.header.exports.len(),
        packets = bundle.header.packets.len(),
        "decoded bundle"
    );

    let verified = if verify {
        Some(verify_exports(&bundle)?)
    } else {
        None
    };
    Ok(InspectReport {
        file: path.display().to_string(),
        size: data.len(),
        header_len,
        header: bundle.header,
        verified,
    })
}

fn verify_exports(bundle: &Bundle) -> anyhow::Result<usize> {
    for (index, export) in bundle.header.exports.iter().enumerate() {
        let data = bundle.export_data(index)?;
        let actual = ContentHash::of(&data);
        if actual != export.hash {
            anyhow::bail!(
                "export {index}: content hashes to {} but the header declares {}",
                actual.short_hex(),
                export.hash.short_hex()
            );
        }
    }
    Ok(bundle.header.exports.len())
}

pub fn render_text(report: &InspectReport) -> String {
    let header = &report.header;
    let mut out = Vec::new();
    out.push(format!(
        "{} {} ({} bytes, header {} bytes)",
        "bundle".bold(),
        report.file.bold(),
        report.size,
        report.header_len
    ));
    out.push(format!(
        "  version {:?}, compression {}",
        header.version,
        header.compression.to_string().cyan()
    ));

    out.push(format!("{} ({})", "types".bold(), header.types.len()));
    for (i, node_type) in header.types.iter().enumerate() {
        out.push(format!("  [{i}] {node_type}"));
    }

    out.push(format!("{} ({})", "imports".bold(), header.imports.len()));
    for (i, import) in header.imports.iter().enumerate() {
        out.push(format!(
            "  [{i}] {} exports {:?}",
            import.locator.to_string().blue(),
            import.exports
        ));
    }

    out.push(format!("{} ({})", "exports".bold(), header.exports.len()));
    for (i, export) in header.exports.iter().enumerate() {
        let mut line = format!(
            "  [{i}] {} type {} len {} refs {:?}",
            export.hash.to_hex().yellow(),
            export.type_index,
            export.length,
            export.references
        );
        if let Some(alias) = &export.alias {
            line.push_str(&format!(" alias {}", alias.green()));
        }
        out.push(line);
    }

    out.push(format!("{} ({})", "packets".bold(), header.packets.len()));
    for (i, packet) in header.packets.iter().enumerate() {
        out.push(format!(
            "  [{i}] encoded {} decoded {}",
            packet.encoded_length, packet.decoded_length
        ));
    }

    if let Some(count) = report.verified {
        out.push(format!("{} {count} exports verified", "✓".green().bold()));
    }
    out.join("\n")
}

fn cmd_inspect(args: InspectArgs, format: OutputFormat) -> anyhow::Result<()> {
    let report = inspect_file(&args.file, args.verify)?;
    match format {
        OutputFormat::Text => println!("{}", render_text(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn cmd_config(args: ConfigArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = StorageConfig::load(&args.file)?;
    match format {
        OutputFormat::Text => {
            println!("{} {} is valid", "✓".green().bold(), args.file.display());
            print!("{}", config.to_toml_string()?);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use arbor_bundle::CompressionFormat;
    use arbor_storage::{InMemoryBackend, StorageBackend};
    use arbor_tree::{NodeCache, TreeWriter, WriterOptions};
    use arbor_types::NodeType;

    use super::*;

    const RAW: NodeType = NodeType::from_u128(0xc11, 1);

    async fn bundle_file(compression: CompressionFormat) -> (tempfile::NamedTempFile, ContentHash) {
        let backend = Arc::new(InMemoryBackend::new());
        let options = WriterOptions {
            compression,
            ..WriterOptions::default()
        };
        let mut writer = TreeWriter::new(backend.clone(), Arc::new(NodeCache::new(0)), options);
        let child = writer.write_node(RAW, b"child", &[], None).await.unwrap();
        let parent = writer
            .write_node(RAW, b"parent", &[child], Some("top"))
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let blob = parent.locator().unwrap().blob;
        let bytes = backend.read_blob(&blob).await.unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        (file, parent.hash())
    }

    #[tokio::test]
    async fn inspect_reports_and_verifies_exports() {
        let (file, parent) = bundle_file(CompressionFormat::Zstd).await;
        let report = inspect_file(file.path(), true).unwrap();

        assert_eq!(report.verified, Some(2));
        assert_eq!(report.header.exports.len(), 2);
        assert_eq!(report.header.exports[1].hash, parent);
        assert_eq!(report.header.exports[1].references, vec![0]);
        assert_eq!(report.header.exports[1].alias.as_deref(), Some("top"));

        let text = render_text(&report);
        assert!(text.contains(&parent.to_hex()));
        assert!(text.contains("top"));

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();
        assert_eq!(json["header"]["exports"].as_array().unwrap().len(), 2);
        assert_eq!(json["verified"], 2);
    }

    #[tokio::test]
    async fn uncompressed_bundles_inspect_too() {
        let (file, _) = bundle_file(CompressionFormat::None).await;
        let report = inspect_file(file.path(), true).unwrap();
        assert_eq!(report.header.compression, CompressionFormat::None);
        assert_eq!(report.verified, Some(2));
    }

    #[test]
    fn inspect_rejects_non_bundles() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a bundle").unwrap();
        assert!(inspect_file(file.path(), false).is_err());
    }

    #[test]
    fn config_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.toml");
        std::fs::write(&good, "[reader]\nworker_count = 2\n").unwrap();
        assert_eq!(StorageConfig::load(&good).unwrap().reader.worker_count, 2);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[writer]\nmin_packet_size = 10\nmax_packet_size = 5\n").unwrap();
        assert!(StorageConfig::load(&bad).is_err());
    }
}
