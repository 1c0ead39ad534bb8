use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "arbor",
    about = "Inspect arbor bundles and storage configuration",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Decode a bundle file and print its header
    Inspect(InspectArgs),
    /// Validate a TOML storage configuration and print it with defaults filled in
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct InspectArgs {
    pub file: PathBuf,
    /// Decompress every packet and check each export against its hash
    #[arg(long)]
    pub verify: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    pub file: PathBuf,
}
