//! snapctl - operator tool for the template snapshot store.
//!
//! Inspects serialized block headers and prints the object layout a
//! build's artifacts live under.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandpool_blockmap::{BlockSource, Header};
use sandpool_snapstore::build::ArtifactKind;
use sandpool_snapstore::storage::layout;

#[derive(Parser)]
#[command(name = "snapctl", about = "Template snapshot store inspector")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a serialized block header and print its contents.
    Header {
        /// Path to a serialized block header.
        file: PathBuf,
    },
    /// Print the object keys a build's artifacts live under.
    Layout {
        /// Build identifier.
        build_id: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Header { file } => decode_header(&file),
        Command::Layout { build_id } => {
            print_layout(&build_id);
            Ok(())
        }
    }
}

fn decode_header(file: &Path) -> Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let header = Header::deserialize(&raw)
        .with_context(|| format!("failed to parse header {}", file.display()))?;

    println!("generation:  {}", header.generation());
    println!("size:        {} bytes", header.size());
    println!("block size:  {} bytes", header.block_size());
    println!("blocks:      {}", header.block_count());
    println!("mapped:      {}", header.entries().len());

    for (index, source) in header.entries() {
        let described = match source {
            BlockSource::Inherit => "inherit".to_string(),
            BlockSource::Local(path) => format!("local  {}", path),
            BlockSource::Remote(key) => format!("remote {}", key),
        };
        println!("  block {:>8}  {}", index, described);
    }
    Ok(())
}

fn print_layout(build_id: &str) {
    for kind in ArtifactKind::ALL {
        println!("{}", layout::diff_key(build_id, kind));
        println!("{}", layout::header_key(build_id, kind));
    }
    println!("{}", layout::boot_descriptor_key(build_id));
}
