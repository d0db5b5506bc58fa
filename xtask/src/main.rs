//! xtask automation tool for Tether
//!
//! Development tasks that are not part of the library itself.

mod gen_schemas;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development automation tool for Tether")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the JSON schema of the control-message protocol
    GenSchemas {
        /// Directory to write schema files into
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
        /// Fail instead of writing when a checked-in schema is stale
        #[arg(long)]
        check: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenSchemas { out_dir, check } => gen_schemas::run(&out_dir, check),
    }
}
