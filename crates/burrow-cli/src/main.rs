use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(version)]
#[command(about = "Inspect a running game through its shared memory server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the versions a layout description file defines
    Versions {
        /// Layout description document
        #[arg(short, long, env = "BURROW_LAYOUTS")]
        layouts: PathBuf,
    },
    /// Resolve one version and print its offset tree
    Dump {
        #[arg(short, long, env = "BURROW_LAYOUTS")]
        layouts: PathBuf,
        /// Version name as declared in the document
        name: String,
    },
    /// Resolve one version and export it as JSON
    Export {
        #[arg(short, long, env = "BURROW_LAYOUTS")]
        layouts: PathBuf,
        name: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Attach to a running target and report the session details
    Status {
        /// Target process ID
        pid: u32,
        /// Identify the build against a layout description file
        #[arg(short, long, env = "BURROW_LAYOUTS")]
        layouts: Option<PathBuf>,
    },
    /// Attach and hexdump a region of target memory
    Hexdump {
        pid: u32,
        /// Start address (hex with optional 0x prefix)
        address: String,
        /// Number of bytes to read
        #[arg(default_value_t = 256)]
        size: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("burrow=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Versions { layouts } => commands::versions::run(&layouts),
        Commands::Dump { layouts, name } => commands::dump::run(&layouts, &name),
        Commands::Export {
            layouts,
            name,
            output,
        } => commands::export::run(&layouts, &name, output.as_deref()),
        Commands::Status { pid, layouts } => commands::status::run(pid, layouts.as_deref()),
        Commands::Hexdump { pid, address, size } => commands::hexdump::run(pid, &address, size),
    }
}
