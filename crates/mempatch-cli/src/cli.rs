use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mempatch", about = "Runtime binary patching manager", version)]
pub struct Args {
    /// Settings file (created on first save if missing)
    #[arg(long, default_value = "mempatch.json")]
    pub settings: PathBuf,

    /// Control-channel port override
    #[arg(long)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Launch the configured target with the core injected and drive it
    Launch {
        /// Hook definition files (JSON)
        #[arg(long = "hook", value_name = "FILE")]
        hooks: Vec<PathBuf>,

        /// Patch pack definition files (JSON)
        #[arg(long = "pack", value_name = "FILE")]
        packs: Vec<PathBuf>,
    },

    /// Wait for an already-injected core to connect, then drive it
    Serve {
        /// Hook definition files (JSON)
        #[arg(long = "hook", value_name = "FILE")]
        hooks: Vec<PathBuf>,

        /// Patch pack definition files (JSON)
        #[arg(long = "pack", value_name = "FILE")]
        packs: Vec<PathBuf>,

        /// Seconds to wait for the core before giving up
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}
