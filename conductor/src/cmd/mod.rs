//! CLI definitions and command implementations.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod init;
pub mod serve;

/// Conductor — run several network servers under one lifecycle engine.
#[derive(Debug, Parser)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate a default TOML configuration file.
    Init {
        /// Output path for the configuration file.
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite the file if it already exists.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Start every configured server and wait for shutdown.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(short, long, env = "CONFIG", default_value = "config.toml")]
        config: PathBuf,
    },
}
