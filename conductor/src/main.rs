//! Conductor
//!
//! Runs the HTTP servers described in a TOML file under one lifecycle
//! engine, with signal-triggered graceful shutdown.
//!
//! ```sh
//! conductor init            # Generate default config.toml
//! conductor serve           # Start the configured servers
//! ```

mod cmd;

use clap::Parser;
use cmd::{Cli, Commands};

#[tokio::main]
#[allow(clippy::print_stderr)]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { output, force } => cmd::init::run(&output, force).map_err(Into::into),
        Commands::Serve { config } => cmd::serve::run(&config).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
