//! `conductor init` command — generate a default TOML configuration file.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use conductor::config::generate_default_config;

/// Failures of the `init` command.
#[derive(Debug, Error)]
pub enum InitError {
    /// The target exists and `--force` was not given.
    #[error("'{}' already exists, use --force to overwrite", .0.display())]
    Exists(PathBuf),

    /// Writing the file failed.
    #[error("failed to write '{}': {source}", path.display())]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Execute the `init` command.
///
/// Writes a default TOML configuration template to `output`. Refuses to
/// overwrite an existing file unless `force` is `true`.
///
/// # Errors
///
/// Returns an error if the file already exists (without `--force`) or if
/// writing fails.
#[allow(clippy::print_stderr)]
pub fn run(output: &Path, force: bool) -> Result<(), InitError> {
    if output.exists() && !force {
        return Err(InitError::Exists(output.to_owned()));
    }

    fs::write(output, generate_default_config()).map_err(|source| InitError::Write {
        path: output.to_owned(),
        source,
    })?;

    eprintln!("Config file written to {}", output.display());
    Ok(())
}
