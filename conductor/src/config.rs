//! Configuration loading and default template generation.
//!
//! # Configuration File Format
//!
//! ```toml
//! name = "conductor"
//! console = true
//! shutdown_signals = ["SIGINT", "SIGTERM"]
//! shutdown_delay_ms = 0
//!
//! [[http]]
//! name = "api"
//! addr = "0.0.0.0:8080"
//! shutdown_timeout_ms = 5000
//! ```
//!
//! Address strings may reference environment variables: `"$ADDR"` or `"${ADDR}"`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::engine::{Engine, EngineBuilder};
use crate::http::{DEFAULT_SHUTDOWN_TIMEOUT, HttpServer};
use crate::signal::ShutdownSignal;

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be resolved or read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse TOML config '{}': {source}", path.display())]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A `$VAR` reference points to an unset variable.
    #[error("env var '{var}' not found (referenced as '{value}')")]
    MissingEnv {
        /// Variable name.
        var: String,
        /// Original reference.
        value: String,
    },

    /// An HTTP server address is not a valid socket address.
    #[error("http server '{server}': invalid address '{addr}': {source}")]
    Addr {
        /// Server name.
        server: String,
        /// Resolved address string.
        addr: String,
        /// Underlying parse error.
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConductorConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_console")]
    console: bool,
    #[serde(default = "default_signals")]
    shutdown_signals: Vec<ShutdownSignal>,
    #[serde(default)]
    shutdown_delay_ms: u64,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    http: Vec<HttpConfig>,
}

/// One `[[http]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    name: String,
    addr: String,
    #[serde(default = "default_shutdown_timeout_ms")]
    shutdown_timeout_ms: u64,
    #[serde(default)]
    request_timeout_ms: Option<u64>,
}

fn default_name() -> String {
    env!("CARGO_PKG_NAME").to_owned()
}

const fn default_console() -> bool {
    true
}

fn default_signals() -> Vec<ShutdownSignal> {
    vec![ShutdownSignal::Interrupt, ShutdownSignal::Terminate]
}

#[allow(clippy::cast_possible_truncation)]
const fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            console: default_console(),
            shutdown_signals: default_signals(),
            shutdown_delay_ms: 0,
            log_level: None,
            http: Vec::new(),
        }
    }
}

impl ConductorConfig {
    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns the TOML error if the content does not match the schema.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Engine name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether progress output is enabled.
    #[must_use]
    pub const fn console(&self) -> bool {
        self.console
    }

    /// Signals that trigger shutdown.
    #[must_use]
    pub fn shutdown_signals(&self) -> &[ShutdownSignal] {
        &self.shutdown_signals
    }

    /// Delay between signal receipt and shutdown.
    #[must_use]
    pub const fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }

    /// Log level used when `RUST_LOG` is unset.
    #[must_use]
    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }

    /// Configured HTTP servers.
    #[must_use]
    pub fn http(&self) -> &[HttpConfig] {
        &self.http
    }

    /// Starts an [`EngineBuilder`] carrying the engine-level settings.
    #[must_use]
    pub fn engine_builder(&self) -> EngineBuilder {
        Engine::builder(self.name.clone())
            .with_console(self.console)
            .with_signals(self.shutdown_signals.iter().copied())
            .with_shutdown_delay(self.shutdown_delay())
    }

    /// Builds every configured HTTP server, in file order.
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be resolved or parsed.
    pub fn http_servers(&self) -> Result<Vec<HttpServer>, ConfigError> {
        self.http.iter().map(HttpConfig::build).collect()
    }
}

impl HttpConfig {
    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves environment references and parses the bind address.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced variable is unset or the address is
    /// malformed.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = resolve_env(&self.addr)?;
        addr.parse().map_err(|source| ConfigError::Addr {
            server: self.name.clone(),
            addr,
            source,
        })
    }

    /// Time allowed for draining connections on shutdown.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Builds the configured [`HttpServer`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn build(&self) -> Result<HttpServer, ConfigError> {
        let server = HttpServer::new(self.name.clone(), self.socket_addr()?)
            .with_shutdown_timeout(self.shutdown_timeout());
        Ok(match self.request_timeout_ms {
            Some(ms) => server.with_request_timeout(Duration::from_millis(ms)),
            None => server,
        })
    }
}

/// Resolve an environment-variable reference (`$VAR` or `${VAR}`), returning
/// the literal string unchanged if it does not match either pattern.
fn resolve_env(value: &str) -> Result<String, ConfigError> {
    let var_name = if let Some(inner) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}'))
    {
        inner
    } else if let Some(inner) = value.strip_prefix('$')
        && !inner.is_empty()
        && inner.chars().all(|c| c.is_alphanumeric() || c == '_')
    {
        inner
    } else {
        return Ok(value.to_owned());
    };
    std::env::var(var_name).map_err(|_| ConfigError::MissingEnv {
        var: var_name.to_owned(),
        value: value.to_owned(),
    })
}

/// Load configuration from a TOML file at the given path.
///
/// # Errors
///
/// Returns an error if the file cannot be resolved, read, or parsed.
pub fn load_config(path: &Path) -> Result<ConductorConfig, ConfigError> {
    let read_error = |source| ConfigError::Read {
        path: path.to_owned(),
        source,
    };
    let config_path = path.canonicalize().map_err(read_error)?;
    let content = std::fs::read_to_string(&config_path).map_err(read_error)?;
    ConductorConfig::from_toml(&content).map_err(|source| ConfigError::Parse {
        path: config_path,
        source,
    })
}

/// Generate a default TOML configuration template.
#[must_use]
pub fn generate_default_config() -> String {
    String::from(
        r#"# Conductor configuration

# Engine name, used as a prefix in diagnostics.
name = "conductor"

# Emit progress lines (boot, server start, signals, shutdown, stop).
console = true

# OS signals that trigger a graceful shutdown.
# Accepted: SIGINT, SIGTERM, SIGHUP, SIGQUIT, SIGUSR1, SIGUSR2.
shutdown_signals = ["SIGINT", "SIGTERM"]

# Milliseconds to wait after a signal before shutting down,
# e.g. to let a load balancer stop routing traffic.
shutdown_delay_ms = 0

# Log level used when RUST_LOG is not set.
# log_level = "info"

# ── HTTP servers ─────────────────────────────────────────────────────
# Addresses support environment variable references: "$VAR" or "${VAR}".

[[http]]
name = "api"
addr = "0.0.0.0:8080"
shutdown_timeout_ms = 5000
# request_timeout_ms = 30000
"#,
    )
}
