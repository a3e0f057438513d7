//! Error types for the lifecycle engine.
//!
//! Every failure observed while running or stopping servers is carried as an
//! [`Error`] value and funneled into a single [`Errors`] aggregate. The
//! aggregate keeps the full history in the order the failures were observed;
//! its [`Display`](std::fmt::Display) output puts the most recent failure
//! first, followed by the earlier ones.

use std::fmt;

use thiserror::Error;

use crate::server::BoxError;

/// A single lifecycle failure.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine-level before hook failed; no server was started.
    #[error("engine '{engine}': before hook: {source}")]
    BeforeHook {
        /// Engine name.
        engine: String,
        /// Underlying hook error.
        #[source]
        source: BoxError,
    },

    /// A server's before-run hook failed; its `run` was skipped.
    #[error("server '{server}': before run: {source}")]
    BeforeRun {
        /// Server name.
        server: String,
        /// Underlying hook error.
        #[source]
        source: BoxError,
    },

    /// A server's `run` returned an error.
    #[error("server '{server}': run: {source}")]
    Run {
        /// Server name.
        server: String,
        /// Underlying run error.
        #[source]
        source: BoxError,
    },

    /// A server's after-stop hook failed.
    #[error("server '{server}': after stop: {source}")]
    AfterStop {
        /// Server name.
        server: String,
        /// Underlying hook error.
        #[source]
        source: BoxError,
    },

    /// A server's before-shutdown hook failed.
    #[error("server '{server}': before shutdown: {source}")]
    BeforeShutdown {
        /// Server name.
        server: String,
        /// Underlying hook error.
        #[source]
        source: BoxError,
    },

    /// A server's `shutdown` returned an error.
    #[error("server '{server}': shutdown: {source}")]
    Shutdown {
        /// Server name.
        server: String,
        /// Underlying shutdown error.
        #[source]
        source: BoxError,
    },

    /// The engine-level after hook failed.
    #[error("engine '{engine}': after hook: {source}")]
    AfterHook {
        /// Engine name.
        engine: String,
        /// Underlying hook error.
        #[source]
        source: BoxError,
    },

    /// `run` was called on an engine that has already been started.
    #[error("engine '{0}': already running")]
    AlreadyRunning(String),

    /// Registering an OS shutdown signal failed.
    #[error("engine '{engine}': signal registration: {source}")]
    Signal {
        /// Engine name.
        engine: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Name of the server the failure belongs to, if it is server-scoped.
    #[must_use]
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::BeforeRun { server, .. }
            | Self::Run { server, .. }
            | Self::AfterStop { server, .. }
            | Self::BeforeShutdown { server, .. }
            | Self::Shutdown { server, .. } => Some(server),
            Self::BeforeHook { .. }
            | Self::AfterHook { .. }
            | Self::AlreadyRunning(_)
            | Self::Signal { .. } => None,
        }
    }
}

/// Aggregate of every [`Error`] observed across one engine run.
///
/// An `Errors` value is never empty when returned from the engine: a run with
/// zero failures yields `Ok(())` instead.
///
/// [`source`](std::error::Error::source) yields only the most recent failure
/// and then that failure's own cause. Walk the full history with
/// [`iter`](Self::iter) (oldest first) or `iter().rev()` (newest first).
#[derive(Debug, Default)]
pub struct Errors {
    errors: Vec<Error>,
}

impl Errors {
    pub(crate) const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub(crate) fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    pub(crate) fn extend(&mut self, other: Self) {
        self.errors.extend(other.errors);
    }

    /// Returns `Ok(())` when nothing was recorded, `Err(self)` otherwise.
    pub(crate) fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Number of recorded failures.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether no failure was recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterates failures in the order they were observed, oldest first.
    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.errors.iter()
    }

    /// The most recently observed failure.
    #[must_use]
    pub fn latest(&self) -> Option<&Error> {
        self.errors.last()
    }

    /// Consumes the aggregate, returning failures oldest first.
    #[must_use]
    pub fn into_vec(self) -> Vec<Error> {
        self.errors
    }
}

impl From<Error> for Errors {
    fn from(error: Error) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl IntoIterator for Errors {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a Errors {
    type Item = &'a Error;
    type IntoIter = std::slice::Iter<'a, Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().rev().enumerate() {
            if i > 0 {
                f.write_str(": ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.latest().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
