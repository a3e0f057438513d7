//! OS signal handling for signal-triggered shutdown.
//!
//! [`SignalListener`] registers a configurable set of [`ShutdownSignal`]s
//! (SIGINT/SIGTERM/... on Unix, Ctrl+C on Windows) and resolves once the first
//! one is delivered. Watchers are tracked on a [`TaskTracker`] and stop when
//! the listener is closed or dropped.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use serde::Deserialize;
use thiserror::Error;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// OS signals that can trigger engine shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ShutdownSignal {
    /// `SIGINT` / Ctrl+C.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
    /// `SIGHUP`.
    Hangup,
    /// `SIGQUIT`.
    Quit,
    /// `SIGUSR1`.
    User1,
    /// `SIGUSR2`.
    User2,
}

impl ShutdownSignal {
    /// Conventional name, e.g. `"SIGTERM"`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
            Self::User1 => "SIGUSR1",
            Self::User2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    const fn kind(self) -> SignalKind {
        match self {
            Self::Interrupt => SignalKind::interrupt(),
            Self::Terminate => SignalKind::terminate(),
            Self::Hangup => SignalKind::hangup(),
            Self::Quit => SignalKind::quit(),
            Self::User1 => SignalKind::user_defined1(),
            Self::User2 => SignalKind::user_defined2(),
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a signal name is not recognised.
#[derive(Debug, Error)]
#[error("unknown shutdown signal '{0}'")]
pub struct UnknownSignal(pub String);

impl FromStr for ShutdownSignal {
    type Err = UnknownSignal;

    /// Accepts `SIGTERM`, `TERM` or `terminate`, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "INT" | "INTERRUPT" => Ok(Self::Interrupt),
            "TERM" | "TERMINATE" => Ok(Self::Terminate),
            "HUP" | "HANGUP" => Ok(Self::Hangup),
            "QUIT" => Ok(Self::Quit),
            "USR1" | "USER1" => Ok(Self::User1),
            "USR2" | "USER2" => Ok(Self::User2),
            _ => Err(UnknownSignal(s.to_owned())),
        }
    }
}

impl TryFrom<String> for ShutdownSignal {
    type Error = UnknownSignal;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Waits for the first delivery of any configured shutdown signal.
#[allow(missing_debug_implementations)]
pub struct SignalListener {
    task_tracker: TaskTracker,
    received: CancellationToken,
    stop: CancellationToken,
    first: Arc<OnceLock<ShutdownSignal>>,
}

impl SignalListener {
    /// Registers every signal in `signals` and spawns one watcher per signal.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an [`std::io::Error`] if signal registration fails.
    #[allow(clippy::unnecessary_wraps)]
    pub fn try_new(signals: &[ShutdownSignal]) -> Result<Self, std::io::Error> {
        let task_tracker = TaskTracker::new();
        let received = CancellationToken::new();
        let stop = CancellationToken::new();
        let first = Arc::new(OnceLock::new());

        let mut unique = signals.to_vec();
        unique.sort_by_key(|s| s.as_str());
        unique.dedup();

        for sig in unique {
            #[cfg(unix)]
            {
                let mut stream = signal(sig.kind())?;
                let received = received.clone();
                let stop = stop.clone();
                let first = Arc::clone(&first);
                task_tracker.spawn(async move {
                    tokio::select! {
                        _ = stream.recv() => {
                            let _ = first.set(sig);
                            received.cancel();
                        }
                        () = stop.cancelled() => {}
                    }
                });
            }

            #[cfg(not(unix))]
            {
                if sig != ShutdownSignal::Interrupt {
                    tracing::warn!(
                        signal = %sig,
                        "signal not supported on this platform, ignoring"
                    );
                    continue;
                }
                let received = received.clone();
                let stop = stop.clone();
                let first = Arc::clone(&first);
                task_tracker.spawn(async move {
                    tokio::select! {
                        result = tokio::signal::ctrl_c() => {
                            if result.is_ok() {
                                let _ = first.set(sig);
                                received.cancel();
                            }
                        }
                        () = stop.cancelled() => {}
                    }
                });
            }
        }

        task_tracker.close();
        Ok(Self {
            task_tracker,
            received,
            stop,
            first,
        })
    }

    /// Resolves with the first signal received, or `None` once the listener
    /// has been closed without any signal arriving.
    pub async fn recv(&self) -> Option<ShutdownSignal> {
        tokio::select! {
            biased;
            () = self.received.cancelled() => self.first.get().copied(),
            () = self.stop.cancelled() => None,
        }
    }

    /// Stops every watcher and waits for them to exit.
    pub async fn close(&self) {
        self.stop.cancel();
        self.task_tracker.wait().await;
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
