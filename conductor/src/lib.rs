//! Lifecycle orchestration for multi-server processes.
//!
//! An [`Engine`] runs a set of independently implemented [`Server`]s inside
//! one process. Every server starts concurrently; the first failure, an OS
//! signal, or every server returning on its own triggers a single shutdown
//! pass that stops the servers one by one in registration order. All
//! failures are collected into one [`Errors`] value returned from
//! [`Engine::run`].
//!
//! ```no_run
//! use conductor::{BoxError, BoxFuture, Engine, Server, ShutdownSignal};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Ticker {
//!     stop: CancellationToken,
//! }
//!
//! impl Server for Ticker {
//!     fn name(&self) -> &str {
//!         "ticker"
//!     }
//!
//!     fn run(&self) -> BoxFuture<'_, Result<(), BoxError>> {
//!         Box::pin(async move {
//!             self.stop.cancelled().await;
//!             Ok(())
//!         })
//!     }
//!
//!     fn shutdown(&self) -> BoxFuture<'_, Result<(), BoxError>> {
//!         Box::pin(async move {
//!             self.stop.cancel();
//!             Ok(())
//!         })
//!     }
//! }
//!
//! # async fn example() -> Result<(), conductor::Errors> {
//! Engine::builder("example")
//!     .with_server(Ticker { stop: CancellationToken::new() })
//!     .with_signals([ShutdownSignal::Interrupt, ShutdownSignal::Terminate])
//!     .with_console(true)
//!     .build()
//!     .run()
//!     .await
//! # }
//! ```

pub mod config;
mod coordinator;
pub mod engine;
pub mod error;
pub mod http;
pub mod server;
pub mod signal;
pub mod telemetry;

pub use engine::{Engine, EngineBuilder, ShutdownHandler};
pub use error::{Error, Errors};
pub use server::{BoxError, BoxFuture, EngineHook, Hook, Server, engine_hook, hook};
pub use signal::ShutdownSignal;
