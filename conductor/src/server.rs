//! The [`Server`] contract and lifecycle hooks.
//!
//! A server is any independently runnable unit of service logic: an HTTP
//! listener, an RPC endpoint, a queue consumer. The [`Engine`] drives every
//! registered server through the same lifecycle:
//!
//! ```text
//! before_run_hook -> run -> after_stop_hook        (concurrently, per server)
//! before_shutdown_hook -> shutdown                 (sequentially, in registration order)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::engine::Engine;

/// Boxed error type returned by servers and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pinned, boxed, `Send` future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback bound to a per-server lifecycle transition.
///
/// Receives a handle to the running [`Engine`] and the server it is attached to.
pub type Hook =
    Arc<dyn Fn(Engine, Arc<dyn Server>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Callback run by the engine itself, before any server starts or after all
/// of them stopped.
pub type EngineHook = Arc<dyn Fn(Engine) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Wraps an async closure into a [`Hook`].
///
/// ```
/// use conductor::server::hook;
///
/// let before_run = hook(|_engine, server| async move {
///     tracing::info!(server = server.name(), "warming caches");
///     Ok(())
/// });
/// # let _ = before_run;
/// ```
pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn(Engine, Arc<dyn Server>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |engine, server| Box::pin(f(engine, server)))
}

/// Wraps an async closure into an [`EngineHook`].
pub fn engine_hook<F, Fut>(f: F) -> EngineHook
where
    F: Fn(Engine) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |engine| Box::pin(f(engine)))
}

/// A runnable service managed by the [`Engine`].
///
/// Implementations own their internal resources and must be safe to share
/// across tasks: `run` and `shutdown` are called concurrently from different
/// tasks.
pub trait Server: Send + Sync + 'static {
    /// Stable identifier used in diagnostics and error messages.
    fn name(&self) -> &str;

    /// Hook invoked before `run`. A failure skips `run` and `after_stop_hook`.
    fn before_run_hook(&self) -> Option<Hook> {
        None
    }

    /// Hook invoked right before `shutdown`. A failure does not prevent `shutdown`.
    fn before_shutdown_hook(&self) -> Option<Hook> {
        None
    }

    /// Hook invoked after `run` returns, whether it failed or not.
    fn after_stop_hook(&self) -> Option<Hook> {
        None
    }

    /// Runs the server until it stops on its own or `shutdown` is called.
    ///
    /// Must return promptly once `shutdown` has been invoked.
    fn run(&self) -> BoxFuture<'_, Result<(), BoxError>>;

    /// Requests graceful termination.
    ///
    /// Must be safe to call before `run` started or after it returned, and
    /// must not block indefinitely.
    fn shutdown(&self) -> BoxFuture<'_, Result<(), BoxError>>;
}

/// Invokes an optional hook on its own task; absence is a no-op.
///
/// A panicking hook is reported as a failure of that hook.
pub(crate) async fn invoke(
    hook: Option<Hook>,
    engine: &Engine,
    server: &Arc<dyn Server>,
) -> Result<(), BoxError> {
    let Some(hook) = hook else {
        return Ok(());
    };
    let (engine, server) = (engine.clone(), Arc::clone(server));
    tokio::spawn(async move { hook(engine, server).await })
        .await
        .unwrap_or_else(|join_error| Err(join_error.into()))
}

/// Invokes an engine-level hook on its own task, like [`invoke`].
pub(crate) async fn invoke_engine_hook(hook: &EngineHook, engine: &Engine) -> Result<(), BoxError> {
    let (hook, engine) = (Arc::clone(hook), engine.clone());
    tokio::spawn(async move { hook(engine).await })
        .await
        .unwrap_or_else(|join_error| Err(join_error.into()))
}
