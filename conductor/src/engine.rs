//! The lifecycle [`Engine`].
//!
//! [`Engine::run`] starts every registered server concurrently, listens for
//! the configured OS signals, and blocks until all servers stopped and the
//! shutdown sequence completed. Shutdown is reachable from three triggers
//! (a failing server, an OS signal, every server returning on its own) plus
//! explicit calls to [`Engine::shutdown`]; its body runs exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::coordinator::ShutdownCoordinator;
use crate::error::{Error, Errors};
use crate::server::{EngineHook, Server, invoke, invoke_engine_hook};
use crate::signal::{ShutdownSignal, SignalListener};

/// Progress output, emitted only when the engine runs with `console` enabled.
macro_rules! console {
    ($engine:expr, $($arg:tt)+) => {
        if $engine.inner.console {
            tracing::info!($($arg)+);
        }
    };
}

/// Callback receiving the shutdown sequence's aggregate, `None` if it was clean.
pub type ShutdownHandler = Arc<dyn Fn(Option<&Errors>) + Send + Sync>;

/// Who entered the shutdown sequence; decides where its errors are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// [`Engine::shutdown`] called by user code: errors go back to the caller.
    External,
    /// Entered by `run` itself or the signal watcher: errors go to `run`.
    Internal,
}

struct Inner {
    name: String,
    servers: Vec<Arc<dyn Server>>,
    signals: Vec<ShutdownSignal>,
    shutdown_handler: Option<ShutdownHandler>,
    before_hook: Option<EngineHook>,
    after_hook: Option<EngineHook>,
    console: bool,
    shutdown_delay: Duration,
    started: AtomicBool,
    coordinator: ShutdownCoordinator,
    shutdown_errors: Mutex<Option<Errors>>,
}

/// Orchestrates startup and shutdown of a set of [`Server`]s.
///
/// `Engine` is a cheap handle; clones refer to the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Starts building an engine named `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> EngineBuilder {
        EngineBuilder::new(name)
    }

    /// Engine name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registered servers, in registration order.
    #[must_use]
    pub fn servers(&self) -> &[Arc<dyn Server>] {
        &self.inner.servers
    }

    /// Whether the shutdown sequence has been entered.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.coordinator.is_shutting_down()
    }

    /// Waits until the shutdown sequence has finished.
    pub async fn wait_stopped(&self) {
        self.inner.coordinator.wait().await;
    }

    /// Runs every registered server until all of them stopped and shutdown
    /// completed.
    ///
    /// An engine runs at most once; any further call is rejected.
    ///
    /// # Errors
    ///
    /// Returns every failure observed across all phases: the engine hooks,
    /// each server's hooks, `run` and `shutdown` calls, and signal
    /// registration. Returns [`Error::AlreadyRunning`] if the engine was
    /// already started.
    pub async fn run(&self) -> Result<(), Errors> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning(self.inner.name.clone()).into());
        }

        console!(self, engine = %self.inner.name, pid = std::process::id(), "engine boot");
        let result = self.run_servers().await;
        // Early exits never entered the shutdown sequence; mark the engine stopped.
        if self.inner.coordinator.try_begin() {
            self.inner.coordinator.complete();
        }
        console!(self, engine = %self.inner.name, "engine stopped, bye!");
        result
    }

    async fn run_servers(&self) -> Result<(), Errors> {
        let inner = &self.inner;

        let listener = if inner.signals.is_empty() {
            None
        } else {
            let listener = SignalListener::try_new(&inner.signals).map_err(|source| {
                Error::Signal {
                    engine: inner.name.clone(),
                    source,
                }
            })?;
            Some(Arc::new(listener))
        };

        if let Some(hook) = &inner.before_hook {
            console!(self, engine = %inner.name, "running engine before hook");
            invoke_engine_hook(hook, self).await.map_err(|source| Error::BeforeHook {
                engine: inner.name.clone(),
                source,
            })?;
        }

        let tracker = TaskTracker::new();
        let (tx, mut rx) = mpsc::channel(inner.servers.len().max(1));
        for server in &inner.servers {
            let engine = self.clone();
            let server = Arc::clone(server);
            let tx = tx.clone();
            tracker.spawn(async move {
                let result = engine.supervise(server).await;
                let _ = tx.send(result).await;
            });
        }
        tracker.close();
        drop(tx);

        let watcher = listener.as_ref().map(|listener| {
            let engine = self.clone();
            let listener = Arc::clone(listener);
            tokio::spawn(async move { engine.watch_signals(&listener).await })
        });

        let mut errors = Errors::new();
        for _ in 0..inner.servers.len() {
            match rx.recv().await {
                Some(Ok(())) => {}
                Some(Err(server_errors)) => {
                    errors.extend(server_errors);
                    let _ = self.shutdown_sequence(Trigger::Internal).await;
                }
                None => break,
            }
        }

        let _ = self.shutdown_sequence(Trigger::Internal).await;
        inner.coordinator.wait().await;
        tracker.wait().await;

        if let Some(listener) = listener {
            listener.close().await;
        }
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        let shutdown_errors = inner
            .shutdown_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(shutdown_errors) = shutdown_errors {
            errors.extend(shutdown_errors);
        }

        if let Some(hook) = &inner.after_hook {
            console!(self, engine = %inner.name, "running engine after hook");
            if let Err(source) = invoke_engine_hook(hook, self).await {
                tracing::warn!(engine = %inner.name, error = %source, "engine after hook failed");
                errors.push(Error::AfterHook {
                    engine: inner.name.clone(),
                    source,
                });
            }
        }

        errors.into_result()
    }

    /// Drives one server through `before_run -> run -> after_stop`.
    async fn supervise(&self, server: Arc<dyn Server>) -> Result<(), Errors> {
        let name = server.name().to_owned();

        let before_run = server.before_run_hook();
        if before_run.is_some() {
            console!(self, server = %name, "running before-run hook");
        }
        if let Err(source) = invoke(before_run, self, &server).await {
            tracing::warn!(
                server = %name,
                error = %source,
                "before-run hook failed, server not started"
            );
            return Err(Error::BeforeRun {
                server: name,
                source,
            }
            .into());
        }

        let mut errors = Errors::new();

        console!(self, server = %name, "server start");
        let runner = Arc::clone(&server);
        let outcome = tokio::spawn(async move { runner.run().await }).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                tracing::warn!(server = %name, error = %source, "server run failed");
                errors.push(Error::Run {
                    server: name.clone(),
                    source,
                });
            }
            Err(join_error) => {
                tracing::error!(server = %name, error = %join_error, "server run aborted");
                errors.push(Error::Run {
                    server: name.clone(),
                    source: Box::new(join_error),
                });
            }
        }

        let after_stop = server.after_stop_hook();
        if after_stop.is_some() {
            console!(self, server = %name, "running after-stop hook");
        }
        if let Err(source) = invoke(after_stop, self, &server).await {
            tracing::warn!(server = %name, error = %source, "after-stop hook failed");
            errors.push(Error::AfterStop {
                server: name.clone(),
                source,
            });
        }

        console!(self, server = %name, "server stopped");
        errors.into_result()
    }

    /// Turns the first received signal into a shutdown, then exits.
    async fn watch_signals(&self, listener: &SignalListener) {
        let signals: Vec<_> = self.inner.signals.iter().map(|s| s.as_str()).collect();
        console!(self, engine = %self.inner.name, ?signals, "listening for shutdown signals");

        let Some(signal) = listener.recv().await else {
            return;
        };
        console!(self, engine = %self.inner.name, %signal, "received shutdown signal");

        let delay = self.inner.shutdown_delay;
        if !delay.is_zero() {
            console!(self, engine = %self.inner.name, ?delay, "delaying shutdown");
            tokio::time::sleep(delay).await;
        }
        let _ = self.shutdown_sequence(Trigger::Internal).await;
    }

    /// Stops every server in registration order.
    ///
    /// Only the first call runs the shutdown sequence; later calls return
    /// `Ok(())` immediately. If the engine is running, its `run` call
    /// returns once every server stopped.
    ///
    /// # Errors
    ///
    /// Returns every before-shutdown hook and `shutdown` failure observed by
    /// the call that performed the sequence.
    pub async fn shutdown(&self) -> Result<(), Errors> {
        self.shutdown_sequence(Trigger::External).await
    }

    async fn shutdown_sequence(&self, trigger: Trigger) -> Result<(), Errors> {
        let inner = &self.inner;
        if !inner.coordinator.try_begin() {
            return Ok(());
        }

        let mut errors = Errors::new();
        for server in &inner.servers {
            let name = server.name();

            let before_shutdown = server.before_shutdown_hook();
            if before_shutdown.is_some() {
                console!(self, server = %name, "running before-shutdown hook");
            }
            if let Err(source) = invoke(before_shutdown, self, server).await {
                tracing::warn!(server = %name, error = %source, "before-shutdown hook failed");
                errors.push(Error::BeforeShutdown {
                    server: name.to_owned(),
                    source,
                });
            }

            console!(self, server = %name, "shutting down");
            let stopper = Arc::clone(server);
            let outcome = tokio::spawn(async move { stopper.shutdown().await })
                .await
                .unwrap_or_else(|join_error| Err(join_error.into()));
            if let Err(source) = outcome {
                tracing::warn!(server = %name, error = %source, "server shutdown failed");
                errors.push(Error::Shutdown {
                    server: name.to_owned(),
                    source,
                });
            }
        }

        if let Some(handler) = &inner.shutdown_handler {
            handler((!errors.is_empty()).then_some(&errors));
        }

        let result = match trigger {
            Trigger::External => errors.into_result(),
            Trigger::Internal => {
                if !errors.is_empty() {
                    *inner
                        .shutdown_errors
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(errors);
                }
                Ok(())
            }
        };

        inner.coordinator.complete();
        result
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let servers: Vec<_> = self.inner.servers.iter().map(|s| s.name()).collect();
        f.debug_struct("Engine")
            .field("name", &self.inner.name)
            .field("servers", &servers)
            .field("signals", &self.inner.signals)
            .field("console", &self.inner.console)
            .field("shutdown_delay", &self.inner.shutdown_delay)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`].
#[allow(missing_debug_implementations)]
pub struct EngineBuilder {
    name: String,
    servers: Vec<Arc<dyn Server>>,
    signals: Vec<ShutdownSignal>,
    shutdown_handler: Option<ShutdownHandler>,
    before_hook: Option<EngineHook>,
    after_hook: Option<EngineHook>,
    console: bool,
    shutdown_delay: Duration,
}

impl EngineBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: Vec::new(),
            signals: Vec::new(),
            shutdown_handler: None,
            before_hook: None,
            after_hook: None,
            console: false,
            shutdown_delay: Duration::ZERO,
        }
    }

    /// Registers a server.
    #[must_use]
    pub fn with_server(self, server: impl Server) -> Self {
        self.with_shared_server(Arc::new(server))
    }

    /// Registers a server the caller keeps a handle to.
    #[must_use]
    pub fn with_shared_server<S: Server>(mut self, server: Arc<S>) -> Self {
        self.servers.push(server);
        self
    }

    /// Registers already type-erased servers.
    #[must_use]
    pub fn with_servers(mut self, servers: impl IntoIterator<Item = Arc<dyn Server>>) -> Self {
        self.servers.extend(servers);
        self
    }

    /// Sets the OS signals that trigger shutdown. An empty set disables
    /// signal handling.
    #[must_use]
    pub fn with_signals(mut self, signals: impl IntoIterator<Item = ShutdownSignal>) -> Self {
        self.signals = signals.into_iter().collect();
        self
    }

    /// Sets a callback invoked once with the shutdown sequence's errors.
    #[must_use]
    pub fn with_shutdown_handler(
        mut self,
        handler: impl Fn(Option<&Errors>) + Send + Sync + 'static,
    ) -> Self {
        self.shutdown_handler = Some(Arc::new(handler));
        self
    }

    /// Sets a hook run before any server starts. Its failure aborts `run`.
    #[must_use]
    pub fn with_before_hook(mut self, hook: EngineHook) -> Self {
        self.before_hook = Some(hook);
        self
    }

    /// Sets a hook run after shutdown completed.
    #[must_use]
    pub fn with_after_hook(mut self, hook: EngineHook) -> Self {
        self.after_hook = Some(hook);
        self
    }

    /// Enables progress output through `tracing`.
    #[must_use]
    pub const fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    /// Sets how long to wait between receiving a signal and shutting down.
    #[must_use]
    pub const fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(Inner {
                name: self.name,
                servers: self.servers,
                signals: self.signals,
                shutdown_handler: self.shutdown_handler,
                before_hook: self.before_hook,
                after_hook: self.after_hook,
                console: self.console,
                shutdown_delay: self.shutdown_delay,
                started: AtomicBool::new(false),
                coordinator: ShutdownCoordinator::new(),
                shutdown_errors: Mutex::new(None),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::server::{BoxError, BoxFuture, Hook, engine_hook, hook};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn record(&self, event: String) {
            self.0.lock().expect("journal poisoned").push(event);
        }

        fn events(&self) -> Vec<String> {
            self.0.lock().expect("journal poisoned").clone()
        }

        fn count(&self, event: &str) -> usize {
            self.events().iter().filter(|e| *e == event).count()
        }

        fn contains(&self, event: &str) -> bool {
            self.count(event) > 0
        }

        async fn wait_for(&self, event: &str) {
            tokio::time::timeout(TIMEOUT, async {
                while !self.contains(event) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {event}"));
        }
    }

    struct TestServer {
        name: &'static str,
        journal: Journal,
        stop: CancellationToken,
        blocks: bool,
        failing: HashSet<&'static str>,
    }

    impl TestServer {
        fn new(name: &'static str, journal: &Journal) -> Self {
            Self {
                name,
                journal: journal.clone(),
                stop: CancellationToken::new(),
                blocks: true,
                failing: HashSet::new(),
            }
        }

        fn returning(mut self) -> Self {
            self.blocks = false;
            self
        }

        fn failing(mut self, phase: &'static str) -> Self {
            self.failing.insert(phase);
            self
        }

        fn step(&self, phase: &'static str) -> Result<(), BoxError> {
            step(&self.journal, self.name, phase, self.failing.contains(phase))
        }

        fn recording_hook(&self, phase: &'static str) -> Hook {
            let journal = self.journal.clone();
            let name = self.name;
            let fails = self.failing.contains(phase);
            hook(move |_engine, _server| {
                let journal = journal.clone();
                async move { step(&journal, name, phase, fails) }
            })
        }
    }

    fn step(journal: &Journal, name: &str, phase: &str, fails: bool) -> Result<(), BoxError> {
        journal.record(format!("{name}:{phase}"));
        if fails {
            Err(format!("{name} {phase} failed").into())
        } else {
            Ok(())
        }
    }

    impl Server for TestServer {
        fn name(&self) -> &str {
            self.name
        }

        fn before_run_hook(&self) -> Option<Hook> {
            Some(self.recording_hook("before_run"))
        }

        fn before_shutdown_hook(&self) -> Option<Hook> {
            Some(self.recording_hook("before_shutdown"))
        }

        fn after_stop_hook(&self) -> Option<Hook> {
            Some(self.recording_hook("after_stop"))
        }

        fn run(&self) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async move {
                self.step("run")?;
                if self.blocks {
                    self.stop.cancelled().await;
                }
                Ok(())
            })
        }

        fn shutdown(&self) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async move {
                self.stop.cancel();
                self.step("shutdown")
            })
        }
    }

    fn spawn_run(engine: &Engine) -> tokio::task::JoinHandle<Result<(), Errors>> {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    }

    async fn join(handle: tokio::task::JoinHandle<Result<(), Errors>>) -> Result<(), Errors> {
        tokio::time::timeout(TIMEOUT, handle)
            .await
            .expect("run did not return")
            .expect("run panicked")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_shutdown_runs_sequence_once() {
        let journal = Journal::default();
        let handled = Arc::new(AtomicUsize::new(0));
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal))
            .with_shutdown_handler({
                let handled = Arc::clone(&handled);
                move |_| {
                    handled.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build();

        let run = spawn_run(&engine);
        journal.wait_for("a:run").await;

        let calls: Vec<_> = (0..16)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.shutdown().await })
            })
            .collect();
        for call in calls {
            let result = tokio::time::timeout(TIMEOUT, call)
                .await
                .expect("shutdown deadlocked")
                .expect("shutdown panicked");
            assert!(result.is_ok());
        }

        assert!(join(run).await.is_ok());
        assert_eq!(journal.count("a:shutdown"), 1);
        assert_eq!(journal.count("a:before_shutdown"), 1);
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert!(engine.is_shutting_down());
    }

    #[tokio::test]
    async fn before_run_failure_skips_only_that_server() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal).failing("before_run"))
            .with_server(TestServer::new("b", &journal).returning())
            .build();

        let errors = engine.run().await.unwrap_err();

        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors.latest(),
            Some(Error::BeforeRun { server, .. }) if server == "a"
        ));
        assert!(!journal.contains("a:run"));
        assert!(!journal.contains("a:after_stop"));
        assert!(journal.contains("b:run"));
        assert!(journal.contains("b:after_stop"));
        assert_eq!(journal.count("a:shutdown"), 1);
        assert_eq!(journal.count("b:shutdown"), 1);
    }

    #[tokio::test]
    async fn after_stop_runs_when_run_fails() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal).failing("run").failing("after_stop"))
            .build();

        let errors = engine.run().await.unwrap_err();

        assert!(journal.contains("a:after_stop"));
        let kinds: Vec<_> = errors
            .iter()
            .map(|e| match e {
                Error::Run { .. } => "run",
                Error::AfterStop { .. } => "after_stop",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["run", "after_stop"]);
        assert_eq!(
            errors.to_string(),
            "server 'a': after stop: a after_stop failed: server 'a': run: a run failed"
        );
    }

    #[tokio::test]
    async fn shutdown_follows_registration_order() {
        const NAMES: [&str; 5] = ["s0", "s1", "s2", "s3", "s4"];

        for _ in 0..3 {
            let journal = Journal::default();
            let mut builder = Engine::builder("test");
            for name in NAMES {
                builder = builder.with_server(TestServer::new(name, &journal));
            }
            let engine = builder.build();

            let run = spawn_run(&engine);
            for name in NAMES {
                journal.wait_for(&format!("{name}:run")).await;
            }
            assert!(engine.shutdown().await.is_ok());
            assert!(join(run).await.is_ok());

            let teardown: Vec<_> = journal
                .events()
                .into_iter()
                .filter(|e| e.ends_with(":before_shutdown") || e.ends_with(":shutdown"))
                .collect();
            let expected: Vec<_> = NAMES
                .iter()
                .flat_map(|n| [format!("{n}:before_shutdown"), format!("{n}:shutdown")])
                .collect();
            assert_eq!(teardown, expected);
        }
    }

    #[tokio::test]
    async fn all_servers_returning_is_a_clean_run() {
        let journal = Journal::default();
        let handled = Arc::new(Mutex::new(Vec::new()));
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal).returning())
            .with_server(TestServer::new("b", &journal).returning())
            .with_shutdown_handler({
                let handled = Arc::clone(&handled);
                move |errors| handled.lock().expect("poisoned").push(errors.map(Errors::len))
            })
            .build();

        assert!(engine.run().await.is_ok());
        assert_eq!(journal.count("a:shutdown"), 1);
        assert_eq!(journal.count("b:shutdown"), 1);
        assert_eq!(*handled.lock().expect("poisoned"), [None::<usize>]);
    }

    #[tokio::test]
    async fn failing_server_stops_the_others() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal))
            .with_server(TestServer::new("b", &journal).failing("run"))
            .build();

        let errors = join(spawn_run(&engine)).await.unwrap_err();

        assert!(errors.iter().any(|e| matches!(e, Error::Run { server, .. } if server == "b")));
        assert_eq!(journal.count("a:shutdown"), 1);
        assert!(journal.contains("a:before_shutdown"));
        assert!(journal.contains("a:after_stop"));
        assert!(errors.to_string().contains("b run failed"));
    }

    #[tokio::test]
    async fn before_hook_failure_starts_nothing() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal))
            .with_before_hook(engine_hook(|_| async { Err("not ready".into()) }))
            .build();

        let errors = engine.run().await.unwrap_err();

        assert_eq!(errors.len(), 1);
        assert!(matches!(errors.latest(), Some(Error::BeforeHook { .. })));
        assert_eq!(errors.to_string(), "engine 'test': before hook: not ready");
        assert!(journal.events().is_empty());

        tokio::time::timeout(TIMEOUT, engine.wait_stopped())
            .await
            .expect("engine never reported stopped");
        assert!(engine.is_shutting_down());
    }

    #[tokio::test]
    async fn engine_hooks_bracket_the_run() {
        let journal = Journal::default();
        let record = |event: &'static str| {
            let journal = journal.clone();
            engine_hook(move |engine| {
                let journal = journal.clone();
                async move {
                    journal.record(format!("{}:{event}", engine.name()));
                    Ok(())
                }
            })
        };
        let engine = Engine::builder("engine")
            .with_server(TestServer::new("a", &journal).returning())
            .with_before_hook(record("before"))
            .with_after_hook(engine_hook(|_| async { Err("cleanup failed".into()) }))
            .build();

        let errors = engine.run().await.unwrap_err();

        let events = journal.events();
        assert_eq!(events.first().map(String::as_str), Some("engine:before"));
        assert!(matches!(errors.latest(), Some(Error::AfterHook { .. })));
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal))
            .build();

        let run = spawn_run(&engine);
        journal.wait_for("a:run").await;

        let errors = engine.run().await.unwrap_err();
        assert!(matches!(errors.latest(), Some(Error::AlreadyRunning(name)) if name == "test"));

        assert!(engine.shutdown().await.is_ok());
        assert!(join(run).await.is_ok());
        assert_eq!(journal.count("a:run"), 1);
    }

    #[tokio::test]
    async fn internal_shutdown_errors_reach_run_and_handler() {
        let journal = Journal::default();
        let handled = Arc::new(AtomicUsize::new(0));
        let engine = Engine::builder("test")
            .with_server(
                TestServer::new("a", &journal)
                    .returning()
                    .failing("before_shutdown")
                    .failing("shutdown"),
            )
            .with_server(TestServer::new("b", &journal).returning())
            .with_shutdown_handler({
                let handled = Arc::clone(&handled);
                move |errors| {
                    handled.store(errors.map_or(0, Errors::len), Ordering::SeqCst);
                }
            })
            .build();

        let errors = engine.run().await.unwrap_err();

        assert_eq!(handled.load(Ordering::SeqCst), 2);
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors.iter().next(), Some(Error::BeforeShutdown { .. })));
        assert!(matches!(errors.latest(), Some(Error::Shutdown { .. })));
        assert_eq!(journal.count("b:shutdown"), 1);
    }

    #[tokio::test]
    async fn external_shutdown_returns_errors_to_caller() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal).failing("shutdown"))
            .build();

        let run = spawn_run(&engine);
        journal.wait_for("a:run").await;

        let errors = engine.shutdown().await.unwrap_err();
        assert!(matches!(errors.latest(), Some(Error::Shutdown { server, .. }) if server == "a"));
        assert!(engine.shutdown().await.is_ok());

        assert!(join(run).await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_before_run_lets_run_return() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal))
            .build();

        assert!(engine.shutdown().await.is_ok());
        assert!(join(spawn_run(&engine)).await.is_ok());
        assert_eq!(journal.count("a:shutdown"), 1);
        assert!(journal.contains("a:after_stop"));
    }

    struct PanickingServer;

    #[allow(clippy::panic)]
    async fn explode() -> Result<(), BoxError> {
        panic!("server exploded")
    }

    impl Server for PanickingServer {
        fn name(&self) -> &str {
            "panicking"
        }

        fn run(&self) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(explode())
        }

        fn shutdown(&self) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn panicking_run_is_reported() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(PanickingServer)
            .with_server(TestServer::new("a", &journal))
            .build();

        let errors = join(spawn_run(&engine)).await.unwrap_err();

        assert!(matches!(
            errors.latest(),
            Some(Error::Run { server, .. }) if server == "panicking"
        ));
        assert_eq!(journal.count("a:shutdown"), 1);
    }

    struct PanickingHooks;

    impl Server for PanickingHooks {
        fn name(&self) -> &str {
            "hooks"
        }

        fn before_run_hook(&self) -> Option<Hook> {
            Some(hook(|_, _| explode()))
        }

        fn before_shutdown_hook(&self) -> Option<Hook> {
            Some(hook(|_, _| explode()))
        }

        fn run(&self) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async { Ok(()) })
        }

        fn shutdown(&self) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn panicking_hooks_are_reported() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(PanickingHooks)
            .with_server(TestServer::new("a", &journal))
            .build();

        let errors = join(spawn_run(&engine)).await.unwrap_err();

        let kinds: Vec<_> = errors
            .iter()
            .filter(|e| e.server() == Some("hooks"))
            .map(|e| match e {
                Error::BeforeRun { .. } => "before_run",
                Error::BeforeShutdown { .. } => "before_shutdown",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["before_run", "before_shutdown"]);
        assert_eq!(journal.count("a:shutdown"), 1);
        assert!(journal.contains("a:after_stop"));
    }

    #[tokio::test]
    async fn panicking_engine_hook_is_reported() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal))
            .with_before_hook(engine_hook(|_| explode()))
            .build();

        let errors = join(spawn_run(&engine)).await.unwrap_err();

        assert!(matches!(errors.latest(), Some(Error::BeforeHook { .. })));
        assert!(journal.events().is_empty());
    }

    #[cfg(unix)]
    async fn raise(signal: &str) {
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(format!("kill -{signal} {}", std::process::id()))
            .status()
            .await
            .expect("failed to spawn kill");
        assert!(status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_signal_shuts_down() {
        let journal = Journal::default();
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal))
            .with_signals([ShutdownSignal::Terminate])
            .with_console(true)
            .build();

        let run = spawn_run(&engine);
        journal.wait_for("a:run").await;
        raise("TERM").await;

        assert!(join(run).await.is_ok());
        assert_eq!(journal.count("a:shutdown"), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_shutdown_honours_delay() {
        let journal = Journal::default();
        let delay = Duration::from_millis(100);
        let engine = Engine::builder("test")
            .with_server(TestServer::new("a", &journal))
            .with_signals([ShutdownSignal::User1])
            .with_shutdown_delay(delay)
            .build();

        let run = spawn_run(&engine);
        journal.wait_for("a:run").await;
        let sent = Instant::now();
        raise("USR1").await;

        assert!(join(run).await.is_ok());
        assert!(sent.elapsed() >= delay);
        assert_eq!(journal.count("a:shutdown"), 1);
    }
}
