//! Exactly-once shutdown bookkeeping.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

/// Guards the shutdown sequence so its body runs once per engine.
///
/// `shutting_down` flips false to true exactly once, and `completed` fires
/// exactly once afterwards. Both transitions happen under the same lock.
#[derive(Debug, Default)]
pub(crate) struct ShutdownCoordinator {
    shutting_down: Mutex<bool>,
    completed: CancellationToken,
}

impl ShutdownCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.shutting_down
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Test-and-set: returns `true` only for the caller that entered first.
    pub(crate) fn try_begin(&self) -> bool {
        let mut shutting_down = self.lock();
        !std::mem::replace(&mut *shutting_down, true)
    }

    /// Fires the completion signal, waking every [`wait`](Self::wait)er.
    pub(crate) fn complete(&self) {
        let _guard = self.lock();
        self.completed.cancel();
    }

    /// Suspends until [`complete`](Self::complete) has been called.
    pub(crate) async fn wait(&self) {
        self.completed.cancelled().await;
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.lock()
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.is_cancelled()
    }
}
