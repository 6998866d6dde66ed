//! Lifecycle interface for long-lived components.
//!
//! Components that own background work (idle connection sweeping, registry
//! watches, accept loops) implement [`Bootable`] so that their lifetime is
//! driven by explicit `start` / `shutdown` calls instead of hidden globals.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Error returned by bootable lifecycle methods.
pub type BootableError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for bootable services.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Get the name of the bootable service.
    fn bootable_name(&self) -> &str;

    /// Start the bootable service.
    async fn start(&self) -> Result<(), BootableError>;

    /// Shutdown the bootable service.
    async fn shutdown(&self) -> Result<(), BootableError>;

    /// Wait for the bootable service to exit.
    async fn wait(&self);
}

/// Default time given to a background task to observe cancellation.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// A single cancellable background task owned by a bootable component.
///
/// The task receives a [`CancellationToken`] and is expected to return once
/// it fires. At most one task runs at a time.
pub struct BackgroundTask {
    name: String,
    state: Mutex<Option<RunningTask>>,
}

impl BackgroundTask {
    /// Create an idle background task slot.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(None),
        }
    }

    /// Name used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the task. Returns `false` if a task is already running.
    pub fn spawn<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();

        if let Some(running) = state.as_ref() {
            if !running.handle.is_finished() {
                warn!("{} is already running", self.name);
                return false;
            }
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(task(token.clone()));
        debug!("{} started", self.name);

        *state = Some(RunningTask { token, handle });
        true
    }

    /// Whether a task is currently running.
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Cancel the task and wait up to `grace` for it to finish.
    pub async fn stop(&self, grace: Duration) {
        let running = self.state.lock().take();

        let Some(RunningTask { token, handle }) = running else {
            return;
        };

        token.cancel();

        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => debug!("{} shut down cleanly", self.name),
            Ok(Err(e)) => error!("{} panicked: {}", self.name, e),
            Err(_) => error!("{} did not shut down within {:?}", self.name, grace),
        }
    }

    /// Wait until the running task exits on its own or is stopped.
    pub async fn wait(&self) {
        loop {
            if !self.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let task = BackgroundTask::new("ticker");
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        assert!(task.spawn(move |token| async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_millis(5)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }));

        assert!(task.is_running());
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.stop(DEFAULT_STOP_GRACE).await;

        assert!(!task.is_running());
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_double_spawn_rejected() {
        let task = BackgroundTask::new("single");

        assert!(task.spawn(|token| async move { token.cancelled().await }));
        assert!(!task.spawn(|token| async move { token.cancelled().await }));

        task.stop(DEFAULT_STOP_GRACE).await;

        // A stopped slot can be reused.
        assert!(task.spawn(|token| async move { token.cancelled().await }));
        task.stop(DEFAULT_STOP_GRACE).await;
    }

    #[tokio::test]
    async fn test_stop_without_spawn_is_noop() {
        let task = BackgroundTask::new("idle");
        task.stop(DEFAULT_STOP_GRACE).await;
        task.wait().await;
        assert!(!task.is_running());
    }
}
