//! Lifecycle of background tasks.
//!
//! Every long-running task (pool sweep, pool probe, config watcher) is spawned through the
//! [`Supervisor`] so it observes a shared cancellation signal and is joined on shutdown.
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Spawn a task that receives the cancellation token and is expected to return once it fires.
    pub fn spawn<F, Fut>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "Spawning supervised task");
        let future = task(self.token());
        self.tracker.spawn(async move {
            future.await;
            debug!(task = name, "Supervised task finished");
        })
    }

    /// Run `tick` every `period` until shutdown. The first tick happens one period after spawn.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, move |token| async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
        });
    }

    /// Signal every task to stop and wait for all of them, up to `grace`.
    ///
    /// Returns `false` if some task was still running when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!(tasks = self.tracker.len(), "Stopping background tasks");
        self.token.cancel();
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    tasks = self.tracker.len(),
                    "Background tasks did not stop within {}s",
                    grace.as_secs()
                );
                false
            }
        }
    }
}
