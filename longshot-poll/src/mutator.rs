use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Clock;
use crate::Coordinator;

/// How often the background [`Mutator`] changes something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutatorConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(5),
        }
    }
}

impl MutatorConfig {
    fn next_delay(&self) -> Duration {
        let min = self.min_interval.as_millis() as u64;
        let max = (self.max_interval.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// A background task that keeps changing resources at random.
///
/// Every tick sleeps for a random delay within the configured bounds, picks a random
/// resource and replaces its value with whatever `mutate` returns for the current one.
#[derive(Debug)]
pub struct Mutator;

impl Mutator {
    /// Start mutating `coordinator`. Must be called from within a tokio runtime.
    pub fn spawn<V, C, F>(
        coordinator: Coordinator<V, C>,
        config: MutatorConfig,
        mutate: F,
    ) -> MutatorHandle
    where
        V: Clone + Send + 'static,
        C: Clock,
        F: FnMut(&V) -> V + Send + 'static,
    {
        Self::spawn_with_token(coordinator, config, mutate, CancellationToken::new())
    }

    /// Like [`spawn`](Self::spawn), stopping when `token` (or a parent of it) is cancelled.
    pub fn spawn_with_token<V, C, F>(
        coordinator: Coordinator<V, C>,
        config: MutatorConfig,
        mut mutate: F,
        token: CancellationToken,
    ) -> MutatorHandle
    where
        V: Clone + Send + 'static,
        C: Clock,
        F: FnMut(&V) -> V + Send + 'static,
    {
        let cancel = token.clone();
        let task = tokio::spawn(async move {
            tracing::info!(?config, "mutator started");
            loop {
                let delay = config.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let ids = coordinator.ids();
                if ids.is_empty() {
                    continue;
                }
                let pick = rand::rng().random_range(0..ids.len());
                let id = &ids[pick];
                match coordinator.update(id, &mut mutate) {
                    Ok(snapshot) => {
                        tracing::debug!(%id, updated_at = snapshot.updated_at, "mutator tick")
                    }
                    Err(err) => tracing::warn!(%id, %err, "mutator tick failed"),
                }
            }
            tracing::info!("mutator stopped");
        });
        MutatorHandle { token, task }
    }
}

/// Owns a running [`Mutator`].
///
/// Dropping the handle detaches the task; call [`shutdown`](Self::shutdown) to stop it.
#[derive(Debug)]
pub struct MutatorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MutatorHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            tracing::error!(%err, "mutator task failed");
        }
    }
}
