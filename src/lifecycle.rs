use std::future::Future;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::trace;

/// Shared shutdown signal plus completion tracking for every background loop.
///
/// A [`Bus`] owns one and hands clones down to each connection, channel, publisher and
/// subscriber it creates. Loops are spawned through [`spawn`] so that [`wait`] only returns
/// once all of them have exited.
///
/// [`Bus`]: ./struct.Bus.html
/// [`spawn`]: #method.spawn
/// [`wait`]: #method.wait
#[derive(Clone, Debug, Default)]
pub struct Lifecycle {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the shutdown signal. Firing it again is a no-op.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            trace!("shutdown signal fired");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// A handle on the shutdown signal, resolving through `cancelled().await`.
    pub fn signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A signal that fires on shutdown or when cancelled on its own, whichever comes first.
    pub(crate) fn child_signal(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Number of background loops still running.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    pub(crate) fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        trace!(task = name, "spawning background loop");
        self.tracker.spawn(async move {
            task.await;
            trace!(task = name, "background loop exited");
        });
    }

    /// Resolves once every loop spawned so far has exited.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
