use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A fixed number of tasks draining a shared job queue.
///
/// After [`Executor::shutdown`] no new jobs are accepted, but jobs already
/// queued still run.
pub(crate) struct Executor {
    name: &'static str,
    sender: async_channel::Sender<Job>,
    workers: TaskTracker,
}

impl Executor {
    pub fn new(name: &'static str, threads: usize, span: tracing::Span) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Job>();
        let workers = TaskTracker::new();
        for index in 0..threads {
            let receiver = receiver.clone();
            workers.spawn(
                async move {
                    while let Ok(job) = receiver.recv().await {
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            tracing::error!(executor = name, "job panicked");
                        }
                    }
                    tracing::trace!(executor = name, index, "worker stopped");
                }
                .instrument(span.clone()),
            );
        }
        workers.close();
        Self { name, sender, workers }
    }

    /// Queues `job`. Returns false when the executor has been shut down.
    pub fn spawn(&self, job: impl Future<Output = ()> + Send + 'static) -> bool {
        match self.sender.try_send(Box::pin(job)) {
            Ok(_) => true,
            Err(_) => {
                tracing::debug!(executor = self.name, "executor is not running");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn shutdown(&self) {
        self.sender.close();
    }

    /// Waits until every worker finished. Returns false if `deadline` passed first.
    pub async fn wait(&self, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.workers.wait()).await.is_ok(),
            None => {
                self.workers.wait().await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::executor::Executor;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drains_queued_jobs_after_shutdown() {
        let executor = Executor::new("test", 2, tracing::Span::none());
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = done.clone();
            assert!(executor.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        executor.shutdown();
        assert!(!executor.is_running());
        assert!(!executor.spawn(async {}));
        assert!(executor.wait(None).await);
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_survives_panicking_job() {
        let executor = Executor::new("test", 1, tracing::Span::none());
        let done = Arc::new(AtomicUsize::new(0));
        executor.spawn(async { panic!("boom") });
        let d = done.clone();
        executor.spawn(async move {
            d.fetch_add(1, Ordering::SeqCst);
        });
        executor.shutdown();
        assert!(executor.wait(None).await);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_times_out_while_running() {
        let executor = Executor::new("test", 1, tracing::Span::none());
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!executor.wait(Some(deadline)).await);
        executor.shutdown();
        assert!(executor.wait(None).await);
    }
}
