use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ClientResult;

type Work = Box<dyn FnMut(CancellationToken) -> BoxFuture<'static, ClientResult<()>> + Send>;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    work: Work,
    running: Option<Running>,
}

/// A named unit of async work that can be started once and stopped within
/// a grace period. Dropping the task detaches the work; only `cancel` and
/// `stop` interrupt it.
pub struct BackgroundTask {
    name: String,
    grace_period: Duration,
    inner: Mutex<Inner>,
}

impl BackgroundTask {
    pub fn new<F, Fut>(name: impl Into<String>, grace_period: Duration, mut work: F) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ClientResult<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            grace_period,
            inner: Mutex::new(Inner {
                work: Box::new(move |cancel| Box::pin(work(cancel))),
                running: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.inner()
            .running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn start(&self) {
        let mut inner = self.inner();
        if inner
            .running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
        {
            error!(task = %self.name, "background task is already running");
            return;
        }

        let cancel = CancellationToken::new();
        let work = (inner.work)(cancel.clone());
        let name = self.name.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            match work.await {
                Ok(()) => debug!(task = %name, "background task finished"),
                Err(err) if token.is_cancelled() => {
                    debug!(task = %name, "background task ended after cancellation: {err}")
                }
                Err(err) => error!(task = %name, "background task failed: {err}"),
            }
        });
        inner.running = Some(Running { cancel, handle });
        debug!(task = %self.name, "background task started");
    }

    /// Signal cancellation without waiting.
    pub fn cancel(&self) {
        if let Some(running) = self.inner().running.as_ref() {
            running.cancel.cancel();
        }
    }

    /// Cancel and wait up to the grace period, then abort.
    pub async fn stop(&self) {
        let Some(running) = self.inner().running.take() else {
            return;
        };
        running.cancel.cancel();

        let mut handle = running.handle;
        match tokio::time::timeout(self.grace_period, &mut handle).await {
            Ok(Ok(())) => info!(task = %self.name, "background task stopped"),
            Ok(Err(err)) if err.is_panic() => {
                error!(task = %self.name, "background task panicked: {err}")
            }
            Ok(Err(err)) => debug!(task = %self.name, "background task was aborted: {err}"),
            Err(_) => {
                warn!(
                    task = %self.name,
                    grace_ms = self.grace_period.as_millis() as u64,
                    "background task did not stop within its grace period; aborting"
                );
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TentacleClientError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let task = BackgroundTask::new("poller", Duration::from_secs(1), move |cancel| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                cancel.cancelled().await;
                Ok(())
            }
        });

        task.start();
        task.start();
        assert!(task.is_running());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        task.stop().await;
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_work_that_ignores_cancellation() {
        let task = BackgroundTask::new("stubborn", Duration::from_secs(2), |_cancel| async {
            std::future::pending::<()>().await;
            Ok(())
        });
        task.start();

        let started = tokio::time::Instant::now();
        task.stop().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn failures_are_contained() {
        let task = BackgroundTask::new("failing", Duration::from_secs(1), |_cancel| async {
            Err(TentacleClientError::cancelled("nothing"))
        });
        task.start();
        tokio::task::yield_now().await;
        task.stop().await;

        // A finished task can be started again.
        task.start();
        task.stop().await;
    }

    #[tokio::test]
    async fn dropped_task_keeps_running() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut done_tx = Some(done_tx);
        let task = BackgroundTask::new("detached", Duration::from_secs(1), move |cancel| {
            let done_tx = done_tx.take();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Some(done_tx) = done_tx {
                    let _ = done_tx.send(cancel.is_cancelled());
                }
                Ok(())
            }
        });
        task.start();
        drop(task);

        let was_cancelled = tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .expect("detached work finished")
            .expect("detached work reported");
        assert!(!was_cancelled);
    }

    #[tokio::test]
    async fn stop_without_start_returns() {
        let task = BackgroundTask::new("idle", Duration::from_secs(1), |_cancel| async { Ok(()) });
        task.stop().await;
        assert!(!task.is_running());
    }
}
