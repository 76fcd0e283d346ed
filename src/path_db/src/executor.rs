use log::{debug, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Fire-and-forget executor for non-critical backend jobs.
///
/// A bounded queue feeds a fixed pool of worker tasks. Submission applies
/// backpressure once the queue bound is reached. Jobs must be independent:
/// beyond the queue hand-off nothing orders two jobs against each other,
/// so conflicting writers serialize above this layer. Shutdown closes the
/// queue, drains what was accepted, and joins every worker; a later
/// submission transparently restarts the pool.
pub struct AsyncJobExecutor {
    queue_depth: usize,
    worker_count: usize,
    /// Jobs accepted but not yet finished (queued + running).
    pending: Arc<AtomicUsize>,
    inner: Mutex<ExecutorInner>,
}

struct ExecutorInner {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncJobExecutor {
    pub fn new(queue_depth: usize, worker_count: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            worker_count: worker_count.max(1),
            pending: Arc::new(AtomicUsize::new(0)),
            inner: Mutex::new(ExecutorInner {
                sender: None,
                workers: Vec::new(),
            }),
        }
    }

    fn start_workers(&self) -> (mpsc::Sender<Job>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<Job>(self.queue_depth);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..self.worker_count)
            .map(|_| {
                let rx = rx.clone();
                let pending = self.pending.clone();
                tokio::spawn(async move {
                    loop {
                        // The receiver lock is held only for the hand-off,
                        // so workers run the jobs themselves in parallel.
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        job.await;
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    debug!("job executor worker drained");
                })
            })
            .collect();
        (tx, workers)
    }

    pub async fn submit(&self, job: impl Future<Output = ()> + Send + 'static) {
        let sender = {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("job executor lock poisoned, job dropped: {}", e);
                    return;
                }
            };
            if inner.sender.is_none() {
                debug!("job executor pool starting, workers: {}", self.worker_count);
                let (tx, workers) = self.start_workers();
                inner.sender = Some(tx);
                inner.workers = workers;
            }
            inner.sender.clone()
        };
        let Some(sender) = sender else {
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(Box::pin(job)).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("job executor queue closed, job dropped");
        }
    }

    /// Wait until every job accepted so far has finished.
    pub async fn flush(&self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
        }
    }

    /// Stop accepting jobs, drain the queue, and wait for running jobs.
    pub async fn shutdown_and_wait(&self) {
        let workers = {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("job executor lock poisoned on shutdown: {}", e);
                    return;
                }
            };
            inner.sender = None;
            std::mem::take(&mut inner.workers)
        };
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("job executor worker join failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_single_worker_runs_in_submission_order() {
        let executor = AsyncJobExecutor::new(16, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            executor
                .submit(async move {
                    order.lock().unwrap().push(i);
                })
                .await;
        }
        executor.flush().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_pool_runs_jobs_concurrently() {
        let executor = AsyncJobExecutor::new(16, 2);
        let (tx_a, rx_a) = oneshot::channel::<()>();
        let (tx_b, rx_b) = oneshot::channel::<()>();
        // The two jobs rendezvous, so the flush can only return if the
        // pool runs them at the same time.
        executor
            .submit(async move {
                let _ = tx_a.send(());
                let _ = rx_b.await;
            })
            .await;
        executor
            .submit(async move {
                let _ = tx_b.send(());
                let _ = rx_a.await;
            })
            .await;
        executor.flush().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let executor = AsyncJobExecutor::new(16, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            executor
                .submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        executor.shutdown_and_wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_restarts_pool() {
        let executor = AsyncJobExecutor::new(16, 2);
        executor.submit(async {}).await;
        executor.shutdown_and_wait().await;

        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = counter.clone();
        executor
            .submit(async move {
                cloned.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        executor.flush().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
