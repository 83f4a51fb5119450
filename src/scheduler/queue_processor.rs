//! Queue processor: hands ready tasks to workers as permits free up.

use super::TaskScheduler;
use std::sync::Arc;
use std::time::Duration;

/// Fallback interval between readiness scans when nothing wakes the processor
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl TaskScheduler {
    /// Start the queue processor task
    ///
    /// The processor loops until shutdown:
    /// 1. Acquires a worker permit (respects `max_workers`)
    /// 2. Claims the first ready task in queue order
    /// 3. Spawns the task on a worker that holds the permit until it finishes
    ///
    /// When nothing is ready the permit is released and the processor sleeps
    /// until a submission, a finished task, or the poll interval wakes it.
    pub fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        let shutdown = self.inner.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = Arc::clone(&scheduler.inner.workers).acquire_owned() => permit,
                };
                let Ok(permit) = permit else {
                    // Semaphore closed
                    break;
                };

                let claim = scheduler.table().claim_next();
                match claim {
                    Some(claim) => {
                        let worker = scheduler.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            worker.run_task(claim).await;
                            worker.inner.notify.notify_one();
                        });
                    }
                    None => {
                        drop(permit);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = scheduler.inner.notify.notified() => {}
                            _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                        }
                    }
                }
            }
            tracing::debug!("Queue processor stopped");
        })
    }
}
