use std::{sync::Arc, time::Duration};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::queue::PendingSubmissionQueue;

/// Drives `flush` for one queue: on a fixed interval, and right after an
/// enqueue wakes it. Being the only caller keeps a single writer per queue.
pub struct FlushWorker {
    queue: Arc<PendingSubmissionQueue>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl FlushWorker {
    pub fn new(queue: Arc<PendingSubmissionQueue>, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            interval,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.queue.notified() => {}
            }

            if let Err(e) = self.queue.flush().await {
                metrics::counter!("flush_worker_errors_total").increment(1);
                tracing::error!(error = %e, "flush pass failed on local queue storage");
            }
        }

        tracing::info!("flush worker stopped");
    }
}
