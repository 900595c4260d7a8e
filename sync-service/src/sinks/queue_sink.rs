use std::sync::Arc;

use futures::StreamExt;
use reading_client::domain::Reading;

use crate::{
    pipeline::{Envelope, PipelineError, Sink},
    queue::PendingSubmissionQueue,
};

/// Terminal sink of every reading pipeline: hands readings to the
/// pending-submission queue. Delivery to the append log happens on flush.
///
/// The sink drains its input until the source ends. A reading the queue
/// cannot take is logged and counted, and the next one is tried.
pub struct QueueSink {
    queue: Arc<PendingSubmissionQueue>,
}

impl QueueSink {
    pub fn new(queue: Arc<PendingSubmissionQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl Sink<Reading> for QueueSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut accepted: u64 = 0;
        let mut rejected: u64 = 0;
        let mut failed: u64 = 0;

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    rejected += 1;
                    tracing::warn!(error = %e, "dropping reading rejected upstream of QueueSink");
                    continue;
                }
            };

            if let Ok(waited) = env.received_at.elapsed() {
                metrics::histogram!("ingest_to_enqueue_seconds").record(waited.as_secs_f64());
            }

            let key = env.payload.key();
            match self.queue.enqueue(env.payload).await {
                Ok(_) => accepted += 1,
                Err(e) => {
                    failed += 1;
                    metrics::counter!("queue_sink_enqueue_errors_total").increment(1);
                    tracing::error!(error = %e, reading = %key, "enqueue failed, reading not queued");
                }
            }
        }

        tracing::info!(accepted, rejected, failed, "reading stream ended");
        Ok(())
    }
}
