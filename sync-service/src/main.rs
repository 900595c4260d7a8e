use anyhow::Result;
use reading_client::domain::Reading;
use std::{sync::Arc, time::Duration};
use sync_service::{
    api,
    client::SubmissionClient,
    config::AppConfig,
    log, metrics_server, observability,
    pipeline::{Pipeline, Transform},
    queue::{PendingSubmissionQueue, SqliteQueueStore},
    sinks::QueueSink,
    sources::DevicePollSource,
    transform::ReadingValidation,
    worker::FlushWorker,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let append_log = log::from_config(&cfg.remote)?;
    let store = Arc::new(SqliteQueueStore::open(&cfg.local_queue.path).await?);
    let queue = Arc::new(PendingSubmissionQueue::new(
        store,
        append_log.clone(),
        cfg.delivery.retry_policy(),
    ));
    let client = Arc::new(SubmissionClient::new(append_log, queue.clone()));
    let shutdown = CancellationToken::new();

    // Records that ran out of attempts stay in the queue as failed; log each
    // one so an operator can retry it through the API.
    let mut failures = queue.subscribe_failures();
    tokio::spawn(async move {
        loop {
            match failures.recv().await {
                Ok(record) => tracing::warn!(
                    reading_id = %record.reading_id(),
                    reading = %record.reading.key(),
                    attempts = record.attempt_count,
                    last_error = record.last_error.as_deref().unwrap_or(""),
                    "submission needs manual resolution"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "missed failure notifications; see /submissions/failed")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let worker = tokio::spawn(
        FlushWorker::new(queue.clone(), cfg.delivery.flush_interval(), shutdown.clone()).run(),
    );

    // Device pipeline
    let device = match &cfg.device {
        Some(dev) => {
            let source = DevicePollSource::new(
                dev.url.clone(),
                Duration::from_millis(dev.poll_interval_ms),
                Duration::from_millis(dev.request_timeout_ms),
                shutdown.clone(),
            )?;
            let validation: Arc<dyn Transform<Reading, Reading> + Send + Sync> =
                Arc::new(ReadingValidation);
            let pipeline = Pipeline {
                name: "device",
                source,
                transforms: vec![validation],
                sink: QueueSink::new(queue.clone()),
            };
            Some(tokio::spawn(pipeline.run()))
        }
        None => {
            tracing::info!("no device configured; accepting manual readings only");
            None
        }
    };

    let bind_addr = cfg.api.bind_addr.clone();
    let api_shutdown = shutdown.clone();
    let mut api_task =
        tokio::spawn(async move { api::serve(&bind_addr, client, api_shutdown).await });

    let api_early = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutdown requested");
            None
        }
        res = &mut api_task => {
            tracing::error!("submission api exited unexpectedly, shutting down");
            Some(res)
        }
    };

    shutdown.cancel();
    let api_exited_early = api_early.is_some();
    let api_result = match api_early {
        Some(res) => res,
        None => api_task.await,
    };
    let device_result = match device {
        Some(device) => Some(device.await),
        None => None,
    };
    worker.await?;

    // One last pass so readings captured just before shutdown get a chance.
    let report = queue.flush().await?;
    tracing::info!(
        delivered = report.confirmed(),
        still_pending = queue.pending().await?.len(),
        "sync service stopped"
    );

    api_result??;
    if let Some(device_result) = device_result {
        device_result??;
    }
    if api_exited_early {
        anyhow::bail!("submission api exited unexpectedly");
    }

    Ok(())
}
