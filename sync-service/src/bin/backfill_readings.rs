use anyhow::{bail, Result};
use reading_client::domain::{Reading, ReadingOrigin};
use std::{env, path::Path, sync::Arc};
use sync_service::{
    config::AppConfig,
    log, observability,
    pipeline::{Pipeline, Source},
    queue::{PendingSubmissionQueue, SqliteQueueStore},
    sinks::QueueSink,
    sources::{ReadingsBackfillFileSource, ReadingsCsvFileSource},
    transform,
};

async fn run_into_queue<S>(source: S, queue: Arc<PendingSubmissionQueue>) -> Result<()>
where
    S: Source<Reading> + Send + Sync + 'static,
{
    let pipeline: Pipeline<_, Reading, _> = Pipeline {
        name: "backfill",
        source,
        transforms: vec![Arc::new(transform::ReadingValidation)],
        sink: QueueSink::new(queue),
    };
    pipeline.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_readings <file.csv|file.ndjson> [manual|automatic]");
    }
    let file_path = Path::new(&args[1]);
    let origin: ReadingOrigin = match args.get(2) {
        Some(raw) => raw.parse()?,
        None => ReadingOrigin::Manual,
    };

    // Same config as the daemon (point SYNC_CONFIG elsewhere for a one-off run).
    let cfg = AppConfig::load()?;

    // Only enqueues. The daemon's flush worker owns delivery for this queue
    // file; the log pool is lazy and never connects here.
    let append_log = log::from_config(&cfg.remote)?;
    let store = Arc::new(SqliteQueueStore::open(&cfg.local_queue.path).await?);
    let queue = Arc::new(PendingSubmissionQueue::new(
        store,
        append_log,
        cfg.delivery.retry_policy(),
    ));

    match file_path.extension().and_then(|e| e.to_str()) {
        Some("csv") => run_into_queue(ReadingsCsvFileSource::new(file_path, origin), queue.clone()).await?,
        Some("ndjson") | Some("jsonl") => {
            run_into_queue(ReadingsBackfillFileSource::new(file_path, origin), queue.clone()).await?
        }
        _ => bail!("unsupported backfill file {}: expected .csv or .ndjson", file_path.display()),
    }

    tracing::info!(
        path = %file_path.display(),
        pending = queue.pending().await?.len(),
        "backfill queued; the sync service delivers on its next flush"
    );

    Ok(())
}
