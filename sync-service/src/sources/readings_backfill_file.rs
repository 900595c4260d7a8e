use std::path::PathBuf;

use async_stream::try_stream;
use futures::Stream;
use reading_client::domain::{MetricKind, Reading, ReadingOrigin};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use crate::pipeline::{Envelope, PipelineError, Source};

/// NDJSON backfill source for readings.
///
/// Each non-empty line is a JSON object with `captured_at`, `metric_kind`,
/// `value` and an optional `source`. A malformed line ends the stream with an
/// error; backfill files are expected to be machine generated.
pub struct ReadingsBackfillFileSource {
    path: PathBuf,
    default_origin: ReadingOrigin,
}

#[derive(serde::Deserialize)]
struct BackfillReading {
    #[serde(with = "time::serde::rfc3339")]
    captured_at: time::OffsetDateTime,
    metric_kind: MetricKind,
    value: f64,
    source: Option<ReadingOrigin>,
}

impl BackfillReading {
    fn into_reading(self, default_origin: ReadingOrigin) -> Reading {
        Reading::new(
            self.captured_at,
            self.metric_kind,
            self.value,
            self.source.unwrap_or(default_origin),
        )
    }
}

impl ReadingsBackfillFileSource {
    pub fn new<P: Into<PathBuf>>(path: P, default_origin: ReadingOrigin) -> Self {
        Self {
            path: path.into(),
            default_origin,
        }
    }
}

#[async_trait::async_trait]
impl Source<Reading> for ReadingsBackfillFileSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send>> {
        let path = self.path.clone();
        let default_origin = self.default_origin;
        let s = try_stream! {
            let file = File::open(&path).await.map_err(|e| {
                PipelineError::Source(format!("failed to open backfill file: {e}"))
            })?;
            let reader = BufReader::new(file);
            let mut lines = reader.lines();

            while let Some(line) = lines.next_line().await.map_err(|e| {
                PipelineError::Source(format!("failed to read backfill line: {e}"))
            })? {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: BackfillReading = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        metrics::counter!("backfill_readings_parse_errors_total").increment(1);
                        Err(PipelineError::Source(format!(
                            "failed to parse backfill json line: {e}"
                        )))?
                    }
                };
                yield Envelope::now(parsed.into_reading(default_origin));
            }
        };

        Box::pin(s)
    }
}
