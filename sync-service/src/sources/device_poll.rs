use std::time::Duration;

use futures::Stream;
use reading_client::domain::{MetricKind, Reading, ReadingOrigin};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Envelope, PipelineError, Source};

/// Snapshot served by the local energy system's API.
///
/// Every present `*_kwh` field becomes one automatic reading. Without a
/// device timestamp, the poll time truncated to whole seconds is used.
#[derive(Debug, Deserialize)]
struct DeviceSnapshot {
    #[serde(default, with = "time::serde::rfc3339::option")]
    captured_at: Option<OffsetDateTime>,
    production_kwh: Option<f64>,
    consumption_kwh: Option<f64>,
    lifetime_kwh: Option<f64>,
}

impl DeviceSnapshot {
    fn into_readings(self, polled_at: OffsetDateTime) -> Vec<Reading> {
        let captured_at = self
            .captured_at
            .unwrap_or_else(|| polled_at.replace_nanosecond(0).unwrap_or(polled_at));

        [
            (MetricKind::Production, self.production_kwh),
            (MetricKind::Consumption, self.consumption_kwh),
            (MetricKind::LifetimeTotal, self.lifetime_kwh),
        ]
        .into_iter()
        .filter_map(|(kind, value)| {
            value.map(|v| Reading::new(captured_at, kind, v, ReadingOrigin::Automatic))
        })
        .collect()
    }
}

/// Polls the local device on a fixed cadence.
///
/// The device is only intermittently reachable: a failed poll is logged and
/// counted, and the next tick tries again. The stream ends when `shutdown` is
/// cancelled.
pub struct DevicePollSource {
    client: reqwest::Client,
    url: String,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl DevicePollSource {
    pub fn new(
        url: impl Into<String>,
        poll_interval: Duration,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        if poll_interval.is_zero() {
            return Err(PipelineError::Source("device poll interval must be non-zero".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PipelineError::Source(format!("failed to build device http client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            poll_interval,
            shutdown,
        })
    }
}

async fn fetch_snapshot(client: &reqwest::Client, url: &str) -> Result<DeviceSnapshot, PipelineError> {
    let resp = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| PipelineError::SourceUnavailable(e.to_string()))?;

    resp.json::<DeviceSnapshot>()
        .await
        .map_err(|e| PipelineError::SourceUnavailable(format!("invalid device payload: {e}")))
}

#[async_trait::async_trait]
impl Source<Reading> for DevicePollSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<Reading>, PipelineError>> + Send>> {
        let client = self.client.clone();
        let url = self.url.clone();
        let poll_interval = self.poll_interval;
        let shutdown = self.shutdown.clone();

        let s = async_stream::stream! {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match fetch_snapshot(&client, &url).await {
                    Ok(snapshot) => {
                        metrics::counter!("device_polls_total").increment(1);
                        for reading in snapshot.into_readings(OffsetDateTime::now_utc()) {
                            yield Ok(Envelope::now(reading));
                        }
                    }
                    Err(e) => {
                        metrics::counter!("device_poll_errors_total").increment(1);
                        tracing::warn!(error = %e, url = %url, "device poll failed, retrying next tick");
                    }
                }
            }

            tracing::info!(url = %url, "device polling stopped");
        };

        Box::pin(s)
    }
}
