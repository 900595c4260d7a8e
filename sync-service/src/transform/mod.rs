use crate::pipeline::{Envelope, PipelineError, Transform};
use reading_client::domain::Reading;
use time::macros::datetime;

/// Pure validation of a `Reading`.
///
/// Rules:
/// - value must be finite and non-negative (all metric kinds are kWh).
/// - captured_at must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_reading(env: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
    let r = &env.payload;

    if !r.value.is_finite() {
        return Err(PipelineError::Transform(format!(
            "{} value must be a finite number",
            r.metric_kind
        )));
    }
    if r.value < 0.0 {
        return Err(PipelineError::Transform(format!(
            "{} value must be non-negative",
            r.metric_kind
        )));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if r.captured_at < min_ts || r.captured_at > max_ts {
        return Err(PipelineError::Transform("timestamp out of allowed range".to_string()));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<Reading, Reading> for ReadingValidation {
    async fn apply(&self, input: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
        match validate_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_reading_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}
