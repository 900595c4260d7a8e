mod reading;
mod submission;

pub use reading::{
    from_unix_nanos, to_unix_nanos, MetricKind, ParseDomainError, Reading, ReadingKey,
    ReadingOrigin,
};
pub use submission::{SubmissionRecord, SubmissionStatus, TransitionError};
