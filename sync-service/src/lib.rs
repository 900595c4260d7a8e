pub mod api;
pub mod client;
pub mod config;
pub mod log;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod sinks;
pub mod sources;
pub mod transform;
pub mod worker;

pub use client::SubmissionClient;
pub use pipeline::{Envelope, Pipeline};
pub use queue::PendingSubmissionQueue;
