pub mod queue_sink;

pub use queue_sink::QueueSink;
