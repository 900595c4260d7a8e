pub mod reading_queries;

pub use reading_queries::{insert_reading, latest_reading, reading_history, QueryError};
