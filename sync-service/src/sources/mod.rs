pub mod device_poll;
pub mod readings_backfill_file;
pub mod readings_csv_file;

pub use device_poll::DevicePollSource;
pub use readings_backfill_file::ReadingsBackfillFileSource;
pub use readings_csv_file::ReadingsCsvFileSource;
