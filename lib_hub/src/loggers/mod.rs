/// `tracing` subscriber setup: console layer plus a daily rolling JSON file.
pub mod tracing_setup;

pub use tracing_setup::{setup_logging, LoggingError};
