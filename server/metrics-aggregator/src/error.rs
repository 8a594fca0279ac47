//! Error types for the aggregator and its sink.

use thiserror::Error;

/// Failures talking to the analytical store. All are treated as transient.
#[derive(Debug, Error)]
pub enum SinkError {
  #[error("database: {0}")]
  Database(#[from] sqlx_core::Error),

  #[error("write timed out after {0} ms")]
  Timeout(u64),

  #[error("sink unavailable: {0}")]
  Unavailable(String),
}

/// Startup/configuration failures; fatal for the binary.
#[derive(Debug, Error)]
pub enum AggregatorError {
  #[error("config: {key}: {reason}")]
  Config { key: String, reason: String },

  #[error("sink: {0}")]
  Sink(#[from] SinkError),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),
}

impl AggregatorError {
  pub fn config(key: &str, reason: &str) -> Self {
    Self::Config {
      key: key.to_string(),
      reason: reason.to_string(),
    }
  }
}
