//! Structured error types for the session engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),

  #[error("config: {key}: {reason}")]
  Config { key: String, reason: String },
}

impl EngineError {
  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn config(key: &str, reason: &str) -> Self {
    Self::Config {
      key: key.to_string(),
      reason: reason.to_string(),
    }
  }
}

/// Failures handing records to the outbound bus.
#[derive(Debug, Error)]
pub enum BusError {
  #[error("bus closed: {topic}")]
  Closed { topic: String },

  #[error("publish to {topic} failed: {reason}")]
  PublishFailed { topic: String, reason: String },

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}
