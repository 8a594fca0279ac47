//! Aggregator configuration: defaults plus environment overrides.

use std::time::Duration;

use crate::error::AggregatorError;

#[derive(Debug, Clone)]
pub struct Config {
  /// Rows per bulk write; reaching it triggers an immediate flush.
  pub batch_size: usize,
  pub flush_interval_ms: u64,
  /// Failed attempts allowed per batch before it is dead-lettered.
  pub max_retries: u32,
  pub backoff_base_ms: u64,
  pub backoff_max_ms: u64,
  /// Upper bound for a single sink write; a timeout counts as a failure.
  pub write_timeout_ms: u64,
  pub channel_capacity: usize,
  pub database_url: Option<String>,
  pub port: u16,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      batch_size: 100,
      flush_interval_ms: 10_000,
      max_retries: 5,
      backoff_base_ms: 500,
      backoff_max_ms: 60_000,
      write_timeout_ms: 30_000,
      channel_capacity: 1024,
      database_url: None,
      port: 5005,
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self, AggregatorError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self, AggregatorError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();
    if let Some(v) = parse(&lookup, "AGGREGATOR_BATCH_SIZE")? {
      config.batch_size = v;
    }
    if let Some(v) = parse(&lookup, "AGGREGATOR_FLUSH_INTERVAL_MS")? {
      config.flush_interval_ms = v;
    }
    if let Some(v) = parse(&lookup, "AGGREGATOR_MAX_RETRIES")? {
      config.max_retries = v;
    }
    if let Some(v) = parse(&lookup, "AGGREGATOR_BACKOFF_BASE_MS")? {
      config.backoff_base_ms = v;
    }
    if let Some(v) = parse(&lookup, "AGGREGATOR_BACKOFF_MAX_MS")? {
      config.backoff_max_ms = v;
    }
    if let Some(v) = parse(&lookup, "AGGREGATOR_WRITE_TIMEOUT_MS")? {
      config.write_timeout_ms = v;
    }
    if let Some(v) = parse(&lookup, "AGGREGATOR_CHANNEL_CAPACITY")? {
      config.channel_capacity = v;
    }
    if let Some(v) = parse(&lookup, "PORT")? {
      config.port = v;
    }
    config.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

    if config.batch_size == 0 {
      return Err(AggregatorError::config("AGGREGATOR_BATCH_SIZE", "must be at least 1"));
    }
    if config.flush_interval_ms == 0 {
      return Err(AggregatorError::config("AGGREGATOR_FLUSH_INTERVAL_MS", "must be positive"));
    }
    if config.channel_capacity == 0 {
      return Err(AggregatorError::config("AGGREGATOR_CHANNEL_CAPACITY", "must be at least 1"));
    }
    Ok(config)
  }

  pub fn flush_interval(&self) -> Duration {
    Duration::from_millis(self.flush_interval_ms)
  }

  pub fn write_timeout(&self) -> Duration {
    Duration::from_millis(self.write_timeout_ms)
  }

  /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(30);
    let ms = self.backoff_base_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(ms.min(self.backoff_max_ms))
  }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>, AggregatorError>
where
  F: Fn(&str) -> Option<String>,
  T: std::str::FromStr,
{
  match lookup(key) {
    Some(raw) => raw
      .trim()
      .parse::<T>()
      .map(Some)
      .map_err(|_| AggregatorError::config(key, &format!("invalid value {:?}", raw))),
    None => Ok(None),
  }
}
