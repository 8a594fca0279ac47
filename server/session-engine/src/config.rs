//! Engine configuration with sane defaults, overridable from the environment.

use std::time::Duration;

use crate::error::EngineError;

/// Tunables for sessionization, incident detection and the shard runtime.
#[derive(Debug, Clone)]
pub struct Config {
  /// Inactivity after which an open session is closed by the sweep.
  pub session_timeout_ms: i64,
  /// How often each sessionizer shard sweeps for idle sessions.
  pub sweep_interval_ms: u64,
  /// Rolling window for same-element click bursts.
  pub rage_click_window_ms: i64,
  /// Clicks inside the window that make a rage click.
  pub rage_click_threshold: usize,
  /// Max time between leaving a screen and returning to it (A -> B -> A).
  pub backtrack_window_ms: i64,
  /// Trailing screen visits kept per session by the detector.
  pub backtrack_history_len: usize,
  /// Time after a task start marker before the task counts as abandoned.
  pub abandon_timeout_ms: i64,
  /// Number of key shards (one sessionizer + one detector worker each).
  pub shard_count: usize,
  /// Per-shard inbound queue capacity.
  pub channel_capacity: usize,
  /// Bus broker addresses (comma separated), passed through to the transport.
  pub brokers: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      session_timeout_ms: 30 * 60 * 1000,
      sweep_interval_ms: 60_000,
      rage_click_window_ms: 2_000,
      rage_click_threshold: 3,
      backtrack_window_ms: 20_000,
      backtrack_history_len: 10,
      abandon_timeout_ms: 15 * 60 * 1000,
      shard_count: 4,
      channel_capacity: 1024,
      brokers: "localhost:9092".to_string(),
    }
  }
}

impl Config {
  /// Defaults overlaid with any of the recognised environment variables.
  pub fn from_env() -> Result<Self, EngineError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Same as [`Config::from_env`] but reads values through `lookup`.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();
    if let Some(v) = parse(&lookup, "SESSION_TIMEOUT_MS")? {
      config.session_timeout_ms = v;
    }
    if let Some(v) = parse(&lookup, "SWEEP_INTERVAL_MS")? {
      config.sweep_interval_ms = v;
    }
    if let Some(v) = parse(&lookup, "RAGE_CLICK_WINDOW_MS")? {
      config.rage_click_window_ms = v;
    }
    if let Some(v) = parse(&lookup, "RAGE_CLICK_THRESHOLD")? {
      config.rage_click_threshold = v;
    }
    if let Some(v) = parse(&lookup, "BACKTRACK_WINDOW_MS")? {
      config.backtrack_window_ms = v;
    }
    if let Some(v) = parse(&lookup, "BACKTRACK_HISTORY_LEN")? {
      config.backtrack_history_len = v;
    }
    if let Some(v) = parse(&lookup, "ABANDON_TIMEOUT_MS")? {
      config.abandon_timeout_ms = v;
    }
    if let Some(v) = parse(&lookup, "SHARD_COUNT")? {
      config.shard_count = v;
    }
    if let Some(v) = parse(&lookup, "CHANNEL_CAPACITY")? {
      config.channel_capacity = v;
    }
    if let Some(v) = lookup("BUS_BROKERS") {
      config.brokers = v;
    }
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<(), EngineError> {
    if self.session_timeout_ms <= 0 {
      return Err(EngineError::config("SESSION_TIMEOUT_MS", "must be positive"));
    }
    if self.sweep_interval_ms == 0 {
      return Err(EngineError::config("SWEEP_INTERVAL_MS", "must be positive"));
    }
    if self.rage_click_threshold < 2 {
      return Err(EngineError::config("RAGE_CLICK_THRESHOLD", "must be at least 2"));
    }
    if self.backtrack_history_len < 3 {
      return Err(EngineError::config("BACKTRACK_HISTORY_LEN", "must be at least 3"));
    }
    if self.shard_count == 0 {
      return Err(EngineError::config("SHARD_COUNT", "must be at least 1"));
    }
    if self.channel_capacity == 0 {
      return Err(EngineError::config("CHANNEL_CAPACITY", "must be at least 1"));
    }
    Ok(())
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.sweep_interval_ms)
  }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>, EngineError>
where
  F: Fn(&str) -> Option<String>,
  T: std::str::FromStr,
{
  match lookup(key) {
    Some(raw) => raw
      .trim()
      .parse::<T>()
      .map(Some)
      .map_err(|_| EngineError::config(key, &format!("invalid value {:?}", raw))),
    None => Ok(None),
  }
}
