//! Derived session scores: frustration and efficiency.

/// Session length (ms) at which the duration factor starts to fall below 1.
const EFFICIENT_DURATION_MS: f64 = 300_000.0;
/// Clicks per completed task considered efficient.
const EFFICIENT_CLICKS_PER_TASK: f64 = 5.0;

pub fn sigmoid(x: f64) -> f64 {
  1.0 / (1.0 + (-x).exp())
}

/// Counters a closed session contributes to its scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInputs {
  pub duration_ms: i64,
  pub click_count: u32,
  pub unique_screens: u32,
  /// Screen visits with immediate repeats collapsed.
  pub screen_visits: u32,
  pub rage_clicks: u32,
  pub backtracks: u32,
  pub error_events: u32,
  pub tasks_started: u32,
  pub tasks_completed: u32,
}

/// sigmoid(0.3·rage + 0.2·backtracks + 0.4·errors + 0.1·unfinished tasks)
pub fn frustration_score(s: &ScoreInputs) -> f64 {
  let unfinished = s.tasks_started.saturating_sub(s.tasks_completed) as f64;
  sigmoid(
    0.3 * s.rage_clicks as f64
      + 0.2 * s.backtracks as f64
      + 0.4 * s.error_events as f64
      + 0.1 * unfinished,
  )
}

/// sigmoid(2 · (0.5·duration + 0.3·clicks + 0.2·navigation)), each factor in [0, 1].
pub fn efficiency_score(s: &ScoreInputs) -> f64 {
  let duration_factor = (EFFICIENT_DURATION_MS / s.duration_ms.max(1) as f64).min(1.0);

  let clicks_per_task = s.click_count as f64 / s.tasks_completed.max(1) as f64;
  let clicks_factor = if clicks_per_task > 0.0 {
    (EFFICIENT_CLICKS_PER_TASK / clicks_per_task).min(1.0)
  } else {
    1.0
  };

  let nav_factor = if s.screen_visits == 0 {
    1.0
  } else {
    s.unique_screens as f64 / s.screen_visits as f64
  };

  sigmoid(2.0 * (0.5 * duration_factor + 0.3 * clicks_factor + 0.2 * nav_factor))
}
