//! Sessionizer: folds raw events into per-session state and closes idle sessions.
//!
//! Precondition: events for one key arrive in timestamp order and are handled by a
//! single owner (see `runtime`). Late events are tolerated but only widen the session.

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::score::{self, ScoreInputs};
use crate::store::{SessionState, SessionStore};
use crate::types::*;

pub struct Sessionizer {
  config: Config,
  store: SessionStore,
}

impl Sessionizer {
  pub fn new(config: Config) -> Self {
    Self {
      config,
      store: SessionStore::new(),
    }
  }

  pub fn with_defaults() -> Self {
    Self::new(Config::default())
  }

  pub fn open_sessions(&self) -> usize {
    self.store.len()
  }

  /// Fold one event into its session, creating the session on first sight.
  pub fn process(&mut self, event: &Event) {
    let state = self.store.get_or_create(event);

    if event.timestamp < state.last_ts {
      tracing::debug!(
        session = %event.key,
        ts = %event.timestamp,
        last_ts = %state.last_ts,
        "late event"
      );
    }
    state.touch(event.timestamp);
    state.visit(&event.screen_id);

    match event.event_type {
      EventType::Click => state.click_count += 1,
      EventType::FocusChange => state.context_switches += 1,
      _ => {}
    }
    if event.error_code.is_some() {
      state.error_events += 1;
    }
    if let Some(task) = &event.task {
      match task.phase {
        TaskPhase::Start => state.tasks_started += 1,
        TaskPhase::Complete => state.tasks_completed += 1,
      }
    }
    if event.version_tag.is_some() {
      state.version_tag = event.version_tag.clone();
    }
    if event.segment.is_some() {
      state.segment = event.segment.clone();
    }
  }

  /// Close every session idle for longer than the session timeout.
  ///
  /// Closed sessions are removed before their metrics are returned, so a second
  /// sweep with no new events closes nothing.
  ///
  /// Idleness is `now - last_ts` where `last_ts` is client event time. A client
  /// clock running behind `now` by more than the session timeout gets its session
  /// closed on every sweep, splitting one visit into many sessions.
  pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<SessionMetrics> {
    if self.store.is_empty() {
      return Vec::new();
    }
    let expired = self.store.expired_keys(now, self.config.session_timeout_ms);
    let mut closed = Vec::with_capacity(expired.len());
    for key in expired {
      if let Some(state) = self.store.remove(&key) {
        tracing::debug!(session = %key, idle_ms = state.idle_ms(now), "closing idle session");
        closed.push(close(key, state));
      }
    }
    closed
  }

  /// Force-close every open session.
  pub fn shutdown(&mut self) -> Vec<SessionMetrics> {
    self
      .store
      .drain()
      .into_iter()
      .map(|(key, state)| close(key, state))
      .collect()
  }
}

/// Freeze a session into its metrics snapshot.
pub fn close(key: SessionKey, state: SessionState) -> SessionMetrics {
  let unique_screens = state.screens.len() as u32;
  let duration_ms = (state.last_ts - state.start_ts).num_milliseconds();

  let inputs = ScoreInputs {
    duration_ms,
    click_count: state.click_count,
    unique_screens,
    screen_visits: state.visits,
    rage_clicks: state.rage_clicks,
    backtracks: state.backtracks,
    error_events: state.error_events,
    tasks_started: state.tasks_started,
    tasks_completed: state.tasks_completed,
  };

  SessionMetrics {
    org_id: key.org_id,
    product_id: key.product_id,
    session_id: key.session_id,
    user_hash: state.user_hash,
    start_ts: state.start_ts,
    end_ts: state.last_ts,
    duration_ms,
    click_count: state.click_count,
    unique_screens,
    rage_clicks: state.rage_clicks,
    backtracks: state.backtracks,
    context_switches: state.context_switches,
    tasks_started: state.tasks_started,
    tasks_completed: state.tasks_completed,
    error_events: state.error_events,
    frustration_score: score::frustration_score(&inputs),
    efficiency_score: score::efficiency_score(&inputs),
    version_tag: state.version_tag,
    segment: state.segment,
  }
}
