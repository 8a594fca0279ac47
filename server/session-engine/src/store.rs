//! Session State Store: the table of currently open sessions for one shard.
//!
//! Owned by exactly one Sessionizer; never shared across workers.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::types::{Event, SessionKey};

/// Mutable per-session accumulator.
#[derive(Debug, Clone)]
pub struct SessionState {
  pub user_hash: String,
  pub start_ts: DateTime<Utc>,
  pub last_ts: DateTime<Utc>,
  /// Screen before `current_screen`, for A -> B -> A detection.
  pub previous_screen: Option<String>,
  pub current_screen: Option<String>,
  /// Distinct screens seen in this session.
  pub screens: HashSet<String>,
  /// Screen visits with immediate duplicates collapsed.
  pub visits: u32,
  pub click_count: u32,
  pub rage_clicks: u32,
  pub backtracks: u32,
  pub context_switches: u32,
  pub tasks_started: u32,
  pub tasks_completed: u32,
  pub error_events: u32,
  pub version_tag: Option<String>,
  pub segment: Option<String>,
}

impl SessionState {
  pub fn new(event: &Event) -> Self {
    Self {
      user_hash: event.user_hash.clone(),
      start_ts: event.timestamp,
      last_ts: event.timestamp,
      previous_screen: None,
      current_screen: None,
      screens: HashSet::new(),
      visits: 0,
      click_count: 0,
      rage_clicks: 0,
      backtracks: 0,
      context_switches: 0,
      tasks_started: 0,
      tasks_completed: 0,
      error_events: 0,
      version_tag: None,
      segment: None,
    }
  }

  /// Record a screen visit unless it repeats the current screen.
  ///
  /// Only the last two screens are kept; returning to the screen before the
  /// current one counts a backtrack.
  pub fn visit(&mut self, screen_id: &str) {
    if self.current_screen.as_deref() == Some(screen_id) {
      return;
    }
    if self.previous_screen.as_deref() == Some(screen_id) {
      self.backtracks += 1;
    }
    self.previous_screen = self.current_screen.take();
    self.current_screen = Some(screen_id.to_string());
    if !self.screens.contains(screen_id) {
      self.screens.insert(screen_id.to_string());
    }
    self.visits += 1;
  }

  /// Advance the activity clock. Late events widen the start but never rewind `last_ts`.
  pub fn touch(&mut self, ts: DateTime<Utc>) {
    if ts > self.last_ts {
      self.last_ts = ts;
    }
    if ts < self.start_ts {
      self.start_ts = ts;
    }
  }

  pub fn idle_ms(&self, now: DateTime<Utc>) -> i64 {
    (now - self.last_ts).num_milliseconds()
  }
}

/// Arena of open sessions keyed by (org_id, product_id, session_id).
#[derive(Debug, Default)]
pub struct SessionStore {
  sessions: HashMap<SessionKey, SessionState>,
}

impl SessionStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Existing state for the event's key, or a fresh one seeded from the event.
  pub fn get_or_create(&mut self, event: &Event) -> &mut SessionState {
    self
      .sessions
      .entry(event.key.clone())
      .or_insert_with(|| SessionState::new(event))
  }

  pub fn remove(&mut self, key: &SessionKey) -> Option<SessionState> {
    self.sessions.remove(key)
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }

  /// Keys idle for strictly longer than `timeout_ms`, sorted for deterministic output.
  pub fn expired_keys(&self, now: DateTime<Utc>, timeout_ms: i64) -> Vec<SessionKey> {
    let mut keys: Vec<SessionKey> = self
      .sessions
      .iter()
      .filter(|(_, state)| state.idle_ms(now) > timeout_ms)
      .map(|(key, _)| key.clone())
      .collect();
    keys.sort();
    keys
  }

  /// Remove every open session.
  pub fn drain(&mut self) -> Vec<(SessionKey, SessionState)> {
    let mut all: Vec<_> = self.sessions.drain().collect();
    all.sort_by(|a, b| a.0.cmp(&b.0));
    all
  }
}
