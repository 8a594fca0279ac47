//! Incident detector: rage clicks, navigation backtracks and abandoned tasks.
//!
//! Runs over the same raw feed as the Sessionizer but keeps its own short-lived
//! window state; nothing here is persisted or shared with the Sessionizer.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::config::Config;
use crate::types::*;

/// Trailing clicks on one element of one screen in one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClickKey {
  session: SessionKey,
  screen_id: String,
  element: String,
}

#[derive(Debug, Clone)]
struct ScreenVisit {
  screen_id: String,
  /// Last activity on this screen before the user moved on.
  last_seen: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionWindows {
  visits: VecDeque<ScreenVisit>,
  /// Open tasks by name -> start marker time.
  open_tasks: HashMap<String, DateTime<Utc>>,
  last_ts: DateTime<Utc>,
}

impl SessionWindows {
  fn new(ts: DateTime<Utc>) -> Self {
    Self {
      visits: VecDeque::new(),
      open_tasks: HashMap::new(),
      last_ts: ts,
    }
  }
}

pub struct IncidentDetector {
  config: Config,
  clicks: HashMap<ClickKey, VecDeque<DateTime<Utc>>>,
  sessions: HashMap<SessionKey, SessionWindows>,
}

impl IncidentDetector {
  pub fn new(config: Config) -> Self {
    Self {
      config,
      clicks: HashMap::new(),
      sessions: HashMap::new(),
    }
  }

  pub fn with_defaults() -> Self {
    Self::new(Config::default())
  }

  /// Sessions with any live window or task state.
  pub fn tracked_sessions(&self) -> usize {
    self.sessions.len()
  }

  pub fn open_tasks(&self) -> usize {
    self.sessions.values().map(|w| w.open_tasks.len()).sum()
  }

  /// Run all three matchers over one event.
  pub fn process(&mut self, event: &Event) -> Vec<Incident> {
    let mut incidents = Vec::new();

    if let Some(incident) = self.match_rage_click(event) {
      incidents.push(incident);
    }

    let windows = self
      .sessions
      .entry(event.key.clone())
      .or_insert_with(|| SessionWindows::new(event.timestamp));
    if event.timestamp > windows.last_ts {
      windows.last_ts = event.timestamp;
    }

    if let Some(incident) = match_backtrack(windows, event, &self.config) {
      incidents.push(incident);
    }
    incidents.extend(match_abandoned_tasks(windows, event, &self.config));

    for incident in &incidents {
      tracing::debug!(
        session = %event.key,
        incident = incident.incident_type.as_str(),
        screen = %incident.screen_id,
        "incident detected"
      );
    }
    incidents
  }

  fn match_rage_click(&mut self, event: &Event) -> Option<Incident> {
    if event.event_type != EventType::Click {
      return None;
    }
    let element = event.element_label_hash.as_ref()?;
    let key = ClickKey {
      session: event.key.clone(),
      screen_id: event.screen_id.clone(),
      element: element.clone(),
    };

    let window = self.clicks.entry(key.clone()).or_default();
    window.push_back(event.timestamp);
    while let Some(&oldest) = window.front() {
      if (event.timestamp - oldest).num_milliseconds() > self.config.rage_click_window_ms {
        window.pop_front();
      } else {
        break;
      }
    }

    if window.len() < self.config.rage_click_threshold {
      return None;
    }
    let count = window.len();
    // Clear so the rest of this burst cannot fire again.
    self.clicks.remove(&key);

    let mut metadata = BTreeMap::new();
    metadata.insert("element_label_hash".to_string(), element.clone());
    metadata.insert("click_count".to_string(), count.to_string());
    metadata.insert(
      "window_ms".to_string(),
      self.config.rage_click_window_ms.to_string(),
    );
    Some(build_incident(IncidentType::RageClick, event, element, metadata))
  }

  /// Drop all state of sessions idle longer than `idle_ms`, and click windows
  /// that can no longer reach the threshold.
  ///
  /// Idleness is measured against client event time, so a client clock behind
  /// `now` by more than `idle_ms` loses its windows and open tasks on every prune.
  pub fn prune(&mut self, now: DateTime<Utc>, idle_ms: i64) -> usize {
    let before = self.sessions.len();
    self
      .sessions
      .retain(|_, w| (now - w.last_ts).num_milliseconds() <= idle_ms);
    let window_ms = self.config.rage_click_window_ms;
    let sessions = &self.sessions;
    self.clicks.retain(|key, window| {
      sessions.contains_key(&key.session)
        && window
          .back()
          .map(|last| (now - *last).num_milliseconds() <= window_ms)
          .unwrap_or(false)
    });
    before - self.sessions.len()
  }
}

/// A -> B -> A where the return happens within the backtrack window of leaving A.
fn match_backtrack(windows: &mut SessionWindows, event: &Event, config: &Config) -> Option<Incident> {
  if let Some(current) = windows.visits.back_mut() {
    if current.screen_id == event.screen_id {
      if event.timestamp > current.last_seen {
        current.last_seen = event.timestamp;
      }
      return None;
    }
  }

  windows.visits.push_back(ScreenVisit {
    screen_id: event.screen_id.clone(),
    last_seen: event.timestamp,
  });
  while windows.visits.len() > config.backtrack_history_len {
    windows.visits.pop_front();
  }

  let n = windows.visits.len();
  if n < 3 {
    return None;
  }
  let origin = &windows.visits[n - 3];
  let via = &windows.visits[n - 2];
  let current = &windows.visits[n - 1];
  if current.screen_id != origin.screen_id || via.screen_id == current.screen_id {
    return None;
  }

  let elapsed_ms = (event.timestamp - origin.last_seen).num_milliseconds();
  if elapsed_ms > config.backtrack_window_ms {
    return None;
  }

  let mut metadata = BTreeMap::new();
  metadata.insert("from_screen".to_string(), origin.screen_id.clone());
  metadata.insert("via_screen".to_string(), via.screen_id.clone());
  metadata.insert("elapsed_ms".to_string(), elapsed_ms.to_string());
  let discriminator = via.screen_id.clone();
  Some(build_incident(IncidentType::Backtrack, event, &discriminator, metadata))
}

/// Completion closes a task; any later event past the abandon timeout fires once.
fn match_abandoned_tasks(
  windows: &mut SessionWindows,
  event: &Event,
  config: &Config,
) -> Vec<Incident> {
  if let Some(TaskMarker {
    phase: TaskPhase::Complete,
    name,
  }) = &event.task
  {
    windows.open_tasks.remove(name);
  }

  let mut expired: Vec<(String, DateTime<Utc>)> = windows
    .open_tasks
    .iter()
    .filter(|(_, started)| (event.timestamp - **started).num_milliseconds() > config.abandon_timeout_ms)
    .map(|(name, started)| (name.clone(), *started))
    .collect();
  expired.sort();

  let mut incidents = Vec::with_capacity(expired.len());
  for (name, started) in expired {
    windows.open_tasks.remove(&name);
    let mut metadata = BTreeMap::new();
    metadata.insert("task_name".to_string(), name.clone());
    metadata.insert("started_at".to_string(), started.to_rfc3339());
    metadata.insert(
      "open_ms".to_string(),
      (event.timestamp - started).num_milliseconds().to_string(),
    );
    incidents.push(build_incident(IncidentType::AbandonedTask, event, &name, metadata));
  }

  if let Some(TaskMarker {
    phase: TaskPhase::Start,
    name,
  }) = &event.task
  {
    windows
      .open_tasks
      .entry(name.clone())
      .or_insert(event.timestamp);
  }

  incidents
}

fn build_incident(
  incident_type: IncidentType,
  event: &Event,
  discriminator: &str,
  metadata: BTreeMap<String, String>,
) -> Incident {
  // Stable ID: redelivery of the same event yields the same incident id.
  let incident_id = {
    let mut hasher = blake3::Hasher::new();
    hasher.update(incident_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(event.key.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(event.screen_id.as_bytes());
    hasher.update(b"|");
    hasher.update(discriminator.as_bytes());
    hasher.update(b"|");
    hasher.update(&event.timestamp.timestamp_millis().to_le_bytes());
    let hex = hasher.finalize().to_hex();
    format!("inc-{}", &hex[..16])
  };

  Incident {
    incident_id,
    incident_type,
    org_id: event.key.org_id.clone(),
    product_id: event.key.product_id.clone(),
    session_id: event.key.session_id.clone(),
    user_hash: event.user_hash.clone(),
    screen_id: event.screen_id.clone(),
    route: event.route.clone(),
    timestamp: event.timestamp,
    metadata,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn t(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_736_937_000_000 + ms).unwrap()
  }

  fn make_event(event_type: EventType, screen: &str, element: Option<&str>, ms: i64) -> Event {
    Event {
      key: SessionKey::new("org", "web", "s1"),
      user_hash: "user-1".into(),
      timestamp: t(ms),
      event_type,
      screen_id: screen.into(),
      route: format!("/{}", screen),
      device_type: "desktop".into(),
      error_code: None,
      latency_ms: None,
      element_label_hash: element.map(str::to_string),
      version_tag: None,
      segment: None,
      task: None,
      extra: HashMap::new(),
    }
  }

  fn click(screen: &str, element: &str, ms: i64) -> Event {
    make_event(EventType::Click, screen, Some(element), ms)
  }

  fn nav(screen: &str, ms: i64) -> Event {
    make_event(EventType::Navigation, screen, None, ms)
  }

  fn task(phase: TaskPhase, name: &str, ms: i64) -> Event {
    let mut e = make_event(EventType::Custom, "checkout", None, ms);
    e.task = Some(TaskMarker {
      phase,
      name: name.into(),
    });
    e
  }

  fn run(detector: &mut IncidentDetector, events: &[Event]) -> Vec<Incident> {
    events.iter().flat_map(|e| detector.process(e)).collect()
  }

  fn of_type(incidents: &[Incident], kind: IncidentType) -> Vec<&Incident> {
    incidents.iter().filter(|i| i.incident_type == kind).collect()
  }

  #[test]
  fn three_clicks_in_window_fire_once() {
    let mut d = IncidentDetector::with_defaults();
    let out = run(
      &mut d,
      &[
        click("a", "btn", 0),
        click("a", "btn", 500),
        click("a", "btn", 1_200),
        click("a", "btn", 1_400),
      ],
    );
    let rage = of_type(&out, IncidentType::RageClick);
    assert_eq!(rage.len(), 1);
    assert_eq!(rage[0].timestamp, t(1_200));
    assert_eq!(rage[0].metadata["click_count"], "3");
  }

  #[test]
  fn clicks_spread_beyond_window_do_not_fire() {
    let mut d = IncidentDetector::with_defaults();
    let out = run(
      &mut d,
      &[click("a", "btn", 0), click("a", "btn", 1_500), click("a", "btn", 3_000)],
    );
    assert!(of_type(&out, IncidentType::RageClick).is_empty());
  }

  #[test]
  fn different_elements_are_separate_windows() {
    let mut d = IncidentDetector::with_defaults();
    let out = run(
      &mut d,
      &[click("a", "x", 0), click("a", "y", 100), click("a", "x", 200), click("b", "x", 300)],
    );
    assert!(of_type(&out, IncidentType::RageClick).is_empty());
  }

  #[test]
  fn clicks_without_element_are_ignored() {
    let mut d = IncidentDetector::with_defaults();
    let events: Vec<Event> = (0..5)
      .map(|i| make_event(EventType::Click, "a", None, i * 100))
      .collect();
    assert!(of_type(&run(&mut d, &events), IncidentType::RageClick).is_empty());
  }

  #[test]
  fn a_b_a_is_one_backtrack() {
    let mut d = IncidentDetector::with_defaults();
    let out = run(&mut d, &[nav("a", 0), nav("b", 2_000), nav("a", 4_000), click("a", "btn", 5_000)]);
    let backtracks = of_type(&out, IncidentType::Backtrack);
    assert_eq!(backtracks.len(), 1);
    assert_eq!(backtracks[0].metadata["from_screen"], "a");
    assert_eq!(backtracks[0].metadata["via_screen"], "b");
  }

  #[test]
  fn a_b_c_is_not_a_backtrack() {
    let mut d = IncidentDetector::with_defaults();
    let out = run(&mut d, &[nav("a", 0), nav("b", 1_000), nav("c", 2_000)]);
    assert!(of_type(&out, IncidentType::Backtrack).is_empty());
  }

  #[test]
  fn backtrack_window_uses_recorded_visit_time() {
    // Left "a" at 0s, came back at 26s: outside the 20s window.
    let mut d = IncidentDetector::with_defaults();
    let out = run(&mut d, &[nav("a", 0), nav("b", 25_000), nav("a", 26_000)]);
    assert!(of_type(&out, IncidentType::Backtrack).is_empty());

    // Stayed on "a" until 10s, so returning at 14s is a 4s oscillation.
    let mut d = IncidentDetector::with_defaults();
    let out = run(
      &mut d,
      &[nav("a", 0), click("a", "btn", 10_000), nav("b", 12_000), nav("a", 14_000)],
    );
    let backtracks = of_type(&out, IncidentType::Backtrack);
    assert_eq!(backtracks.len(), 1);
    assert_eq!(backtracks[0].metadata["elapsed_ms"], "4000");
  }

  #[test]
  fn visit_history_is_bounded() {
    let config = Config::default();
    let mut d = IncidentDetector::new(config.clone());
    for i in 0..50 {
      d.process(&nav(&format!("s{}", i), i * 100));
    }
    let windows = d.sessions.get(&SessionKey::new("org", "web", "s1")).unwrap();
    assert_eq!(windows.visits.len(), config.backtrack_history_len);
  }

  #[test]
  fn unfinished_task_is_abandoned_once() {
    let mut d = IncidentDetector::with_defaults();
    let out = run(
      &mut d,
      &[
        task(TaskPhase::Start, "checkout", 0),
        nav("cart", 5 * 60_000),
        nav("home", 16 * 60_000),
        nav("cart", 17 * 60_000),
      ],
    );
    let abandoned = of_type(&out, IncidentType::AbandonedTask);
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].metadata["task_name"], "checkout");
    assert_eq!(abandoned[0].timestamp, t(16 * 60_000));
    assert_eq!(d.open_tasks(), 0);
  }

  #[test]
  fn completed_task_is_not_abandoned() {
    let mut d = IncidentDetector::with_defaults();
    let out = run(
      &mut d,
      &[
        task(TaskPhase::Start, "checkout", 0),
        task(TaskPhase::Complete, "checkout", 10 * 60_000),
        nav("home", 20 * 60_000),
      ],
    );
    assert!(of_type(&out, IncidentType::AbandonedTask).is_empty());
  }

  #[test]
  fn tasks_are_tracked_by_name() {
    let mut d = IncidentDetector::with_defaults();
    let out = run(
      &mut d,
      &[
        task(TaskPhase::Start, "checkout", 0),
        task(TaskPhase::Start, "search", 60_000),
        task(TaskPhase::Complete, "search", 120_000),
        nav("home", 16 * 60_000),
      ],
    );
    let abandoned = of_type(&out, IncidentType::AbandonedTask);
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].metadata["task_name"], "checkout");
  }

  #[test]
  fn prune_drops_idle_sessions() {
    let mut d = IncidentDetector::with_defaults();
    run(&mut d, &[task(TaskPhase::Start, "checkout", 0), click("a", "btn", 100)]);
    assert_eq!(d.tracked_sessions(), 1);
    assert_eq!(d.prune(t(10 * 60_000), 30 * 60_000), 0);
    assert!(d.clicks.is_empty());
    assert_eq!(d.prune(t(31 * 60_000), 30 * 60_000), 1);
    assert_eq!(d.open_tasks(), 0);
  }

  #[test]
  fn incident_ids_are_stable() {
    let events = [click("a", "btn", 0), click("a", "btn", 100), click("a", "btn", 200)];
    let a = run(&mut IncidentDetector::with_defaults(), &events);
    let b = run(&mut IncidentDetector::with_defaults(), &events);
    assert_eq!(a[0].incident_id, b[0].incident_id);
    assert!(a[0].incident_id.starts_with("inc-"));
  }
}
