//! Core types for the session engine (wire contracts + internal models).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

// ---------------------------------------------------------------------------
// Inbound types (wire contract for events.raw)
// ---------------------------------------------------------------------------

/// One raw interaction event as published by the ingestion layer.
///
/// Every field defaults so that a missing field surfaces as a validation error
/// naming that field rather than an opaque JSON error. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundEvent {
  #[serde(default, alias = "orgId")]
  pub org_id: String,
  #[serde(default, alias = "productId")]
  pub product_id: String,
  #[serde(default, alias = "sessionId")]
  pub session_id: String,
  #[serde(default, alias = "userHash")]
  pub user_hash: String,
  #[serde(default)]
  pub timestamp: Option<InboundTimestamp>,
  #[serde(default, alias = "eventType")]
  pub event_type: String,
  #[serde(default, alias = "screenId")]
  pub screen_id: String,
  #[serde(default)]
  pub route: String,
  #[serde(default, alias = "deviceType")]
  pub device_type: String,
  #[serde(default, alias = "errorCode")]
  pub error_code: Option<String>,
  #[serde(default, alias = "latencyMs")]
  pub latency_ms: Option<u64>,
  #[serde(default, alias = "elementLabelHash")]
  pub element_label_hash: Option<String>,
  #[serde(default, alias = "versionTag")]
  pub version_tag: Option<String>,
  #[serde(default)]
  pub segment: Option<String>,
  #[serde(default)]
  pub task: Option<InboundTask>,
  #[serde(default)]
  pub extra: HashMap<String, serde_json::Value>,
}

/// Producers send either epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboundTimestamp {
  Millis(i64),
  Text(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundTask {
  pub action: String,
  pub name: String,
}

// ---------------------------------------------------------------------------
// Event type enum (normalized)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
  Click,
  Scroll,
  InputMeta,
  Navigation,
  FocusChange,
  Custom,
}

impl EventType {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
      "click" => Some(Self::Click),
      "scroll" => Some(Self::Scroll),
      "input_meta" | "input" => Some(Self::InputMeta),
      "navigation" | "nav" => Some(Self::Navigation),
      "focus_change" | "focus" => Some(Self::FocusChange),
      "custom" => Some(Self::Custom),
      _ => None,
    }
  }
}

// ---------------------------------------------------------------------------
// Internal normalized types
// ---------------------------------------------------------------------------

/// Identity of a session; also the sharding key of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
  pub org_id: String,
  pub product_id: String,
  pub session_id: String,
}

impl SessionKey {
  pub fn new(
    org_id: impl Into<String>,
    product_id: impl Into<String>,
    session_id: impl Into<String>,
  ) -> Self {
    Self {
      org_id: org_id.into(),
      product_id: product_id.into(),
      session_id: session_id.into(),
    }
  }
}

impl fmt::Display for SessionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.org_id, self.product_id, self.session_id)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
  Start,
  Complete,
}

/// Typed task context, validated at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskMarker {
  pub phase: TaskPhase,
  pub name: String,
}

/// Canonical internal event after normalization + validation.
#[derive(Debug, Clone)]
pub struct Event {
  pub key: SessionKey,
  pub user_hash: String,
  pub timestamp: DateTime<Utc>,
  pub event_type: EventType,
  pub screen_id: String,
  pub route: String,
  pub device_type: String,
  pub error_code: Option<String>,
  pub latency_ms: Option<u64>,
  pub element_label_hash: Option<String>,
  pub version_tag: Option<String>,
  pub segment: Option<String>,
  pub task: Option<TaskMarker>,
  pub extra: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Output types (events.sessionized)
// ---------------------------------------------------------------------------

/// Snapshot of a closed session. One row of the session facts table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
  pub org_id: String,
  pub product_id: String,
  pub session_id: String,
  pub user_hash: String,
  pub start_ts: DateTime<Utc>,
  pub end_ts: DateTime<Utc>,
  pub duration_ms: i64,
  pub click_count: u32,
  pub unique_screens: u32,
  pub rage_clicks: u32,
  pub backtracks: u32,
  pub context_switches: u32,
  pub tasks_started: u32,
  pub tasks_completed: u32,
  pub error_events: u32,
  pub frustration_score: f64,
  pub efficiency_score: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version_tag: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub segment: Option<String>,
}

// ---------------------------------------------------------------------------
// Output types (events.incidents)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
  RageClick,
  Backtrack,
  AbandonedTask,
}

impl IncidentType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::RageClick => "rage_click",
      Self::Backtrack => "backtrack",
      Self::AbandonedTask => "abandoned_task",
    }
  }
}

/// A detected friction pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
  pub incident_id: String,
  #[serde(rename = "type")]
  pub incident_type: IncidentType,
  pub org_id: String,
  pub product_id: String,
  pub session_id: String,
  pub user_hash: String,
  pub screen_id: String,
  pub route: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub metadata: BTreeMap<String, String>,
}
