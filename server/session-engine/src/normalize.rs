//! Normalize inbound events into canonical internal Event models.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::EngineError;
use crate::types::*;

/// Decode one JSON line from events.raw. Identifiers stay readable for logging
/// even when [`normalize`] later rejects the event.
pub fn parse_line(line: &str) -> Result<InboundEvent, EngineError> {
  Ok(serde_json::from_str(line)?)
}

/// Parse and validate an InboundEvent into a canonical Event.
pub fn normalize(raw: &InboundEvent) -> Result<Event, EngineError> {
  // Required identifiers
  require("org_id", &raw.org_id)?;
  require("product_id", &raw.product_id)?;
  require("session_id", &raw.session_id)?;
  require("user_hash", &raw.user_hash)?;
  require("screen_id", &raw.screen_id)?;

  let timestamp = parse_timestamp(raw.timestamp.as_ref())?;

  if raw.event_type.trim().is_empty() {
    return Err(EngineError::validation("event_type", "must not be empty"));
  }
  let event_type = EventType::from_str_loose(&raw.event_type).ok_or_else(|| {
    EngineError::validation(
      "event_type",
      "expected click|scroll|input_meta|navigation|focus_change|custom",
    )
  })?;

  let task = parse_task(raw)?;

  Ok(Event {
    key: SessionKey::new(raw.org_id.trim(), raw.product_id.trim(), raw.session_id.trim()),
    user_hash: raw.user_hash.trim().to_string(),
    timestamp,
    event_type,
    screen_id: raw.screen_id.trim().to_string(),
    route: raw.route.trim().to_string(),
    device_type: raw.device_type.trim().to_ascii_lowercase(),
    error_code: non_empty(raw.error_code.as_deref()),
    latency_ms: raw.latency_ms,
    element_label_hash: non_empty(raw.element_label_hash.as_deref()),
    version_tag: non_empty(raw.version_tag.as_deref()),
    segment: non_empty(raw.segment.as_deref()),
    task,
    extra: raw.extra.clone(),
  })
}

fn require(field: &str, value: &str) -> Result<(), EngineError> {
  if value.trim().is_empty() {
    return Err(EngineError::validation(field, "must not be empty"));
  }
  Ok(())
}

fn non_empty(value: Option<&str>) -> Option<String> {
  value
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .map(str::to_string)
}

fn parse_timestamp(raw: Option<&InboundTimestamp>) -> Result<DateTime<Utc>, EngineError> {
  match raw {
    None => Err(EngineError::validation("timestamp", "is required")),
    Some(InboundTimestamp::Millis(ms)) => Utc
      .timestamp_millis_opt(*ms)
      .single()
      .ok_or_else(|| EngineError::validation("timestamp", "epoch millis out of range")),
    Some(InboundTimestamp::Text(s)) => {
      if let Ok(ms) = s.trim().parse::<i64>() {
        return parse_timestamp(Some(&InboundTimestamp::Millis(ms)));
      }
      DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::validation("timestamp", &format!("invalid RFC3339: {}", e)))
    }
  }
}

/// Task context comes from the typed `task` object; legacy producers put
/// `task_start` / `task_complete` into `extra` instead.
fn parse_task(raw: &InboundEvent) -> Result<Option<TaskMarker>, EngineError> {
  if let Some(task) = &raw.task {
    let phase = match task.action.trim().to_ascii_lowercase().as_str() {
      "start" | "task_start" => TaskPhase::Start,
      "complete" | "completed" | "task_complete" => TaskPhase::Complete,
      _ => return Err(EngineError::validation("task.action", "expected start|complete")),
    };
    let name = task.name.trim();
    if name.is_empty() {
      return Err(EngineError::validation("task.name", "must not be empty"));
    }
    return Ok(Some(TaskMarker {
      phase,
      name: name.to_string(),
    }));
  }

  for (key, phase) in [("task_start", TaskPhase::Start), ("task_complete", TaskPhase::Complete)] {
    if let Some(value) = raw.extra.get(key) {
      let name = value
        .as_str()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
          EngineError::validation(&format!("extra.{}", key), "must be a non-empty string")
        })?;
      return Ok(Some(TaskMarker {
        phase,
        name: name.to_string(),
      }));
    }
  }

  Ok(None)
}
