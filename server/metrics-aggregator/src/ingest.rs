//! Decode events.sessionized input lines.

use session_engine::bus::{Envelope, TOPIC_SESSIONIZED};
use session_engine::SessionMetrics;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

/// Accepts either a bus envelope or a bare SessionMetrics object.
///
/// Envelopes for other topics yield `Ok(None)` so a shared stream can be piped in.
pub fn decode_line(line: &str) -> Result<Option<SessionMetrics>, serde_json::Error> {
  let value: serde_json::Value = serde_json::from_str(line)?;
  if value.get("topic").is_some() && value.get("payload").is_some() {
    let envelope: Envelope = serde_json::from_value(value)?;
    if envelope.topic != TOPIC_SESSIONIZED {
      return Ok(None);
    }
    return serde_json::from_value(envelope.payload).map(Some);
  }
  serde_json::from_value(value).map(Some)
}

/// Forward decoded metrics from `reader` until EOF, a read error or a closed
/// channel; returns the number forwarded. A read error ends input like EOF so the
/// caller still drains what was queued.
pub async fn forward_lines<R>(reader: R, tx: &mpsc::Sender<SessionMetrics>) -> u64
where
  R: AsyncBufRead + Unpin,
{
  let mut lines = reader.lines();
  let mut forwarded = 0;
  loop {
    let line = match lines.next_line().await {
      Ok(Some(line)) => line,
      Ok(None) => break,
      Err(e) => {
        tracing::error!(error = %e, forwarded, "input read error, draining");
        break;
      }
    };
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }
    match decode_line(trimmed) {
      Ok(Some(metrics)) => {
        if tx.send(metrics).await.is_err() {
          tracing::error!("aggregator stopped accepting metrics");
          break;
        }
        forwarded += 1;
      }
      Ok(None) => {}
      Err(e) => tracing::warn!(error = %e, "dropping undecodable metrics line"),
    }
  }
  forwarded
}

#[cfg(test)]
mod tests {
  use super::*;

  const METRICS: &str = r#"{"org_id":"acme","product_id":"web","session_id":"s1","user_hash":"u",
    "start_ts":"2025-01-15T10:00:00Z","end_ts":"2025-01-15T10:05:00Z","duration_ms":300000,
    "click_count":4,"unique_screens":2,"rage_clicks":0,"backtracks":1,"context_switches":0,
    "tasks_started":1,"tasks_completed":1,"error_events":0,
    "frustration_score":0.55,"efficiency_score":0.86}"#;

  #[test]
  fn bare_metrics_line() {
    let m = decode_line(METRICS).unwrap().unwrap();
    assert_eq!(m.session_id, "s1");
    assert_eq!(m.duration_ms, 300_000);
    assert!(m.segment.is_none());
  }

  #[test]
  fn sessionized_envelope_line() {
    let line = format!(r#"{{"topic":"events.sessionized","payload":{}}}"#, METRICS);
    assert_eq!(decode_line(&line).unwrap().unwrap().click_count, 4);
  }

  #[test]
  fn other_topics_are_skipped() {
    let line = r#"{"topic":"events.incidents","payload":{"type":"rage_click"}}"#;
    assert!(decode_line(line).unwrap().is_none());
  }

  #[test]
  fn malformed_line_errors() {
    assert!(decode_line("{").is_err());
    assert!(decode_line(r#"{"org_id":"acme"}"#).is_err());
  }
}
