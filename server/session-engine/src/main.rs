//! Binary entrypoint: read events.raw JSON lines from stdin, write bus envelopes to stdout.
//!
//! Each output line is `{"topic": ..., "payload": ...}` where topic is
//! events.sessionized (SessionMetrics) or events.incidents (Incident).
//! Invalid input lines are logged to stderr and skipped.
//! On EOF or Ctrl-C every open session is force-closed and published.

use session_engine::{normalize, ChannelPublisher, Config, EngineError, Publisher, Runtime};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
  init_tracing();

  let config = match Config::from_env() {
    Ok(c) => c,
    Err(e) => {
      tracing::error!(error = %e, "invalid configuration");
      std::process::exit(1);
    }
  };
  tracing::info!(
    brokers = %config.brokers,
    shards = config.shard_count,
    session_timeout_ms = config.session_timeout_ms,
    "session-engine starting"
  );

  let (publisher, mut outbound) = ChannelPublisher::new(config.channel_capacity);
  let writer = tokio::spawn(async move {
    let mut out = BufWriter::new(tokio::io::stdout());
    while let Some(envelope) = outbound.recv().await {
      let mut line = match serde_json::to_vec(&envelope) {
        Ok(v) => v,
        Err(e) => {
          tracing::error!(topic = %envelope.topic, error = %e, "envelope encode failed");
          continue;
        }
      };
      line.push(b'\n');
      if let Err(e) = out.write_all(&line).await {
        tracing::error!(error = %e, "stdout write failed");
        break;
      }
      // Flush once the queue is momentarily empty.
      if outbound.is_empty() {
        let _ = out.flush().await;
      }
    }
    let _ = out.flush().await;
  });

  let publisher: Arc<dyn Publisher> = Arc::new(publisher);
  let runtime = Runtime::spawn(config, publisher.clone());

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut accepted: u64 = 0;
  let mut rejected: u64 = 0;

  loop {
    let line = tokio::select! {
      line = lines.next_line() => line,
      _ = tokio::signal::ctrl_c() => {
        tracing::info!("interrupt received, draining");
        break;
      }
    };

    let line = match line {
      Ok(Some(l)) => l,
      Ok(None) => break,
      Err(e) => {
        tracing::error!(error = %e, "stdin read error");
        break;
      }
    };

    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let raw = match normalize::parse_line(trimmed) {
      Ok(raw) => raw,
      Err(e) => {
        rejected += 1;
        tracing::warn!(error = %e, "dropping undecodable event");
        continue;
      }
    };
    let event = match normalize::normalize(&raw) {
      Ok(e) => e,
      Err(EngineError::Validation { field, reason }) => {
        rejected += 1;
        tracing::warn!(
          org_id = %raw.org_id,
          session_id = %raw.session_id,
          event_type = %raw.event_type,
          %field,
          %reason,
          "dropping invalid event"
        );
        continue;
      }
      Err(e) => {
        rejected += 1;
        tracing::warn!(
          org_id = %raw.org_id,
          session_id = %raw.session_id,
          error = %e,
          "dropping invalid event"
        );
        continue;
      }
    };

    if let Err(e) = runtime.dispatch(event).await {
      tracing::error!(error = %e, "runtime stopped accepting events");
      break;
    }
    accepted += 1;
  }

  runtime.shutdown().await;
  drop(publisher);
  if let Err(e) = writer.await {
    tracing::error!(error = %e, "output writer failed");
  }
  tracing::info!(accepted, rejected, "session-engine stopped");
}

fn init_tracing() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();
}
