//! Integration tests for the metrics aggregator, against an in-memory sink.

use chrono::{DateTime, Duration, Utc};
use metrics_aggregator::{
  Aggregator, Config, FlushOutcome, MetricsSink, SinkError, SinkFuture,
};
use session_engine::SessionMetrics;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct MemorySink {
  /// Fail this many write attempts before succeeding.
  failures: Mutex<usize>,
  batches: Mutex<Vec<Vec<String>>>,
  attempts: Mutex<usize>,
  dead: Mutex<Vec<(usize, String, u32)>>,
}

impl MemorySink {
  fn failing(times: usize) -> Self {
    Self {
      failures: Mutex::new(times),
      ..Default::default()
    }
  }

  fn batch_sizes(&self) -> Vec<usize> {
    self.batches.lock().unwrap().iter().map(Vec::len).collect()
  }
}

impl MetricsSink for MemorySink {
  fn provision(&self) -> SinkFuture<'_, ()> {
    Box::pin(async { Ok(()) })
  }

  fn write_batch<'a>(&'a self, rows: &'a [SessionMetrics]) -> SinkFuture<'a, u64> {
    *self.attempts.lock().unwrap() += 1;
    let result = {
      let mut failures = self.failures.lock().unwrap();
      if *failures > 0 {
        *failures -= 1;
        Err(SinkError::Unavailable("connection refused".into()))
      } else {
        self
          .batches
          .lock()
          .unwrap()
          .push(rows.iter().map(|m| m.session_id.clone()).collect());
        Ok(rows.len() as u64)
      }
    };
    Box::pin(async move { result })
  }

  fn dead_letter<'a>(
    &'a self,
    rows: &'a [SessionMetrics],
    reason: &'a str,
    attempts: u32,
  ) -> SinkFuture<'a, ()> {
    self
      .dead
      .lock()
      .unwrap()
      .push((rows.len(), reason.to_string(), attempts));
    Box::pin(async { Ok(()) })
  }
}

fn metrics(i: usize) -> SessionMetrics {
  let start: DateTime<Utc> = DateTime::parse_from_rfc3339("2025-01-15T10:00:00Z")
    .unwrap()
    .with_timezone(&Utc);
  SessionMetrics {
    org_id: "acme".into(),
    product_id: "web".into(),
    session_id: format!("s-{}", i),
    user_hash: "u".into(),
    start_ts: start,
    end_ts: start + Duration::seconds(90),
    duration_ms: 90_000,
    click_count: 3,
    unique_screens: 2,
    rage_clicks: 0,
    backtracks: 0,
    context_switches: 0,
    tasks_started: 0,
    tasks_completed: 0,
    error_events: 0,
    frustration_score: 0.5,
    efficiency_score: 0.88,
    version_tag: None,
    segment: None,
  }
}

fn fast_retry_config() -> Config {
  Config {
    backoff_base_ms: 0,
    backoff_max_ms: 0,
    ..Config::default()
  }
}

#[tokio::test]
async fn batches_of_one_hundred_then_remainder() {
  let sink = Arc::new(MemorySink::default());
  let mut aggregator = Aggregator::new(Config::default(), sink.clone());

  for i in 0..250 {
    aggregator.push(metrics(i)).await;
  }
  assert_eq!(sink.batch_sizes(), vec![100, 100]);
  assert_eq!(aggregator.pending(), 50);

  aggregator.drain().await;
  assert_eq!(sink.batch_sizes(), vec![100, 100, 50]);

  let stats = aggregator.stats().snapshot();
  assert_eq!(stats.received, 250);
  assert_eq!(stats.flushes, 3);
  assert_eq!(stats.flushed_rows, 250);
  assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn failed_batch_is_requeued_in_order() {
  let sink = Arc::new(MemorySink::failing(1));
  let mut aggregator = Aggregator::new(
    Config {
      batch_size: 3,
      ..fast_retry_config()
    },
    sink.clone(),
  );

  for i in 0..3 {
    aggregator.push(metrics(i)).await;
  }
  assert_eq!(aggregator.pending(), 3);
  assert!(sink.batch_sizes().is_empty());

  aggregator.push(metrics(3)).await;
  let batches = sink.batches.lock().unwrap().clone();
  assert_eq!(batches, vec![vec!["s-0", "s-1", "s-2"]]);
  assert_eq!(aggregator.pending(), 1);
}

#[tokio::test]
async fn backoff_defers_the_next_attempt() {
  let sink = Arc::new(MemorySink::failing(1));
  let mut aggregator = Aggregator::new(
    Config {
      batch_size: 2,
      backoff_base_ms: 60_000,
      ..Config::default()
    },
    sink.clone(),
  );
  aggregator.push(metrics(0)).await;
  aggregator.push(metrics(1)).await;

  let outcome = aggregator.flush(tokio::time::Instant::now()).await;
  assert_eq!(outcome, FlushOutcome::Deferred);
  assert_eq!(*sink.attempts.lock().unwrap(), 1);

  let later = tokio::time::Instant::now() + std::time::Duration::from_secs(61);
  assert_eq!(aggregator.flush(later).await, FlushOutcome::Flushed(2));
}

#[tokio::test]
async fn exhausted_retries_go_to_dead_letter() {
  let sink = Arc::new(MemorySink::failing(usize::MAX));
  let mut aggregator = Aggregator::new(
    Config {
      batch_size: 10,
      max_retries: 2,
      ..fast_retry_config()
    },
    sink.clone(),
  );
  for i in 0..4 {
    aggregator.push(metrics(i)).await;
  }

  let now = tokio::time::Instant::now();
  assert_eq!(
    aggregator.flush(now).await,
    FlushOutcome::Requeued { rows: 4, attempt: 1 }
  );
  assert_eq!(
    aggregator.flush(now).await,
    FlushOutcome::Requeued { rows: 4, attempt: 2 }
  );
  assert_eq!(aggregator.flush(now).await, FlushOutcome::DeadLettered(4));
  assert_eq!(aggregator.pending(), 0);

  let dead = sink.dead.lock().unwrap().clone();
  assert_eq!(dead.len(), 1);
  assert_eq!(dead[0].0, 4);
  assert!(dead[0].1.contains("connection refused"));
  assert_eq!(dead[0].2, 3);
  assert_eq!(aggregator.stats().snapshot().dead_lettered, 4);
}

#[tokio::test]
async fn run_flushes_remainder_on_shutdown() {
  let sink = Arc::new(MemorySink::default());
  let aggregator = Aggregator::new(
    Config {
      batch_size: 4,
      ..Config::default()
    },
    sink.clone(),
  );
  let stats = aggregator.stats();
  let (tx, rx) = mpsc::channel(64);
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let worker = tokio::spawn(aggregator.run(rx, shutdown_rx));

  for i in 0..10 {
    tx.send(metrics(i)).await.unwrap();
  }
  drop(tx);
  worker.await.unwrap();
  drop(shutdown_tx);

  let mut sizes = sink.batch_sizes();
  sizes.sort_unstable();
  assert_eq!(sizes.iter().sum::<usize>(), 10);
  assert_eq!(sizes, vec![2, 4, 4]);
  assert_eq!(stats.snapshot().pending, 0);
}

#[tokio::test(start_paused = true)]
async fn flush_interval_writes_partial_batch() {
  let sink = Arc::new(MemorySink::default());
  let aggregator = Aggregator::new(
    Config {
      batch_size: 100,
      flush_interval_ms: 10_000,
      ..Config::default()
    },
    sink.clone(),
  );
  let stats = aggregator.stats();
  let (tx, rx) = mpsc::channel(64);
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let worker = tokio::spawn(aggregator.run(rx, shutdown_rx));

  for i in 0..7 {
    tx.send(metrics(i)).await.unwrap();
  }
  tokio::time::sleep(std::time::Duration::from_millis(5_000)).await;
  assert!(sink.batch_sizes().is_empty());
  assert_eq!(stats.snapshot().pending, 7);

  tokio::time::sleep(std::time::Duration::from_millis(5_500)).await;
  assert_eq!(sink.batch_sizes(), vec![7]);
  assert_eq!(stats.snapshot().pending, 0);

  shutdown_tx.send(true).unwrap();
  worker.await.unwrap();
  assert_eq!(sink.batch_sizes(), vec![7]);
}

/// Yields an error on every read, like a stdin pipe that broke mid-stream.
struct BrokenPipe;

impl tokio::io::AsyncRead for BrokenPipe {
  fn poll_read(
    self: std::pin::Pin<&mut Self>,
    _cx: &mut std::task::Context<'_>,
    _buf: &mut tokio::io::ReadBuf<'_>,
  ) -> std::task::Poll<std::io::Result<()>> {
    std::task::Poll::Ready(Err(std::io::Error::new(
      std::io::ErrorKind::BrokenPipe,
      "input closed",
    )))
  }
}

#[tokio::test]
async fn read_error_still_drains_queued_rows() {
  use tokio::io::AsyncReadExt;

  let sink = Arc::new(MemorySink::default());
  let aggregator = Aggregator::new(Config::default(), sink.clone());
  let (tx, rx) = mpsc::channel(64);
  let (_shutdown_tx, shutdown_rx) = watch::channel(false);
  let worker = tokio::spawn(aggregator.run(rx, shutdown_rx));

  let mut input = String::new();
  for i in 0..3 {
    input.push_str(&serde_json::to_string(&metrics(i)).unwrap());
    input.push('\n');
  }
  input.push_str("not json\n");
  let reader = tokio::io::BufReader::new(std::io::Cursor::new(input.into_bytes()).chain(BrokenPipe));

  let forwarded = metrics_aggregator::ingest::forward_lines(reader, &tx).await;
  assert_eq!(forwarded, 3);

  drop(tx);
  worker.await.unwrap();
  assert_eq!(sink.batch_sizes(), vec![3]);
}
