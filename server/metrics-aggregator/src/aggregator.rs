//! Batching aggregator: accumulate SessionMetrics, flush to the sink by size or timer.
//!
//! Per batch: accumulating -> flushing -> accumulating (success) or
//! accumulating with the batch requeued at the front (failure). A failed batch is
//! retried with exponential backoff and dead-lettered once `max_retries` is exceeded,
//! so a sustained outage cannot grow memory without bound.
//!
//! A size-triggered flush runs inline in the consume loop: a slow sink stalls
//! consumption for up to `write_timeout`, pushing backpressure onto the channel.

use serde::Serialize;
use session_engine::SessionMetrics;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::Config;
use crate::error::SinkError;
use crate::sink::MetricsSink;

/// Counters shared with the HTTP stats endpoint.
#[derive(Debug, Default)]
pub struct AggregatorStats {
  pub received: AtomicU64,
  pub flushes: AtomicU64,
  pub flushed_rows: AtomicU64,
  pub failed_flushes: AtomicU64,
  pub dead_lettered: AtomicU64,
  pub pending: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
  pub received: u64,
  pub flushes: u64,
  pub flushed_rows: u64,
  pub failed_flushes: u64,
  pub dead_lettered: u64,
  pub pending: u64,
}

impl AggregatorStats {
  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      received: self.received.load(Ordering::Relaxed),
      flushes: self.flushes.load(Ordering::Relaxed),
      flushed_rows: self.flushed_rows.load(Ordering::Relaxed),
      failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
      dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
      pending: self.pending.load(Ordering::Relaxed),
    }
  }
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
  /// Nothing pending.
  Empty,
  /// A previous failure's backoff has not elapsed yet.
  Deferred,
  Flushed(usize),
  /// Write failed; rows are back at the front of the queue.
  Requeued { rows: usize, attempt: u32 },
  DeadLettered(usize),
}

pub struct Aggregator {
  config: Config,
  sink: Arc<dyn MetricsSink>,
  pending: VecDeque<SessionMetrics>,
  /// Consecutive failed attempts for the batch at the head of `pending`.
  attempts: u32,
  retry_at: Option<Instant>,
  stats: Arc<AggregatorStats>,
}

impl Aggregator {
  pub fn new(config: Config, sink: Arc<dyn MetricsSink>) -> Self {
    Self {
      config,
      sink,
      pending: VecDeque::new(),
      attempts: 0,
      retry_at: None,
      stats: Arc::new(AggregatorStats::default()),
    }
  }

  pub fn stats(&self) -> Arc<AggregatorStats> {
    self.stats.clone()
  }

  pub fn pending(&self) -> usize {
    self.pending.len()
  }

  /// Enqueue one snapshot; flushes immediately once a full batch is pending.
  pub async fn push(&mut self, metrics: SessionMetrics) {
    self.pending.push_back(metrics);
    self.stats.received.fetch_add(1, Ordering::Relaxed);
    self.sync_pending();
    if self.pending.len() >= self.config.batch_size {
      self.flush(Instant::now()).await;
    }
  }

  /// Timer path: write everything pending, batch by batch, until a failure or backoff.
  pub async fn tick(&mut self) {
    while let FlushOutcome::Flushed(_) = self.flush(Instant::now()).await {
      if self.pending.is_empty() {
        break;
      }
    }
  }

  /// Write at most one batch from the head of the queue.
  pub async fn flush(&mut self, now: Instant) -> FlushOutcome {
    if self.pending.is_empty() {
      return FlushOutcome::Empty;
    }
    if let Some(at) = self.retry_at {
      if now < at {
        return FlushOutcome::Deferred;
      }
    }

    let n = self.config.batch_size.min(self.pending.len());
    let batch: Vec<SessionMetrics> = self.pending.drain(..n).collect();

    let timeout = self.config.write_timeout();
    let result = match tokio::time::timeout(timeout, self.sink.write_batch(&batch)).await {
      Ok(r) => r,
      Err(_) => Err(SinkError::Timeout(self.config.write_timeout_ms)),
    };

    let outcome = match result {
      Ok(inserted) => {
        self.attempts = 0;
        self.retry_at = None;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats.flushed_rows.fetch_add(n as u64, Ordering::Relaxed);
        tracing::debug!(rows = n, inserted, "batch flushed");
        FlushOutcome::Flushed(n)
      }
      Err(e) => {
        self.attempts += 1;
        self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
        if self.attempts > self.config.max_retries {
          let attempts = self.attempts;
          self.attempts = 0;
          self.retry_at = None;
          self.dead_letter(batch, &e, attempts).await;
          FlushOutcome::DeadLettered(n)
        } else {
          let delay = self.config.backoff(self.attempts);
          self.retry_at = Some(now + delay);
          tracing::warn!(
            rows = n,
            attempt = self.attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %e,
            "sink write failed, requeued"
          );
          for m in batch.into_iter().rev() {
            self.pending.push_front(m);
          }
          FlushOutcome::Requeued {
            rows: n,
            attempt: self.attempts,
          }
        }
      }
    };
    self.sync_pending();
    outcome
  }

  async fn dead_letter(&self, batch: Vec<SessionMetrics>, cause: &SinkError, attempts: u32) {
    let reason = cause.to_string();
    self
      .stats
      .dead_lettered
      .fetch_add(batch.len() as u64, Ordering::Relaxed);
    let timeout = self.config.write_timeout();
    let result = match tokio::time::timeout(timeout, self.sink.dead_letter(&batch, &reason, attempts)).await {
      Ok(r) => r,
      Err(_) => Err(SinkError::Timeout(self.config.write_timeout_ms)),
    };
    match result {
      Ok(()) => tracing::error!(rows = batch.len(), attempts, error = %reason, "batch dead-lettered"),
      Err(e) => tracing::error!(
        rows = batch.len(),
        attempts,
        error = %reason,
        dead_letter_error = %e,
        "dead-letter write failed, batch dropped"
      ),
    }
  }

  /// Flush until nothing is pending, waiting out backoff between attempts.
  pub async fn drain(&mut self) {
    while !self.pending.is_empty() {
      if let Some(at) = self.retry_at {
        tokio::time::sleep_until(at).await;
      }
      self.flush(Instant::now()).await;
    }
  }

  /// Consume until the channel closes or shutdown is signalled, then drain.
  pub async fn run(
    mut self,
    mut rx: mpsc::Receiver<SessionMetrics>,
    mut shutdown: watch::Receiver<bool>,
  ) {
    let every = self.config.flush_interval();
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        maybe = rx.recv() => match maybe {
          Some(m) => self.push(m).await,
          None => break,
        },
        _ = ticker.tick() => self.tick().await,
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }

    // Stop accepting, keep whatever was already queued.
    rx.close();
    while let Some(m) = rx.recv().await {
      self.pending.push_back(m);
      self.stats.received.fetch_add(1, Ordering::Relaxed);
    }
    tracing::info!(pending = self.pending.len(), "aggregator draining");
    self.drain().await;
    self.sync_pending();
    tracing::info!(stats = ?self.stats.snapshot(), "aggregator stopped");
  }

  fn sync_pending(&self) {
    self
      .stats
      .pending
      .store(self.pending.len() as u64, Ordering::Relaxed);
  }
}
