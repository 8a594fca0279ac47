//! Shard runtime: one sessionizer worker and one detector worker per key shard.
//!
//! Each worker owns its state exclusively and mutates it only inside its own
//! `select!` loop, so sweeps and prunes never race event processing. The
//! dispatcher routes every event of a session key to the same shard, which
//! keeps per-key processing strictly ordered while shards run in parallel.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::bus::{Envelope, Publisher, TOPIC_INCIDENTS, TOPIC_RAW, TOPIC_SESSIONIZED};
use crate::config::Config;
use crate::detector::IncidentDetector;
use crate::error::BusError;
use crate::sessionizer::Sessionizer;
use crate::shard::shard_for;
use crate::types::{Event, Incident, SessionMetrics};

pub struct Runtime {
  sessionizers: Vec<mpsc::Sender<Event>>,
  detectors: Vec<mpsc::Sender<Event>>,
  workers: Vec<JoinHandle<()>>,
}

impl Runtime {
  /// Start `config.shard_count` workers for each pipeline.
  pub fn spawn(config: Config, publisher: Arc<dyn Publisher>) -> Self {
    let shards = config.shard_count.max(1);
    let mut sessionizers = Vec::with_capacity(shards);
    let mut detectors = Vec::with_capacity(shards);
    let mut workers = Vec::with_capacity(shards * 2);

    for shard in 0..shards {
      let (tx, rx) = mpsc::channel(config.channel_capacity);
      sessionizers.push(tx);
      workers.push(tokio::spawn(run_sessionizer_shard(
        shard,
        Sessionizer::new(config.clone()),
        rx,
        publisher.clone(),
        config.sweep_interval(),
      )));

      let (tx, rx) = mpsc::channel(config.channel_capacity);
      detectors.push(tx);
      workers.push(tokio::spawn(run_detector_shard(
        shard,
        IncidentDetector::new(config.clone()),
        rx,
        publisher.clone(),
        config.sweep_interval(),
        config.session_timeout_ms,
      )));
    }

    tracing::info!(shards, "session runtime started");
    Self {
      sessionizers,
      detectors,
      workers,
    }
  }

  /// Hand one event to both pipelines. Waits when a shard queue is full.
  pub async fn dispatch(&self, event: Event) -> Result<(), BusError> {
    let shard = shard_for(&event.key, self.sessionizers.len());
    let closed = || BusError::Closed {
      topic: TOPIC_RAW.to_string(),
    };
    self.detectors[shard]
      .send(event.clone())
      .await
      .map_err(|_| closed())?;
    self.sessionizers[shard].send(event).await.map_err(|_| closed())
  }

  /// Stop accepting events, let every worker drain its queue, force-close all
  /// open sessions and wait for the final publishes.
  pub async fn shutdown(self) {
    drop(self.sessionizers);
    drop(self.detectors);
    for worker in self.workers {
      if let Err(e) = worker.await {
        tracing::error!(error = %e, "shard worker panicked");
      }
    }
    tracing::info!("session runtime stopped");
  }
}

async fn run_sessionizer_shard(
  shard: usize,
  mut sessionizer: Sessionizer,
  mut rx: mpsc::Receiver<Event>,
  publisher: Arc<dyn Publisher>,
  sweep_every: Duration,
) {
  let mut ticker = interval_at(Instant::now() + sweep_every, sweep_every);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // Metrics whose first publish failed; retried once on the next tick.
  let mut retry: Vec<SessionMetrics> = Vec::new();

  loop {
    tokio::select! {
      maybe = rx.recv() => match maybe {
        Some(event) => sessionizer.process(&event),
        None => break,
      },
      _ = ticker.tick() => {
        let pending = std::mem::take(&mut retry);
        retry_metrics(publisher.as_ref(), pending).await;
        let closed = sessionizer.sweep(Utc::now());
        if !closed.is_empty() {
          tracing::info!(shard, closed = closed.len(), open = sessionizer.open_sessions(), "sweep");
        }
        retry = publish_metrics(publisher.as_ref(), closed).await;
      }
    }
  }

  let closed = sessionizer.shutdown();
  tracing::info!(shard, closed = closed.len(), "force-closing open sessions");
  retry.extend(publish_metrics(publisher.as_ref(), closed).await);
  retry_metrics(publisher.as_ref(), retry).await;
}

async fn run_detector_shard(
  shard: usize,
  mut detector: IncidentDetector,
  mut rx: mpsc::Receiver<Event>,
  publisher: Arc<dyn Publisher>,
  prune_every: Duration,
  idle_ms: i64,
) {
  let mut ticker = interval_at(Instant::now() + prune_every, prune_every);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      maybe = rx.recv() => match maybe {
        Some(event) => {
          for incident in detector.process(&event) {
            if let Err(e) = publish_incident(publisher.as_ref(), &incident).await {
              tracing::warn!(
                shard,
                session_id = %incident.session_id,
                incident_id = %incident.incident_id,
                error = %e,
                "incident publish failed"
              );
            }
          }
        }
        None => break,
      },
      _ = ticker.tick() => {
        let dropped = detector.prune(Utc::now(), idle_ms);
        if dropped > 0 {
          tracing::debug!(
            shard,
            dropped,
            tracked = detector.tracked_sessions(),
            "pruned idle detector state"
          );
        }
      }
    }
  }

  if detector.open_tasks() > 0 {
    tracing::debug!(shard, open_tasks = detector.open_tasks(), "discarding open tasks at shutdown");
  }
}

async fn publish_incident(publisher: &dyn Publisher, incident: &Incident) -> Result<(), BusError> {
  publisher.publish(Envelope::new(TOPIC_INCIDENTS, incident)?).await
}

async fn publish_session(publisher: &dyn Publisher, metrics: &SessionMetrics) -> Result<(), BusError> {
  publisher.publish(Envelope::new(TOPIC_SESSIONIZED, metrics)?).await
}

/// Publish each snapshot; returns those that failed for one later retry.
async fn publish_metrics(publisher: &dyn Publisher, metrics: Vec<SessionMetrics>) -> Vec<SessionMetrics> {
  let mut failed = Vec::new();
  for m in metrics {
    if let Err(e) = publish_session(publisher, &m).await {
      tracing::warn!(
        org_id = %m.org_id,
        session_id = %m.session_id,
        error = %e,
        "session metrics publish failed, will retry once"
      );
      failed.push(m);
    }
  }
  failed
}

async fn retry_metrics(publisher: &dyn Publisher, metrics: Vec<SessionMetrics>) {
  for m in metrics {
    if let Err(e) = publish_session(publisher, &m).await {
      tracing::error!(
        org_id = %m.org_id,
        session_id = %m.session_id,
        error = %e,
        "session metrics dropped after retry"
      );
    }
  }
}
