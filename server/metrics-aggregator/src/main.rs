//! Binary entrypoint for the metrics aggregator.
//!
//! Reads events.sessionized JSON lines from stdin, batches them into session_facts.
//! Exits non-zero when the sink cannot be reached or provisioned at startup.

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use metrics_aggregator::{
  ingest, Aggregator, AggregatorError, AppState, Config, MetricsSink, PgSink,
};

#[tokio::main]
async fn main() {
  init_tracing();
  if let Err(e) = run().await {
    tracing::error!(error = %e, "metrics-aggregator failed");
    std::process::exit(1);
  }
}

async fn run() -> Result<(), AggregatorError> {
  let config = Config::from_env()?;
  let database_url = config
    .database_url
    .clone()
    .ok_or_else(|| AggregatorError::config("DATABASE_URL", "must be set"))?;

  let sink = PgSink::connect(&database_url).await?;
  sink.provision().await?;
  let sink: Arc<dyn MetricsSink> = Arc::new(sink);

  let aggregator = Aggregator::new(config.clone(), sink);
  let state = Arc::new(AppState {
    stats: aggregator.stats(),
  });

  let (tx, rx) = mpsc::channel(config.channel_capacity);
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let worker = tokio::spawn(aggregator.run(rx, shutdown_rx.clone()));

  let app = Router::new()
    .route("/health", get(metrics_aggregator::health))
    .route("/stats", get(metrics_aggregator::stats))
    .with_state(state);
  let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
  let listener = tokio::net::TcpListener::bind(addr).await?;
  tracing::info!(%addr, batch_size = config.batch_size, "metrics-aggregator listening");

  let mut server_shutdown = shutdown_rx;
  let server = tokio::spawn(async move {
    let result = axum::serve(listener, app)
      .with_graceful_shutdown(async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
      })
      .await;
    if let Err(e) = result {
      tracing::error!(error = %e, "http server failed");
    }
  });

  tokio::select! {
    forwarded = ingest::forward_lines(BufReader::new(tokio::io::stdin()), &tx) => {
      tracing::info!(forwarded, "input closed, draining");
    }
    _ = tokio::signal::ctrl_c() => {
      tracing::info!("interrupt received, draining");
    }
  }

  drop(tx);
  let _ = shutdown_tx.send(true);
  if let Err(e) = worker.await {
    tracing::error!(error = %e, "aggregator task panicked");
  }
  let _ = server.await;
  Ok(())
}

fn init_tracing() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();
}
