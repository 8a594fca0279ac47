//! Session Metrics Aggregator
//!
//! Batches closed-session SessionMetrics and bulk-writes them to the analytical
//! store, with bounded retry and a dead-letter path. Serves /health and /stats;
//! bind to 127.0.0.1 by default (internal only).

pub mod aggregator;
pub mod config;
pub mod error;
mod handlers;
pub mod ingest;
pub mod schema;
pub mod sink;
mod state;

pub use aggregator::{Aggregator, AggregatorStats, FlushOutcome, StatsSnapshot};
pub use config::Config;
pub use error::{AggregatorError, SinkError};
pub use handlers::{health, stats};
pub use sink::{MetricsSink, PgSink, SinkFuture};
pub use state::AppState;
