//! Shared state for the HTTP handlers.

use std::sync::Arc;

use crate::aggregator::AggregatorStats;

pub struct AppState {
  pub stats: Arc<AggregatorStats>,
}
