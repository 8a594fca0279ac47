//! HTTP handlers for the aggregator's internal surface.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::aggregator::StatsSnapshot;
use crate::state::AppState;

pub async fn health() -> &'static str {
  "ok"
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
  Json(state.stats.snapshot())
}
