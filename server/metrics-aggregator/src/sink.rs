//! Analytical sink: the seam the aggregator writes through, plus its PostgreSQL implementation.

use session_engine::SessionMetrics;
use sqlx_core::query::query;
use sqlx_core::query_builder::QueryBuilder;
use sqlx_core::types::Json;
use sqlx_postgres::{PgPool, PgPoolOptions, Postgres};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::SinkError;
use crate::schema;

/// Keeps one statement well under Postgres' 65535 bind parameter limit (19 per row).
const MAX_ROWS_PER_STATEMENT: usize = 2_000;

pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SinkError>> + Send + 'a>>;

/// Destination for closed-session rows.
pub trait MetricsSink: Send + Sync {
  /// Create destination tables if missing. Safe to call on every start.
  fn provision(&self) -> SinkFuture<'_, ()>;

  /// Write one batch; returns the number of newly inserted rows.
  fn write_batch<'a>(&'a self, rows: &'a [SessionMetrics]) -> SinkFuture<'a, u64>;

  /// Park rows that exhausted their retries.
  fn dead_letter<'a>(
    &'a self,
    rows: &'a [SessionMetrics],
    reason: &'a str,
    attempts: u32,
  ) -> SinkFuture<'a, ()>;
}

pub struct PgSink {
  pool: PgPool,
}

impl PgSink {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
    let pool = PgPoolOptions::new()
      .max_connections(5)
      .acquire_timeout(Duration::from_secs(10))
      .connect(database_url)
      .await?;
    Ok(Self::new(pool))
  }

  async fn provision_tables(&self) -> Result<(), SinkError> {
    for stmt in schema::STATEMENTS {
      query::<Postgres>(stmt).execute(&self.pool).await?;
    }
    tracing::info!(statements = schema::STATEMENTS.len(), "sink schema provisioned");
    Ok(())
  }

  async fn insert_rows(&self, rows: &[SessionMetrics]) -> Result<u64, SinkError> {
    let mut inserted = 0;
    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
      let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
        "INSERT INTO session_facts ({}) ",
        schema::SESSION_FACTS_COLUMNS
      ));
      qb.push_values(chunk, |mut b, m| {
        b.push_bind(m.org_id.clone())
          .push_bind(m.product_id.clone())
          .push_bind(m.session_id.clone())
          .push_bind(m.user_hash.clone())
          .push_bind(m.start_ts)
          .push_bind(m.end_ts)
          .push_bind(m.duration_ms)
          .push_bind(i64::from(m.click_count))
          .push_bind(i64::from(m.unique_screens))
          .push_bind(i64::from(m.rage_clicks))
          .push_bind(i64::from(m.backtracks))
          .push_bind(i64::from(m.context_switches))
          .push_bind(i64::from(m.tasks_started))
          .push_bind(i64::from(m.tasks_completed))
          .push_bind(i64::from(m.error_events))
          .push_bind(m.frustration_score)
          .push_bind(m.efficiency_score)
          .push_bind(m.version_tag.clone())
          .push_bind(m.segment.clone());
      });
      // Redelivered sessions (at-least-once bus) must not duplicate facts.
      qb.push(" ON CONFLICT (org_id, product_id, session_id, start_ts) DO NOTHING");
      let result = qb.build().execute(&self.pool).await?;
      inserted += result.rows_affected();
    }
    Ok(inserted)
  }

  async fn insert_dead_letters(
    &self,
    rows: &[SessionMetrics],
    reason: &str,
    attempts: u32,
  ) -> Result<(), SinkError> {
    for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
      let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "INSERT INTO session_facts_dead_letter \
         (org_id, product_id, session_id, payload, error_message, attempts) ",
      );
      qb.push_values(chunk, |mut b, m| {
        b.push_bind(m.org_id.clone())
          .push_bind(m.product_id.clone())
          .push_bind(m.session_id.clone())
          .push_bind(Json(m.clone()))
          .push_bind(reason.to_string())
          .push_bind(i64::from(attempts));
      });
      qb.build().execute(&self.pool).await?;
    }
    Ok(())
  }
}

impl MetricsSink for PgSink {
  fn provision(&self) -> SinkFuture<'_, ()> {
    Box::pin(self.provision_tables())
  }

  fn write_batch<'a>(&'a self, rows: &'a [SessionMetrics]) -> SinkFuture<'a, u64> {
    Box::pin(self.insert_rows(rows))
  }

  fn dead_letter<'a>(
    &'a self,
    rows: &'a [SessionMetrics],
    reason: &'a str,
    attempts: u32,
  ) -> SinkFuture<'a, ()> {
    Box::pin(self.insert_dead_letters(rows, reason, attempts))
  }
}
