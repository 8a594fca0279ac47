//! DDL for the analytical sink. Every statement is idempotent.

/// One row per closed session.
pub const CREATE_SESSION_FACTS: &str = r#"
CREATE TABLE IF NOT EXISTS session_facts (
  org_id            TEXT             NOT NULL,
  product_id        TEXT             NOT NULL,
  session_id        TEXT             NOT NULL,
  user_hash         TEXT             NOT NULL,
  start_ts          TIMESTAMPTZ      NOT NULL,
  end_ts            TIMESTAMPTZ      NOT NULL,
  duration_ms       BIGINT           NOT NULL,
  click_count       BIGINT           NOT NULL,
  unique_screens    BIGINT           NOT NULL,
  rage_clicks       BIGINT           NOT NULL,
  backtracks        BIGINT           NOT NULL,
  context_switches  BIGINT           NOT NULL,
  tasks_started     BIGINT           NOT NULL,
  tasks_completed   BIGINT           NOT NULL,
  error_events      BIGINT           NOT NULL,
  frustration_score DOUBLE PRECISION NOT NULL,
  efficiency_score  DOUBLE PRECISION NOT NULL,
  version_tag       TEXT,
  segment           TEXT,
  inserted_at       TIMESTAMPTZ      NOT NULL DEFAULT now(),
  PRIMARY KEY (org_id, product_id, session_id, start_ts)
)
"#;

pub const CREATE_SESSION_FACTS_END_IDX: &str = r#"
CREATE INDEX IF NOT EXISTS session_facts_org_product_end_idx
  ON session_facts (org_id, product_id, end_ts)
"#;

/// Per-screen daily rollup. Provisioned here, populated by downstream jobs.
pub const CREATE_SCREEN_HOTSPOTS: &str = r#"
CREATE TABLE IF NOT EXISTS screen_hotspots (
  org_id            TEXT             NOT NULL,
  product_id        TEXT             NOT NULL,
  screen_id         TEXT             NOT NULL,
  route             TEXT             NOT NULL,
  date              DATE             NOT NULL,
  sessions          BIGINT           NOT NULL DEFAULT 0,
  avg_frustration   DOUBLE PRECISION NOT NULL DEFAULT 0,
  avg_efficiency    DOUBLE PRECISION NOT NULL DEFAULT 0,
  rage_click_rate   DOUBLE PRECISION NOT NULL DEFAULT 0,
  dropoff_rate      DOUBLE PRECISION NOT NULL DEFAULT 0,
  avg_time_spent_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
  PRIMARY KEY (org_id, product_id, screen_id, route, date)
)
"#;

/// Batches that exhausted their retries.
pub const CREATE_DEAD_LETTER: &str = r#"
CREATE TABLE IF NOT EXISTS session_facts_dead_letter (
  id            BIGSERIAL   PRIMARY KEY,
  org_id        TEXT        NOT NULL,
  product_id    TEXT        NOT NULL,
  session_id    TEXT        NOT NULL,
  payload       JSONB       NOT NULL,
  error_message TEXT        NOT NULL,
  attempts      BIGINT      NOT NULL,
  failed_at     TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// In execution order.
pub const STATEMENTS: &[&str] = &[
  CREATE_SESSION_FACTS,
  CREATE_SESSION_FACTS_END_IDX,
  CREATE_SCREEN_HOTSPOTS,
  CREATE_DEAD_LETTER,
];

/// Insert column list; order matches the binds in `sink::PgSink::write_batch`.
pub const SESSION_FACTS_COLUMNS: &str = "org_id, product_id, session_id, user_hash, start_ts, end_ts, \
  duration_ms, click_count, unique_screens, rage_clicks, backtracks, context_switches, \
  tasks_started, tasks_completed, error_events, frustration_score, efficiency_score, \
  version_tag, segment";

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_statement_is_idempotent() {
    for stmt in STATEMENTS {
      assert!(stmt.contains("IF NOT EXISTS"), "{}", stmt);
    }
  }

  #[test]
  fn insert_columns_exist_in_table() {
    for column in SESSION_FACTS_COLUMNS.split(',').map(str::trim) {
      assert!(CREATE_SESSION_FACTS.contains(&format!("\n  {} ", column)), "{}", column);
    }
    assert_eq!(SESSION_FACTS_COLUMNS.split(',').count(), 19);
  }
}
