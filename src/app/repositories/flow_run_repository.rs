use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::app::models::schemas::{FlowRun, FlowRunStatus, FlowRunUpdateRequest};
use crate::app::repositories::Database;

/// CRUD and lifecycle bookkeeping for flow executions.
#[derive(Clone)]
pub struct FlowRunRepository {
  db: Database,
}

impl FlowRunRepository {
  pub fn new(db: Database) -> Self {
    FlowRunRepository { db }
  }

  /// Create a run in IDLE with the next run number for the flow. The
  /// MAX+1 read and the insert share one transaction, so concurrent
  /// creates cannot hand out the same number.
  pub fn create_flow_run(&self, flow_id: i64, request_data: Option<&serde_json::Value>) -> Result<FlowRun> {
    let id: i64 = {
      let mut conn = self.db.lock();
      let tx = conn.transaction()?;
      let run_number: i64 = tx.query_row(
        "SELECT COALESCE(MAX(run_number), 0) + 1 FROM flow_runs WHERE flow_id = ?1",
        params![flow_id],
        |row| row.get(0),
      )?;
      tx.execute(
        "INSERT INTO flow_runs (flow_id, run_number, status, created_at, request_data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
          flow_id,
          run_number,
          FlowRunStatus::Idle.as_str(),
          Utc::now().to_rfc3339(),
          request_data.map(|v| v.to_string()),
        ],
      )?;
      let id = tx.last_insert_rowid();
      tx.commit()?;
      id
    };
    self.get_flow_run_by_id(id)?.context("Inserted flow run vanished")
  }

  pub fn get_flow_run_by_id(&self, run_id: i64) -> Result<Option<FlowRun>> {
    let conn = self.db.lock();
    let mut stmt = conn.prepare(&select_sql("WHERE id = ?1"))?;
    let mut rows = stmt.query_map(params![run_id], row_to_run)?;
    match rows.next() {
      Some(run) => Ok(Some(run?)),
      None => Ok(None),
    }
  }

  pub fn get_flow_runs_by_flow_id(&self, flow_id: i64, limit: i64, offset: i64) -> Result<Vec<FlowRun>> {
    let conn = self.db.lock();
    let mut stmt =
      stmt_helper(&conn, "WHERE flow_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3")?;
    let rows = stmt.query_map(params![flow_id, limit, offset], row_to_run)?;
    rows.collect::<rusqlite::Result<Vec<FlowRun>>>().context("Failed to list flow runs")
  }

  /// The unique IN_PROGRESS run for a flow, if one exists.
  pub fn get_active_flow_run(&self, flow_id: i64) -> Result<Option<FlowRun>> {
    let conn = self.db.lock();
    let mut stmt = stmt_helper(&conn, "WHERE flow_id = ?1 AND status = 'IN_PROGRESS' LIMIT 1")?;
    let mut rows = stmt.query_map(params![flow_id], row_to_run)?;
    match rows.next() {
      Some(run) => Ok(Some(run?)),
      None => Ok(None),
    }
  }

  pub fn get_latest_flow_run(&self, flow_id: i64) -> Result<Option<FlowRun>> {
    let conn = self.db.lock();
    let mut stmt =
      stmt_helper(&conn, "WHERE flow_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1")?;
    let mut rows = stmt.query_map(params![flow_id], row_to_run)?;
    match rows.next() {
      Some(run) => Ok(Some(run?)),
      None => Ok(None),
    }
  }

  /// Apply a lifecycle update. IN_PROGRESS stamps `started_at` once;
  /// COMPLETE/ERROR stamp `completed_at` once. Terminal timestamps are
  /// write-once: repeating a terminal status never rewrites them.
  pub fn update_flow_run(&self, run_id: i64, update: &FlowRunUpdateRequest) -> Result<Option<FlowRun>> {
    let existing = match self.get_flow_run_by_id(run_id)? {
      Some(run) => run,
      None => return Ok(None),
    };

    let mut started_at = existing.started_at;
    let mut completed_at = existing.completed_at;
    let status = update.status.unwrap_or(existing.status);

    if let Some(new_status) = update.status {
      if new_status == FlowRunStatus::InProgress && started_at.is_none() {
        started_at = Some(Utc::now());
      }
      if new_status.is_terminal() && completed_at.is_none() {
        completed_at = Some(Utc::now());
      }
    }

    let results = update.results.clone().or(existing.results);
    let error_message = update.error_message.clone().or(existing.error_message);

    {
      let conn = self.db.lock();
      conn.execute(
        "UPDATE flow_runs SET status = ?1, started_at = ?2, completed_at = ?3, results = ?4, error_message = ?5
         WHERE id = ?6",
        params![
          status.as_str(),
          started_at.map(|t| t.to_rfc3339()),
          completed_at.map(|t| t.to_rfc3339()),
          results.as_ref().map(|v| v.to_string()),
          error_message,
          run_id,
        ],
      )?;
    }
    self.get_flow_run_by_id(run_id)
  }

  pub fn delete_flow_run(&self, run_id: i64) -> Result<bool> {
    let conn = self.db.lock();
    let deleted = conn.execute("DELETE FROM flow_runs WHERE id = ?1", params![run_id])?;
    Ok(deleted > 0)
  }

  pub fn delete_flow_runs_by_flow_id(&self, flow_id: i64) -> Result<usize> {
    let conn = self.db.lock();
    let deleted = conn.execute("DELETE FROM flow_runs WHERE flow_id = ?1", params![flow_id])?;
    Ok(deleted)
  }

  pub fn get_flow_run_count(&self, flow_id: i64) -> Result<i64> {
    let conn = self.db.lock();
    let count = conn.query_row(
      "SELECT COUNT(*) FROM flow_runs WHERE flow_id = ?1",
      params![flow_id],
      |row| row.get(0),
    )?;
    Ok(count)
  }
}

fn select_sql(filter: &str) -> String {
  format!(
    "SELECT id, flow_id, run_number, status, created_at, started_at, completed_at, request_data, results, error_message
     FROM flow_runs {}",
    filter
  )
}

fn stmt_helper<'a>(
  conn: &'a rusqlite::Connection,
  filter: &str,
) -> rusqlite::Result<rusqlite::Statement<'a>> {
  conn.prepare(&select_sql(filter))
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<FlowRun> {
  let status: String = row.get(3)?;
  let created_at: String = row.get(4)?;
  let started_at: Option<String> = row.get(5)?;
  let completed_at: Option<String> = row.get(6)?;
  let request_data: Option<String> = row.get(7)?;
  let results: Option<String> = row.get(8)?;

  Ok(FlowRun {
    id: row.get(0)?,
    flow_id: row.get(1)?,
    run_number: row.get(2)?,
    status: FlowRunStatus::parse(&status).unwrap_or(FlowRunStatus::Idle),
    created_at: parse_timestamp(&created_at),
    started_at: started_at.as_deref().map(parse_timestamp),
    completed_at: completed_at.as_deref().map(parse_timestamp),
    request_data: request_data.and_then(|v| serde_json::from_str(&v).ok()),
    results: results.and_then(|v| serde_json::from_str(&v).ok()),
    error_message: row.get(9)?,
  })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
  DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn repo() -> FlowRunRepository {
    FlowRunRepository::new(Database::open(":memory:").unwrap())
  }

  fn status_update(status: FlowRunStatus) -> FlowRunUpdateRequest {
    FlowRunUpdateRequest { status: Some(status), ..Default::default() }
  }

  #[test]
  fn run_numbers_are_dense_per_flow_starting_at_one() {
    let repo = repo();
    let first = repo.create_flow_run(1, None).unwrap();
    let second = repo.create_flow_run(1, None).unwrap();
    let other_flow = repo.create_flow_run(2, None).unwrap();
    let third = repo.create_flow_run(1, None).unwrap();

    assert_eq!(first.run_number, 1);
    assert_eq!(second.run_number, 2);
    assert_eq!(third.run_number, 3);
    assert_eq!(other_flow.run_number, 1);
    assert_eq!(first.status, FlowRunStatus::Idle);
  }

  #[test]
  fn lifecycle_stamps_timestamps_once() {
    let repo = repo();
    let run = repo.create_flow_run(1, None).unwrap();
    assert!(run.started_at.is_none());
    assert!(run.completed_at.is_none());

    let started = repo.update_flow_run(run.id, &status_update(FlowRunStatus::InProgress)).unwrap().unwrap();
    let started_at = started.started_at.unwrap();
    assert!(started.completed_at.is_none());

    // Repeating IN_PROGRESS must not move started_at.
    let restarted = repo.update_flow_run(run.id, &status_update(FlowRunStatus::InProgress)).unwrap().unwrap();
    assert_eq!(restarted.started_at.unwrap(), started_at);

    let completed = repo.update_flow_run(run.id, &status_update(FlowRunStatus::Complete)).unwrap().unwrap();
    let completed_at = completed.completed_at.unwrap();
    assert!(completed.started_at.unwrap() <= completed_at);

    // Terminal timestamps are write-once.
    let recompleted = repo.update_flow_run(run.id, &status_update(FlowRunStatus::Complete)).unwrap().unwrap();
    assert_eq!(recompleted.completed_at.unwrap(), completed_at);
  }

  #[test]
  fn error_path_records_message_and_completed_at() {
    let repo = repo();
    let run = repo.create_flow_run(1, None).unwrap();
    repo.update_flow_run(run.id, &status_update(FlowRunStatus::InProgress)).unwrap();

    let update = FlowRunUpdateRequest {
      status: Some(FlowRunStatus::Error),
      error_message: Some("cancelled".to_string()),
      ..Default::default()
    };
    let errored = repo.update_flow_run(run.id, &update).unwrap().unwrap();
    assert_eq!(errored.status, FlowRunStatus::Error);
    assert_eq!(errored.error_message.as_deref(), Some("cancelled"));
    assert!(errored.completed_at.is_some());
  }

  #[test]
  fn active_run_is_the_in_progress_one() {
    let repo = repo();
    let first = repo.create_flow_run(1, None).unwrap();
    let second = repo.create_flow_run(1, None).unwrap();

    assert!(repo.get_active_flow_run(1).unwrap().is_none());
    repo.update_flow_run(second.id, &status_update(FlowRunStatus::InProgress)).unwrap();

    let active = repo.get_active_flow_run(1).unwrap().unwrap();
    assert_eq!(active.id, second.id);

    repo.update_flow_run(second.id, &status_update(FlowRunStatus::Complete)).unwrap();
    assert!(repo.get_active_flow_run(1).unwrap().is_none());
    let _ = first;
  }

  #[test]
  fn latest_run_listing_and_count() {
    let repo = repo();
    for _ in 0..3 {
      repo.create_flow_run(7, Some(&json!({"tickers": ["AAPL"]}))).unwrap();
    }

    assert_eq!(repo.get_flow_run_count(7).unwrap(), 3);
    let latest = repo.get_latest_flow_run(7).unwrap().unwrap();
    assert_eq!(latest.run_number, 3);
    assert_eq!(latest.request_data.as_ref().unwrap()["tickers"][0], "AAPL");

    let page = repo.get_flow_runs_by_flow_id(7, 2, 0).unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].run_number, 3);

    let rest = repo.get_flow_runs_by_flow_id(7, 2, 2).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].run_number, 1);
  }

  #[test]
  fn results_persist_through_updates() {
    let repo = repo();
    let run = repo.create_flow_run(1, None).unwrap();
    let update = FlowRunUpdateRequest {
      status: Some(FlowRunStatus::Complete),
      results: Some(json!({"decisions": {"AAPL": {"action": "buy"}}})),
      ..Default::default()
    };
    let completed = repo.update_flow_run(run.id, &update).unwrap().unwrap();
    assert_eq!(completed.results.unwrap()["decisions"]["AAPL"]["action"], "buy");
  }

  #[test]
  fn deletes_by_run_and_by_flow() {
    let repo = repo();
    let a = repo.create_flow_run(1, None).unwrap();
    repo.create_flow_run(1, None).unwrap();
    repo.create_flow_run(2, None).unwrap();

    assert!(repo.delete_flow_run(a.id).unwrap());
    assert!(!repo.delete_flow_run(a.id).unwrap());
    assert_eq!(repo.delete_flow_runs_by_flow_id(1).unwrap(), 1);
    assert_eq!(repo.get_flow_run_count(2).unwrap(), 1);
  }
}
