pub mod flow_repository;
pub mod flow_run_repository;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// Shared SQLite handle for the flow tables. A single connection behind a
/// mutex is plenty for this workload and keeps `:memory:` databases usable
/// in tests.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  pub fn open(path: &str) -> Result<Self> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().context("Failed to open in-memory database")?
    } else {
      Connection::open(path).with_context(|| format!("Failed to open database at {}", path))?
    };
    let db = Database { conn: Arc::new(Mutex::new(conn)) };
    db.init_schema()?;
    Ok(db)
  }

  fn init_schema(&self) -> Result<()> {
    let conn = self.lock();
    conn.execute(
      "CREATE TABLE IF NOT EXISTS flows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        nodes TEXT NOT NULL,
        edges TEXT NOT NULL,
        viewport TEXT,
        data TEXT,
        is_template INTEGER NOT NULL DEFAULT 0,
        tags TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT
      )",
      [],
    )?;
    conn.execute(
      "CREATE TABLE IF NOT EXISTS flow_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id INTEGER NOT NULL,
        run_number INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'IDLE',
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        request_data TEXT,
        results TEXT,
        error_message TEXT,
        UNIQUE(flow_id, run_number)
      )",
      [],
    )?;
    conn.execute(
      "CREATE INDEX IF NOT EXISTS idx_flow_runs_flow_id ON flow_runs(flow_id)",
      [],
    )?;
    Ok(())
  }

  pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(|p| p.into_inner())
  }
}
