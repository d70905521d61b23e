use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde_json::Value;

use crate::app::models::schemas::{Flow, FlowCreateRequest, FlowUpdateRequest};
use crate::app::repositories::Database;

/// CRUD over the saved DAG definitions.
#[derive(Clone)]
pub struct FlowRepository {
  db: Database,
}

impl FlowRepository {
  pub fn new(db: Database) -> Self {
    FlowRepository { db }
  }

  pub fn create_flow(&self, request: &FlowCreateRequest) -> Result<Flow> {
    let now = Utc::now();
    let tags = request.tags.clone().unwrap_or_default();
    let id: i64 = {
      let conn = self.db.lock();
      conn
        .execute(
          "INSERT INTO flows (name, description, nodes, edges, viewport, data, is_template, tags, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          params![
            request.name,
            request.description,
            request.nodes.to_string(),
            request.edges.to_string(),
            request.viewport.as_ref().map(|v| v.to_string()),
            request.data.as_ref().map(|v| v.to_string()),
            request.is_template,
            serde_json::to_string(&tags)?,
            now.to_rfc3339(),
          ],
        )
        .context("Failed to insert flow")?;
      conn.last_insert_rowid()
    };
    self.get_flow_by_id(id)?.context("Inserted flow vanished")
  }

  pub fn get_flow_by_id(&self, flow_id: i64) -> Result<Option<Flow>> {
    let conn = self.db.lock();
    let mut stmt = conn.prepare(
      "SELECT id, name, description, nodes, edges, viewport, data, is_template, tags, created_at, updated_at
       FROM flows WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![flow_id], row_to_flow)?;
    match rows.next() {
      Some(flow) => Ok(Some(flow?)),
      None => Ok(None),
    }
  }

  /// All flows, most recently touched first.
  pub fn get_all_flows(&self, include_templates: bool) -> Result<Vec<Flow>> {
    let conn = self.db.lock();
    let sql = if include_templates {
      "SELECT id, name, description, nodes, edges, viewport, data, is_template, tags, created_at, updated_at
       FROM flows ORDER BY COALESCE(updated_at, created_at) DESC"
    } else {
      "SELECT id, name, description, nodes, edges, viewport, data, is_template, tags, created_at, updated_at
       FROM flows WHERE is_template = 0 ORDER BY COALESCE(updated_at, created_at) DESC"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], row_to_flow)?;
    rows.collect::<rusqlite::Result<Vec<Flow>>>().context("Failed to list flows")
  }

  /// Case-insensitive substring search on the name.
  pub fn get_flows_by_name(&self, name: &str) -> Result<Vec<Flow>> {
    let conn = self.db.lock();
    let mut stmt = conn.prepare(
      "SELECT id, name, description, nodes, edges, viewport, data, is_template, tags, created_at, updated_at
       FROM flows WHERE LOWER(name) LIKE LOWER(?1) ORDER BY COALESCE(updated_at, created_at) DESC",
    )?;
    let pattern = format!("%{}%", name);
    let rows = stmt.query_map(params![pattern], row_to_flow)?;
    rows.collect::<rusqlite::Result<Vec<Flow>>>().context("Failed to search flows")
  }

  pub fn update_flow(&self, flow_id: i64, request: &FlowUpdateRequest) -> Result<Option<Flow>> {
    let existing = match self.get_flow_by_id(flow_id)? {
      Some(flow) => flow,
      None => return Ok(None),
    };

    let name = request.name.clone().unwrap_or(existing.name);
    let description = request.description.clone().or(existing.description);
    let nodes = request.nodes.clone().unwrap_or(existing.nodes);
    let edges = request.edges.clone().unwrap_or(existing.edges);
    let viewport = request.viewport.clone().or(existing.viewport);
    let data = request.data.clone().or(existing.data);
    let is_template = request.is_template.unwrap_or(existing.is_template);
    let tags = request.tags.clone().unwrap_or(existing.tags);

    {
      let conn = self.db.lock();
      conn.execute(
        "UPDATE flows SET name = ?1, description = ?2, nodes = ?3, edges = ?4, viewport = ?5,
         data = ?6, is_template = ?7, tags = ?8, updated_at = ?9 WHERE id = ?10",
        params![
          name,
          description,
          nodes.to_string(),
          edges.to_string(),
          viewport.as_ref().map(|v| v.to_string()),
          data.as_ref().map(|v| v.to_string()),
          is_template,
          serde_json::to_string(&tags)?,
          Utc::now().to_rfc3339(),
          flow_id,
        ],
      )?;
    }
    self.get_flow_by_id(flow_id)
  }

  pub fn delete_flow(&self, flow_id: i64) -> Result<bool> {
    let conn = self.db.lock();
    let deleted = conn.execute("DELETE FROM flows WHERE id = ?1", params![flow_id])?;
    Ok(deleted > 0)
  }

  /// Deep-copy a flow. The copy is never a template and defaults its name
  /// to "<original> (Copy)".
  pub fn duplicate_flow(&self, flow_id: i64, new_name: Option<&str>) -> Result<Option<Flow>> {
    let original = match self.get_flow_by_id(flow_id)? {
      Some(flow) => flow,
      None => return Ok(None),
    };
    let copy_name =
      new_name.map(String::from).unwrap_or_else(|| format!("{} (Copy)", original.name));
    let copy = self.create_flow(&FlowCreateRequest {
      name: copy_name,
      description: original.description,
      nodes: original.nodes,
      edges: original.edges,
      viewport: original.viewport,
      data: original.data,
      is_template: false,
      tags: Some(original.tags),
    })?;
    Ok(Some(copy))
  }
}

fn row_to_flow(row: &Row<'_>) -> rusqlite::Result<Flow> {
  let nodes: String = row.get(3)?;
  let edges: String = row.get(4)?;
  let viewport: Option<String> = row.get(5)?;
  let data: Option<String> = row.get(6)?;
  let tags: Option<String> = row.get(8)?;
  let created_at: String = row.get(9)?;
  let updated_at: Option<String> = row.get(10)?;

  Ok(Flow {
    id: row.get(0)?,
    name: row.get(1)?,
    description: row.get(2)?,
    nodes: serde_json::from_str(&nodes).unwrap_or(Value::Null),
    edges: serde_json::from_str(&edges).unwrap_or(Value::Null),
    viewport: viewport.and_then(|v| serde_json::from_str(&v).ok()),
    data: data.and_then(|v| serde_json::from_str(&v).ok()),
    is_template: row.get(7)?,
    tags: tags.and_then(|t| serde_json::from_str(&t).ok()).unwrap_or_default(),
    created_at: parse_timestamp(&created_at),
    updated_at: updated_at.as_deref().map(parse_timestamp),
  })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
  DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn repo() -> FlowRepository {
    FlowRepository::new(Database::open(":memory:").unwrap())
  }

  fn sample_request(name: &str) -> FlowCreateRequest {
    FlowCreateRequest {
      name: name.to_string(),
      description: Some("momentum sweep".to_string()),
      nodes: json!([{"id": "n1", "type": "agent"}]),
      edges: json!([{"source": "n1", "target": "n2"}]),
      viewport: Some(json!({"x": 0, "y": 0, "zoom": 1.0})),
      data: Some(json!({"tickers": ["AAPL"]})),
      is_template: false,
      tags: Some(vec!["momentum".to_string()]),
    }
  }

  #[test]
  fn create_read_update_read_round_trip() {
    let repo = repo();
    let flow = repo.create_flow(&sample_request("Alpha")).unwrap();
    assert_eq!(flow.name, "Alpha");
    assert_eq!(flow.nodes[0]["id"], "n1");

    let update = FlowUpdateRequest {
      name: Some("Alpha v2".to_string()),
      tags: Some(vec!["momentum".to_string(), "v2".to_string()]),
      ..Default::default()
    };
    let updated = repo.update_flow(flow.id, &update).unwrap().unwrap();
    assert_eq!(updated.name, "Alpha v2");
    assert_eq!(updated.tags.len(), 2);
    // Fields that were not in the update survive.
    assert_eq!(updated.nodes[0]["id"], "n1");
    assert!(updated.updated_at.is_some());

    let read_back = repo.get_flow_by_id(flow.id).unwrap().unwrap();
    assert_eq!(read_back.name, "Alpha v2");
  }

  #[test]
  fn name_search_is_case_insensitive_substring() {
    let repo = repo();
    repo.create_flow(&sample_request("Momentum Daily")).unwrap();
    repo.create_flow(&sample_request("Value Weekly")).unwrap();

    let hits = repo.get_flows_by_name("moment").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "Momentum Daily");
    assert!(repo.get_flows_by_name("MOMENTUM").unwrap().len() == 1);
    assert!(repo.get_flows_by_name("missing").unwrap().is_empty());
  }

  #[test]
  fn duplicate_copies_structure_and_clears_template_flag() {
    let repo = repo();
    let mut request = sample_request("Template Flow");
    request.is_template = true;
    let original = repo.create_flow(&request).unwrap();

    let copy = repo.duplicate_flow(original.id, None).unwrap().unwrap();
    assert_eq!(copy.name, "Template Flow (Copy)");
    assert!(!copy.is_template);
    assert_eq!(copy.nodes, original.nodes);
    assert_eq!(copy.edges, original.edges);
    assert_ne!(copy.id, original.id);

    let named = repo.duplicate_flow(original.id, Some("My Fork")).unwrap().unwrap();
    assert_eq!(named.name, "My Fork");
  }

  #[test]
  fn template_filter_excludes_templates() {
    let repo = repo();
    let mut template = sample_request("Template");
    template.is_template = true;
    repo.create_flow(&template).unwrap();
    repo.create_flow(&sample_request("Regular")).unwrap();

    assert_eq!(repo.get_all_flows(true).unwrap().len(), 2);
    let non_templates = repo.get_all_flows(false).unwrap();
    assert_eq!(non_templates.len(), 1);
    assert_eq!(non_templates[0].name, "Regular");
  }

  #[test]
  fn data_survives_reopening_the_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flows.db");
    let path_str = path.to_str().unwrap().to_string();
    {
      let repo = FlowRepository::new(Database::open(&path_str).unwrap());
      repo.create_flow(&sample_request("Persisted")).unwrap();
    }
    let repo = FlowRepository::new(Database::open(&path_str).unwrap());
    assert_eq!(repo.get_flows_by_name("Persisted").unwrap().len(), 1);
  }

  #[test]
  fn delete_reports_whether_anything_was_removed() {
    let repo = repo();
    let flow = repo.create_flow(&sample_request("Doomed")).unwrap();
    assert!(repo.delete_flow(flow.id).unwrap());
    assert!(!repo.delete_flow(flow.id).unwrap());
    assert!(repo.get_flow_by_id(flow.id).unwrap().is_none());
  }
}
