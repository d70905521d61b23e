use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai_agent::graph::context::AgentModelConfig;

/// Body of `POST /hedge-fund/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeFundRequest {
  pub tickers: Vec<String>,
  pub selected_agents: Vec<String>,
  #[serde(default)]
  pub agent_models: Option<Vec<AgentModelConfig>>,
  #[serde(default)]
  pub start_date: Option<String>,
  #[serde(default)]
  pub end_date: Option<String>,
  #[serde(default = "default_model_name")]
  pub model_name: String,
  #[serde(default = "default_model_provider")]
  pub model_provider: String,
  #[serde(default = "default_initial_cash")]
  pub initial_cash: f64,
  #[serde(default)]
  pub margin_requirement: f64,
  #[serde(default)]
  pub show_reasoning: bool,
}

fn default_model_name() -> String {
  "gpt-4o".to_string()
}

fn default_model_provider() -> String {
  "OpenAI".to_string()
}

fn default_initial_cash() -> f64 {
  100_000.0
}

impl HedgeFundRequest {
  pub fn resolved_end_date(&self) -> String {
    self
      .end_date
      .clone()
      .unwrap_or_else(|| Utc::now().date_naive().format("%Y-%m-%d").to_string())
  }

  /// Ninety days before the end date when the caller did not say.
  pub fn resolved_start_date(&self) -> String {
    if let Some(start) = &self.start_date {
      return start.clone();
    }
    let end = NaiveDate::parse_from_str(&self.resolved_end_date(), "%Y-%m-%d")
      .unwrap_or_else(|_| Utc::now().date_naive());
    (end - Duration::days(90)).format("%Y-%m-%d").to_string()
  }
}

/// Build the initial portfolio snapshot the DAG receives.
pub fn create_portfolio(initial_cash: f64, margin_requirement: f64, tickers: &[String]) -> Value {
  let positions: serde_json::Map<String, Value> = tickers
    .iter()
    .map(|t| {
      (
        t.clone(),
        serde_json::json!({
          "long": 0,
          "short": 0,
          "long_cost_basis": 0.0,
          "short_cost_basis": 0.0,
          "short_margin_used": 0.0,
        }),
      )
    })
    .collect();
  let realized_gains: serde_json::Map<String, Value> = tickers
    .iter()
    .map(|t| (t.clone(), serde_json::json!({"long": 0.0, "short": 0.0})))
    .collect();
  serde_json::json!({
    "cash": initial_cash,
    "margin_requirement": margin_requirement,
    "margin_used": 0.0,
    "positions": Value::Object(positions),
    "realized_gains": Value::Object(realized_gains),
  })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowRunStatus {
  #[serde(rename = "IDLE")]
  Idle,
  #[serde(rename = "IN_PROGRESS")]
  InProgress,
  #[serde(rename = "COMPLETE")]
  Complete,
  #[serde(rename = "ERROR")]
  Error,
}

impl FlowRunStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      FlowRunStatus::Idle => "IDLE",
      FlowRunStatus::InProgress => "IN_PROGRESS",
      FlowRunStatus::Complete => "COMPLETE",
      FlowRunStatus::Error => "ERROR",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "IDLE" => Some(FlowRunStatus::Idle),
      "IN_PROGRESS" => Some(FlowRunStatus::InProgress),
      "COMPLETE" => Some(FlowRunStatus::Complete),
      "ERROR" => Some(FlowRunStatus::Error),
      _ => None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, FlowRunStatus::Complete | FlowRunStatus::Error)
  }
}

/// A saved DAG definition. Nodes/edges/viewport/data are opaque UI blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
  pub id: i64,
  pub name: String,
  pub description: Option<String>,
  pub nodes: Value,
  pub edges: Value,
  pub viewport: Option<Value>,
  pub data: Option<Value>,
  pub is_template: bool,
  pub tags: Vec<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowCreateRequest {
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  pub nodes: Value,
  pub edges: Value,
  #[serde(default)]
  pub viewport: Option<Value>,
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub is_template: bool,
  #[serde(default)]
  pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowUpdateRequest {
  pub name: Option<String>,
  pub description: Option<String>,
  pub nodes: Option<Value>,
  pub edges: Option<Value>,
  pub viewport: Option<Value>,
  pub data: Option<Value>,
  pub is_template: Option<bool>,
  pub tags: Option<Vec<String>>,
}

/// One execution of a flow, with its lifecycle timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
  pub id: i64,
  pub flow_id: i64,
  pub run_number: i64,
  pub status: FlowRunStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub request_data: Option<Value>,
  pub results: Option<Value>,
  pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowRunCreateRequest {
  #[serde(default)]
  pub request_data: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowRunUpdateRequest {
  pub status: Option<FlowRunStatus>,
  pub results: Option<Value>,
  pub error_message: Option<String>,
}
