use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A structured message appended by one node: the emitting agent's name
/// plus its JSON payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamedMessage {
  pub name: String,
  pub content: String,
}

impl NamedMessage {
  pub fn new(name: &str, content: impl Into<String>) -> Self {
    NamedMessage { name: name.to_string(), content: content.into() }
  }
}

/// Shared run state flowing through the graph. The engine holds the only
/// mutable copy; nodes receive a snapshot and hand back a delta.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentState {
  pub messages: Vec<NamedMessage>,
  pub data: HashMap<String, Value>,
  pub metadata: HashMap<String, Value>,
}

/// The partial update a node returns.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateDelta {
  pub messages: Option<Vec<NamedMessage>>,
  pub data: Option<HashMap<String, Value>>,
  pub metadata: Option<HashMap<String, Value>>,
}

impl AgentState {
  pub fn new() -> Self {
    AgentState::default()
  }

  pub fn tickers(&self) -> Vec<String> {
    self
      .data
      .get("tickers")
      .and_then(Value::as_array)
      .map(|arr| arr.iter().filter_map(Value::as_str).map(String::from).collect())
      .unwrap_or_default()
  }

  pub fn string_field(&self, key: &str) -> Option<String> {
    self.data.get(key).and_then(Value::as_str).map(String::from)
  }

  /// Apply a node's delta. Messages append in arrival order; `data` keys
  /// are last-writer-wins except `analyst_signals`, which merges per agent
  /// key so concurrent analysts never clobber each other.
  pub fn update_from_delta(&mut self, delta: StateDelta) {
    if let Some(new_messages) = delta.messages {
      self.messages.extend(new_messages);
    }

    if let Some(new_data) = delta.data {
      for (key, value) in new_data {
        if key == "analyst_signals" {
          merge_signal_maps(self.data.entry(key).or_insert_with(|| Value::Object(Default::default())), value);
        } else {
          self.data.insert(key, value);
        }
      }
    }

    if let Some(new_metadata) = delta.metadata {
      self.metadata.extend(new_metadata);
    }
  }

  pub fn analyst_signals(&self) -> Value {
    self.data.get("analyst_signals").cloned().unwrap_or_else(|| serde_json::json!({}))
  }
}

fn merge_signal_maps(existing: &mut Value, incoming: Value) {
  match (existing.as_object_mut(), incoming) {
    (Some(target), Value::Object(source)) => {
      for (agent, signals) in source {
        target.insert(agent, signals);
      }
    }
    (_, incoming) => *existing = incoming,
  }
}

impl StateDelta {
  pub fn new() -> Self {
    StateDelta::default()
  }

  pub fn with_messages(mut self, messages: Vec<NamedMessage>) -> Self {
    self.messages = Some(messages);
    self
  }

  pub fn with_data(mut self, data: HashMap<String, Value>) -> Self {
    self.data = Some(data);
    self
  }

  pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
    self.metadata = Some(metadata);
    self
  }

  /// Delta carrying one agent's signal map plus its message, the common
  /// shape every analyst returns.
  pub fn for_agent_signals(agent_key: &str, signals: Value) -> Self {
    let content = serde_json::to_string(&signals).unwrap_or_else(|_| "{}".to_string());
    let mut data = HashMap::new();
    data.insert(
      "analyst_signals".to_string(),
      serde_json::json!({ agent_key: signals }),
    );
    StateDelta::new()
      .with_messages(vec![NamedMessage::new(agent_key, content)])
      .with_data(data)
  }
}

/// Pretty-print one agent's output to the log when reasoning display is on.
pub fn show_agent_reasoning(output: &str, agent_name: &str) {
  log::info!("{:=<10} {:^28} {:=<10}", "", agent_name, "");
  match serde_json::from_str::<Value>(output) {
    Ok(value) => match serde_json::to_string_pretty(&value) {
      Ok(pretty) => log::info!("{}", pretty),
      Err(_) => log::info!("{:?}", value),
    },
    Err(_) => log::info!("{}", output),
  }
  log::info!("{:=<48}", "");
}
