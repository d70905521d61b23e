use serde::Serialize;
use serde_json::Value;

/// Server-sent events emitted over the hedge-fund run stream. Every frame
/// is `data: <json>\n\n`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
  Start,
  ProgressUpdate {
    agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ticker: Option<String>,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<String>,
    timestamp: String,
  },
  Error {
    message: String,
  },
  Complete {
    data: Value,
  },
}

impl RunEvent {
  pub fn to_sse(&self) -> String {
    let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
    format!("data: {}\n\n", json)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn frames_are_terminated_with_double_newline() {
    let frame = RunEvent::Start.to_sse();
    assert!(frame.starts_with("data: "));
    assert!(frame.ends_with("\n\n"));
    let body: Value = serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
    assert_eq!(body["type"], "start");
  }

  #[test]
  fn progress_frames_omit_empty_optionals() {
    let event = RunEvent::ProgressUpdate {
      agent: "fundamentals_agent".to_string(),
      ticker: None,
      status: "Done".to_string(),
      analysis: None,
      timestamp: "2024-01-01T00:00:00Z".to_string(),
    };
    let frame = event.to_sse();
    assert!(!frame.contains("ticker"));
    assert!(!frame.contains("analysis"));
  }

  #[test]
  fn complete_frames_carry_the_payload() {
    let event = RunEvent::Complete { data: json!({"decisions": {"AAPL": {"action": "buy"}}}) };
    let body: Value =
      serde_json::from_str(event.to_sse().trim_start_matches("data: ").trim()).unwrap();
    assert_eq!(body["type"], "complete");
    assert_eq!(body["data"]["decisions"]["AAPL"]["action"], "buy");
  }
}
