use anyhow::Error;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;

use crate::ai_agent::graph::context::AgentContext;
use crate::ai_agent::graph::graph::AgentFuture;
use crate::ai_agent::graph::state::{show_agent_reasoning, AgentState, NamedMessage, StateDelta};
use crate::ai_agent::llm::call::{call_model, DEFAULT_MAX_RETRIES};
use crate::ai_agent::llm::model_provider::ChatMessage;

pub const NODE_NAME: &str = "portfolio_manager";
pub const AGENT_ID: &str = "portfolio_manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
  #[serde(rename = "buy")]
  Buy,
  #[serde(rename = "sell")]
  Sell,
  #[serde(rename = "short")]
  Short,
  #[serde(rename = "cover")]
  Cover,
  #[serde(rename = "hold")]
  Hold,
}

impl Action {
  pub fn as_str(&self) -> &'static str {
    match self {
      Action::Buy => "buy",
      Action::Sell => "sell",
      Action::Short => "short",
      Action::Cover => "cover",
      Action::Hold => "hold",
    }
  }
}

impl FromStr for Action {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "buy" => Ok(Action::Buy),
      "sell" => Ok(Action::Sell),
      "short" => Ok(Action::Short),
      "cover" => Ok(Action::Cover),
      "hold" => Ok(Action::Hold),
      _ => Err(format!("Unknown action: {}", s)),
    }
  }
}

impl<'de> Deserialize<'de> for Action {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Action::from_str(&s).map_err(serde::de::Error::custom)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioDecision {
  pub action: Action,
  pub quantity: i64,
  pub confidence: f64,
  pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioManagerOutput {
  pub decisions: HashMap<String, PortfolioDecision>,
}

/// Final decision maker: condenses the analyst signals and risk limits into
/// one buy/sell/short/cover/hold call per ticker via the LLM, defaulting to
/// hold-everything when the model cannot be reached.
pub struct PortfolioManagerAgent;

impl PortfolioManagerAgent {
  pub fn new() -> Self {
    PortfolioManagerAgent {}
  }

  pub fn static_portfolio_management_agent(state: AgentState, ctx: AgentContext) -> AgentFuture {
    Box::pin(async move { PortfolioManagerAgent::new().run(state, ctx).await })
  }

  pub async fn run(&self, state: AgentState, ctx: AgentContext) -> Result<StateDelta, Error> {
    let tickers = state.tickers();
    let portfolio = state.data.get("portfolio").cloned().unwrap_or_else(|| json!({}));
    let analyst_signals = state.analyst_signals();

    ctx.bus.update_status(NODE_NAME, None, "Processing analyst signals");

    let mut position_limits: HashMap<String, f64> = HashMap::new();
    let mut current_prices: HashMap<String, f64> = HashMap::new();
    let mut max_shares: HashMap<String, i64> = HashMap::new();
    let mut signals_by_ticker: HashMap<String, Value> = HashMap::new();

    for ticker in &tickers {
      let risk_data = analyst_signals
        .get("risk_management_agent")
        .and_then(|agent| agent.get(ticker))
        .cloned()
        .unwrap_or(Value::Null);

      let position_limit =
        risk_data.get("remaining_position_limit").and_then(Value::as_f64).unwrap_or(0.0);
      let current_price = risk_data.get("current_price").and_then(Value::as_f64).unwrap_or(0.0);

      position_limits.insert(ticker.clone(), position_limit);
      current_prices.insert(ticker.clone(), current_price);
      max_shares.insert(
        ticker.clone(),
        if current_price > 0.0 { (position_limit / current_price) as i64 } else { 0 },
      );

      // Everything except the risk row feeds the decision prompt.
      let mut ticker_signals = serde_json::Map::new();
      if let Some(agents) = analyst_signals.as_object() {
        for (agent, signals) in agents {
          if agent == "risk_management_agent" {
            continue;
          }
          if let Some(signal) = signals.get(ticker) {
            ticker_signals.insert(
              agent.clone(),
              json!({
                "signal": signal.get("signal").cloned().unwrap_or(Value::Null),
                "confidence": signal.get("confidence").cloned().unwrap_or(Value::Null),
              }),
            );
          }
        }
      }
      signals_by_ticker.insert(ticker.clone(), Value::Object(ticker_signals));
    }

    ctx.bus.update_status(NODE_NAME, None, "Generating trading decisions");
    let (model_name, model_provider) = ctx.options.agent_model(AGENT_ID);
    let tickers_for_default = tickers.clone();
    let output: PortfolioManagerOutput = call_model(
      build_prompt(&signals_by_ticker, &current_prices, &max_shares, &portfolio)?,
      &model_name,
      model_provider,
      NODE_NAME,
      &ctx.bus,
      ctx.chatters.as_ref(),
      DEFAULT_MAX_RETRIES,
      move || default_holds(&tickers_for_default),
    )
    .await;

    // Every requested ticker gets a decision even if the model skipped it.
    let mut decisions = output.decisions;
    for ticker in &tickers {
      decisions.entry(ticker.clone()).or_insert_with(|| PortfolioDecision {
        action: Action::Hold,
        quantity: 0,
        confidence: 0.0,
        reasoning: "No decision returned by the model, defaulting to hold".to_string(),
      });
    }

    let content = serde_json::to_string(&decisions)?;
    if ctx.options.show_reasoning {
      show_agent_reasoning(&content, "Portfolio Manager");
    }
    ctx.bus.update_status(NODE_NAME, None, "Done");

    Ok(StateDelta::new().with_messages(vec![NamedMessage::new(NODE_NAME, content)]))
  }
}

pub fn default_holds(tickers: &[String]) -> PortfolioManagerOutput {
  let decisions = tickers
    .iter()
    .map(|ticker| {
      (
        ticker.clone(),
        PortfolioDecision {
          action: Action::Hold,
          quantity: 0,
          confidence: 0.0,
          reasoning: "Error in portfolio management, defaulting to hold".to_string(),
        },
      )
    })
    .collect();
  PortfolioManagerOutput { decisions }
}

fn build_prompt(
  signals_by_ticker: &HashMap<String, Value>,
  current_prices: &HashMap<String, f64>,
  max_shares: &HashMap<String, i64>,
  portfolio: &Value,
) -> Result<Vec<ChatMessage>, Error> {
  let cash = portfolio.get("cash").and_then(Value::as_f64).unwrap_or(0.0);
  let positions = portfolio.get("positions").cloned().unwrap_or_else(|| json!({}));
  let margin_requirement =
    portfolio.get("margin_requirement").and_then(Value::as_f64).unwrap_or(0.0);
  let margin_used = portfolio.get("margin_used").and_then(Value::as_f64).unwrap_or(0.0);

  let system = "You are a portfolio manager making final trading decisions based on multiple tickers.\n\
                Trading Rules:\n\
                - Only buy with available cash; buy quantity must not exceed max_shares for that ticker\n\
                - Only sell long shares you hold; sell quantity must not exceed the long position\n\
                - Only short with available margin (position value x margin requirement)\n\
                - Only cover shares currently shorted; cover quantity must not exceed the short position\n\
                Available actions: \"buy\", \"sell\", \"short\", \"cover\", \"hold\"";

  let user = format!(
    "Based on the team's analysis, make your trading decisions for each ticker.\n\n\
     Signals by ticker:\n{}\n\n\
     Current prices:\n{}\n\n\
     Maximum shares allowed for purchases:\n{}\n\n\
     Portfolio cash: {:.2}\n\
     Current positions: {}\n\
     Current margin requirement: {:.2}\n\
     Total margin used: {:.2}\n\n\
     Output strictly in JSON with the following structure:\n\
     {{\"decisions\": {{\"TICKER\": {{\"action\": \"buy/sell/short/cover/hold\", \"quantity\": integer, \"confidence\": float, \"reasoning\": \"string\"}}}}}}",
    serde_json::to_string_pretty(signals_by_ticker)?,
    serde_json::to_string_pretty(current_prices)?,
    serde_json::to_string_pretty(max_shares)?,
    cash,
    serde_json::to_string_pretty(&positions)?,
    margin_requirement,
    margin_used,
  );

  Ok(vec![ChatMessage::system(system), ChatMessage::user(user)])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ai_agent::testing::{test_context, test_context_with_reply};
  use std::collections::HashMap as StdHashMap;

  fn state_with_signals(tickers: &[&str]) -> AgentState {
    let mut state = AgentState::new();
    let mut data = StdHashMap::new();
    data.insert("tickers".to_string(), json!(tickers));
    data.insert("portfolio".to_string(), json!({"cash": 100000.0, "positions": {}}));
    data.insert("analyst_signals".to_string(), json!({
      "technical_analyst_agent": {
        "AAPL": {"signal": "bullish", "confidence": 70.0},
      },
      "risk_management_agent": {
        "AAPL": {"remaining_position_limit": 20000.0, "current_price": 200.0},
      },
    }));
    state.update_from_delta(StateDelta::new().with_data(data));
    state
  }

  #[tokio::test]
  async fn emits_decisions_message_from_llm_reply() {
    let reply = json!({
      "decisions": {
        "AAPL": {"action": "buy", "quantity": 10, "confidence": 80.0, "reasoning": "strong signals"},
      }
    })
    .to_string();
    let ctx = test_context_with_reply(&reply);

    let delta = PortfolioManagerAgent::new().run(state_with_signals(&["AAPL"]), ctx).await.unwrap();
    let messages = delta.messages.unwrap();
    assert_eq!(messages[0].name, NODE_NAME);

    let decisions: HashMap<String, PortfolioDecision> =
      serde_json::from_str(&messages[0].content).unwrap();
    assert_eq!(decisions["AAPL"].action, Action::Buy);
    assert_eq!(decisions["AAPL"].quantity, 10);
  }

  #[tokio::test]
  async fn missing_tickers_are_filled_with_holds() {
    let reply = json!({"decisions": {}}).to_string();
    let ctx = test_context_with_reply(&reply);

    let delta = PortfolioManagerAgent::new().run(state_with_signals(&["AAPL"]), ctx).await.unwrap();
    let messages = delta.messages.unwrap();
    let decisions: HashMap<String, PortfolioDecision> =
      serde_json::from_str(&messages[0].content).unwrap();
    assert_eq!(decisions["AAPL"].action, Action::Hold);
  }

  #[tokio::test]
  async fn llm_failure_defaults_every_ticker_to_hold() {
    let ctx = test_context();
    let delta = PortfolioManagerAgent::new().run(state_with_signals(&["AAPL"]), ctx).await.unwrap();
    let messages = delta.messages.unwrap();
    let decisions: HashMap<String, PortfolioDecision> =
      serde_json::from_str(&messages[0].content).unwrap();
    assert_eq!(decisions["AAPL"].action, Action::Hold);
    assert_eq!(decisions["AAPL"].quantity, 0);
  }

  #[test]
  fn action_parses_case_insensitively() {
    assert_eq!(Action::from_str("BUY").unwrap(), Action::Buy);
    assert_eq!(Action::from_str(" cover ").unwrap(), Action::Cover);
    assert!(Action::from_str("yolo").is_err());
  }
}
