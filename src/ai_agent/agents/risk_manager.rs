use anyhow::Error;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use crate::ai_agent::data::provider::{latest_close, prices_to_df};
use crate::ai_agent::graph::context::AgentContext;
use crate::ai_agent::graph::graph::AgentFuture;
use crate::ai_agent::graph::state::{show_agent_reasoning, AgentState, StateDelta};

pub const SIGNAL_KEY: &str = "risk_management_agent";

// One ticker may occupy at most this share of net liquidation value.
const POSITION_LIMIT_PCT: f64 = 0.20;

/// Sizes the remaining position budget per ticker from current prices and
/// the portfolio snapshot.
pub struct RiskManagerAgent;

impl RiskManagerAgent {
  pub fn new() -> Self {
    RiskManagerAgent {}
  }

  pub fn static_risk_management_agent(state: AgentState, ctx: AgentContext) -> AgentFuture {
    Box::pin(async move { RiskManagerAgent::new().run(state, ctx).await })
  }

  pub async fn run(&self, state: AgentState, ctx: AgentContext) -> Result<StateDelta, Error> {
    let tickers = state.tickers();
    let start_date = state.string_field("start_date").unwrap_or_default();
    let end_date = state.string_field("end_date").unwrap_or_default();
    let portfolio = state.data.get("portfolio").cloned().unwrap_or_else(|| json!({}));

    // Price everything we were asked about plus everything already held.
    let mut relevant: Vec<String> = tickers.clone();
    let held: HashSet<String> = portfolio
      .get("positions")
      .and_then(Value::as_object)
      .map(|positions| positions.keys().cloned().collect())
      .unwrap_or_default();
    for ticker in held {
      if !relevant.contains(&ticker) {
        relevant.push(ticker);
      }
    }

    let mut current_prices: HashMap<String, f64> = HashMap::new();
    for ticker in &relevant {
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Fetching price data");
      let prices = ctx.provider.get_prices(ticker, &start_date, &end_date).await?;
      if prices.is_empty() {
        ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Warning: No price data found");
        continue;
      }
      let frame = prices_to_df(&prices)?;
      match latest_close(&frame) {
        Some(price) => {
          current_prices.insert(ticker.clone(), price);
          ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), &format!("Current price: {:.2}", price));
        }
        None => {
          ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Warning: Empty price data");
        }
      }
    }

    // Net liquidation value: cash plus longs minus shorts at market.
    let cash = portfolio.get("cash").and_then(Value::as_f64).unwrap_or(0.0);
    let mut total_portfolio_value = cash;
    if let Some(positions) = portfolio.get("positions").and_then(Value::as_object) {
      for (ticker, position) in positions {
        if let Some(price) = current_prices.get(ticker) {
          let long = position.get("long").and_then(Value::as_f64).unwrap_or(0.0);
          let short = position.get("short").and_then(Value::as_f64).unwrap_or(0.0);
          total_portfolio_value += long * price;
          total_portfolio_value -= short * price;
        }
      }
    }
    ctx.bus.update_status(
      SIGNAL_KEY,
      None,
      &format!("Total portfolio value: {:.2}", total_portfolio_value),
    );

    let mut risk_analysis: serde_json::Map<String, Value> = serde_json::Map::new();
    for ticker in &tickers {
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Calculating position limits");

      let price = match current_prices.get(ticker) {
        Some(price) => *price,
        None => {
          ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Failed: No price data available");
          risk_analysis.insert(
            ticker.clone(),
            json!({
              "remaining_position_limit": 0.0,
              "current_price": 0.0,
              "reasoning": {"error": "Missing price data for risk calculation"},
            }),
          );
          continue;
        }
      };

      let position = portfolio
        .get("positions")
        .and_then(|p| p.get(ticker))
        .cloned()
        .unwrap_or_else(|| json!({}));
      let long_value = position.get("long").and_then(Value::as_f64).unwrap_or(0.0) * price;
      let short_value = position.get("short").and_then(Value::as_f64).unwrap_or(0.0) * price;
      let current_position_value = (long_value - short_value).abs();

      let position_limit = total_portfolio_value * POSITION_LIMIT_PCT;
      let remaining_limit = position_limit - current_position_value;
      let max_position_size = remaining_limit.min(cash);

      risk_analysis.insert(
        ticker.clone(),
        json!({
          "remaining_position_limit": max_position_size,
          "current_price": price,
          "reasoning": {
            "portfolio_value": total_portfolio_value,
            "current_position_value": current_position_value,
            "position_limit": position_limit,
            "remaining_limit": remaining_limit,
            "available_cash": cash,
          },
        }),
      );
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Done");
    }

    let risk_analysis = Value::Object(risk_analysis);
    if ctx.options.show_reasoning {
      show_agent_reasoning(&risk_analysis.to_string(), "Risk Management Agent");
    }

    Ok(StateDelta::for_agent_signals(SIGNAL_KEY, risk_analysis))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ai_agent::testing::{test_context, MockDataProvider};
  use serde_json::json;
  use std::collections::HashMap as StdHashMap;
  use std::sync::Arc;

  fn state_with_portfolio(tickers: &[&str], portfolio: Value) -> AgentState {
    let mut state = AgentState::new();
    let mut data = StdHashMap::new();
    data.insert("tickers".to_string(), json!(tickers));
    data.insert("start_date".to_string(), json!("2024-01-01"));
    data.insert("end_date".to_string(), json!("2024-02-15"));
    data.insert("portfolio".to_string(), portfolio);
    data.insert("analyst_signals".to_string(), json!({}));
    state.update_from_delta(StateDelta::new().with_data(data));
    state
  }

  #[tokio::test]
  async fn limits_are_twenty_percent_of_portfolio_value_capped_by_cash() {
    let portfolio = json!({
      "cash": 100000.0,
      "margin_requirement": 0.0,
      "margin_used": 0.0,
      "positions": {},
      "realized_gains": {},
    });
    let ctx = test_context();
    let delta = RiskManagerAgent::new()
      .run(state_with_portfolio(&["AAPL"], portfolio), ctx)
      .await
      .unwrap();

    let data = delta.data.unwrap();
    let entry = &data["analyst_signals"][SIGNAL_KEY]["AAPL"];
    let limit = entry["remaining_position_limit"].as_f64().unwrap();
    // Nothing held, so the remaining limit is the full 20% of NLV (= cash).
    assert!((limit - 20000.0).abs() < 1e-6);
    assert!(entry["current_price"].as_f64().unwrap() > 0.0);
  }

  #[tokio::test]
  async fn missing_prices_zero_the_limit_instead_of_failing() {
    let portfolio = json!({"cash": 50000.0, "positions": {}});
    let mut ctx = test_context();
    ctx.provider = Arc::new(MockDataProvider::without_data_for("GHOST"));

    let delta = RiskManagerAgent::new()
      .run(state_with_portfolio(&["GHOST"], portfolio), ctx)
      .await
      .unwrap();

    let data = delta.data.unwrap();
    let entry = &data["analyst_signals"][SIGNAL_KEY]["GHOST"];
    assert_eq!(entry["remaining_position_limit"], 0.0);
    assert_eq!(entry["reasoning"]["error"], "Missing price data for risk calculation");
  }

  #[tokio::test]
  async fn held_positions_reduce_the_remaining_limit() {
    // A held long position counts against the 20% budget.
    let portfolio = json!({
      "cash": 10000.0,
      "positions": {
        "AAPL": {"long": 100, "short": 0, "long_cost_basis": 150.0, "short_cost_basis": 0.0, "short_margin_used": 0.0},
      },
    });
    let ctx = test_context();
    let delta = RiskManagerAgent::new()
      .run(state_with_portfolio(&["AAPL"], portfolio), ctx)
      .await
      .unwrap();

    let data = delta.data.unwrap();
    let entry = &data["analyst_signals"][SIGNAL_KEY]["AAPL"];
    let reasoning = &entry["reasoning"];
    let portfolio_value = reasoning["portfolio_value"].as_f64().unwrap();
    let position_value = reasoning["current_position_value"].as_f64().unwrap();
    assert!(portfolio_value > 10000.0);
    assert!(position_value > 0.0);
    let remaining = reasoning["remaining_limit"].as_f64().unwrap();
    assert!((remaining - (portfolio_value * 0.20 - position_value)).abs() < 1e-6);
  }
}
