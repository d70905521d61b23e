use anyhow::Error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ai_agent::agents::Signal;
use crate::ai_agent::data::models::FinancialMetrics;
use crate::ai_agent::graph::context::AgentContext;
use crate::ai_agent::graph::graph::AgentFuture;
use crate::ai_agent::graph::state::{show_agent_reasoning, AgentState, StateDelta};
use crate::ai_agent::llm::call::{call_model, DEFAULT_MAX_RETRIES};
use crate::ai_agent::llm::model_provider::ChatMessage;

pub const SIGNAL_KEY: &str = "warren_buffett_agent";
pub const AGENT_ID: &str = "warren_buffett";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarrenBuffettSignal {
  pub signal: Signal,
  pub confidence: f64,
  pub reasoning: String,
}

impl WarrenBuffettSignal {
  fn neutral() -> Self {
    WarrenBuffettSignal {
      signal: Signal::Neutral,
      confidence: 0.0,
      reasoning: "Error in analysis, using default".to_string(),
    }
  }
}

/// Value-investing analyst: pre-scores the fundamentals, then asks the LLM
/// for a verdict in Buffett's framework. LLM trouble degrades to neutral.
pub struct WarrenBuffettAgent;

impl WarrenBuffettAgent {
  pub fn new() -> Self {
    WarrenBuffettAgent {}
  }

  pub fn static_warren_buffett_agent(state: AgentState, ctx: AgentContext) -> AgentFuture {
    Box::pin(async move { WarrenBuffettAgent::new().run(state, ctx).await })
  }

  pub async fn run(&self, state: AgentState, ctx: AgentContext) -> Result<StateDelta, Error> {
    let tickers = state.tickers();
    let end_date = state.string_field("end_date").unwrap_or_default();

    let mut analysis: serde_json::Map<String, Value> = serde_json::Map::new();

    for ticker in &tickers {
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Fetching financial metrics");
      let metrics = ctx.provider.get_financial_metrics(ticker, &end_date, "ttm", 5).await?;

      let latest = match metrics.first() {
        Some(m) => m,
        None => {
          ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Failed: No financial metrics found");
          continue;
        }
      };

      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Getting market cap");
      let market_cap = ctx.provider.get_market_cap(ticker, &end_date).await?;

      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Analyzing fundamentals");
      let (score, details) = fundamental_score(latest);

      let analysis_data = json!({
        "ticker": ticker,
        "score": score,
        "max_score": 7,
        "details": details,
        "market_cap": market_cap,
        "metrics": {
          "return_on_equity": latest.return_on_equity,
          "debt_to_equity": latest.debt_to_equity,
          "operating_margin": latest.operating_margin,
          "current_ratio": latest.current_ratio,
          "price_to_earnings_ratio": latest.price_to_earnings_ratio,
          "earnings_growth": latest.earnings_growth,
        },
      });

      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Generating Warren Buffett analysis");
      let (model_name, model_provider) = ctx.options.agent_model(AGENT_ID);
      let signal: WarrenBuffettSignal = call_model(
        build_prompt(ticker, &analysis_data),
        &model_name,
        model_provider,
        SIGNAL_KEY,
        &ctx.bus,
        ctx.chatters.as_ref(),
        DEFAULT_MAX_RETRIES,
        WarrenBuffettSignal::neutral,
      )
      .await;

      analysis.insert(ticker.clone(), serde_json::to_value(&signal)?);
      ctx.bus.update_with_analysis(SIGNAL_KEY, Some(ticker.as_str()), "Done", &signal.reasoning);
    }

    let analysis = Value::Object(analysis);
    if ctx.options.show_reasoning {
      show_agent_reasoning(&analysis.to_string(), "Warren Buffett Agent");
    }
    ctx.bus.update_status(SIGNAL_KEY, None, "Done");

    Ok(StateDelta::for_agent_signals(SIGNAL_KEY, analysis))
  }
}

/// Buffett-style scorecard out of 7: durable returns on equity, modest
/// leverage, fat operating margins, comfortable liquidity.
fn fundamental_score(m: &FinancialMetrics) -> (u32, Vec<String>) {
  let mut score = 0;
  let mut details = Vec::new();

  match m.return_on_equity {
    Some(roe) if roe > 0.15 => {
      score += 2;
      details.push(format!("Strong ROE of {:.1}%", roe * 100.0));
    }
    Some(roe) => details.push(format!("Weak ROE of {:.1}%", roe * 100.0)),
    None => details.push("ROE data not available".to_string()),
  }

  match m.debt_to_equity {
    Some(de) if de < 0.5 => {
      score += 2;
      details.push("Conservative debt levels".to_string());
    }
    Some(_) => details.push("High debt to equity ratio".to_string()),
    None => details.push("Debt to equity data not available".to_string()),
  }

  match m.operating_margin {
    Some(margin) if margin > 0.15 => {
      score += 2;
      details.push("Strong operating margins".to_string());
    }
    Some(_) => details.push("Weak operating margins".to_string()),
    None => details.push("Operating margin data not available".to_string()),
  }

  match m.current_ratio {
    Some(ratio) if ratio > 1.5 => {
      score += 1;
      details.push("Good liquidity position".to_string());
    }
    Some(_) => details.push("Weak liquidity".to_string()),
    None => details.push("Current ratio data not available".to_string()),
  }

  (score, details)
}

fn build_prompt(ticker: &str, analysis_data: &Value) -> Vec<ChatMessage> {
  let system = "You are a Warren Buffett AI agent. Decide on investment signals based on Warren Buffett's principles: \
                circle of competence, margin of safety, economic moats, quality management, and long-term horizons. \
                When writing your reasoning, speak in Buffett's voice and ground every claim in the supplied numbers.";

  let user = format!(
    "Based on the following data, create the investment signal as Warren Buffett would for {}:\n\n\
     Analysis Data:\n{}\n\n\
     Return strictly the following JSON:\n\
     {{\n  \"signal\": \"bullish/bearish/neutral\",\n  \"confidence\": float between 0 and 100,\n  \"reasoning\": \"string\"\n}}",
    ticker,
    serde_json::to_string_pretty(analysis_data).unwrap_or_default()
  );

  vec![ChatMessage::system(system), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ai_agent::testing::{test_context, test_context_with_reply};
  use serde_json::json;
  use std::collections::HashMap;

  fn state_for(tickers: &[&str]) -> AgentState {
    let mut state = AgentState::new();
    let mut data = HashMap::new();
    data.insert("tickers".to_string(), json!(tickers));
    data.insert("start_date".to_string(), json!("2024-01-01"));
    data.insert("end_date".to_string(), json!("2024-03-01"));
    data.insert("analyst_signals".to_string(), json!({}));
    state.update_from_delta(StateDelta::new().with_data(data));
    state
  }

  #[tokio::test]
  async fn parses_the_llm_verdict() {
    let ctx = test_context_with_reply(
      r#"{"signal": "bullish", "confidence": 85.0, "reasoning": "wonderful business at a fair price"}"#,
    );
    let delta = WarrenBuffettAgent::new().run(state_for(&["AAPL"]), ctx).await.unwrap();

    let data = delta.data.unwrap();
    let entry = &data["analyst_signals"][SIGNAL_KEY]["AAPL"];
    assert_eq!(entry["signal"], "bullish");
    assert_eq!(entry["confidence"], 85.0);
  }

  #[tokio::test]
  async fn degrades_to_neutral_when_llm_is_unavailable() {
    let ctx = test_context();
    let delta = WarrenBuffettAgent::new().run(state_for(&["AAPL"]), ctx).await.unwrap();

    let data = delta.data.unwrap();
    let entry = &data["analyst_signals"][SIGNAL_KEY]["AAPL"];
    assert_eq!(entry["signal"], "neutral");
    assert_eq!(entry["confidence"], 0.0);
  }

  #[test]
  fn scorecard_rewards_quality_metrics() {
    let m = FinancialMetrics {
      ticker: "AAPL".to_string(),
      report_period: "2024-03-01".to_string(),
      period: "ttm".to_string(),
      currency: "USD".to_string(),
      market_cap: None,
      enterprise_value: None,
      price_to_earnings_ratio: None,
      price_to_book_ratio: None,
      price_to_sales_ratio: None,
      enterprise_value_to_ebitda_ratio: None,
      free_cash_flow_yield: None,
      peg_ratio: None,
      gross_margin: None,
      operating_margin: Some(0.25),
      net_margin: None,
      return_on_equity: Some(0.30),
      return_on_assets: None,
      return_on_invested_capital: None,
      current_ratio: Some(2.0),
      quick_ratio: None,
      debt_to_equity: Some(0.2),
      debt_to_assets: None,
      interest_coverage: None,
      revenue_growth: None,
      earnings_growth: None,
      book_value_growth: None,
      earnings_per_share_growth: None,
      free_cash_flow_growth: None,
      payout_ratio: None,
      earnings_per_share: None,
      book_value_per_share: None,
      free_cash_flow_per_share: None,
    };
    let (score, details) = fundamental_score(&m);
    assert_eq!(score, 7);
    assert_eq!(details.len(), 4);
  }
}
