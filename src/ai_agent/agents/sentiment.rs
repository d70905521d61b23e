use anyhow::Error;
use serde_json::{json, Value};

use crate::ai_agent::agents::combine_votes;
use crate::ai_agent::graph::context::AgentContext;
use crate::ai_agent::graph::graph::AgentFuture;
use crate::ai_agent::graph::state::{show_agent_reasoning, AgentState, StateDelta};

pub const SIGNAL_KEY: &str = "sentiment_agent";

// Insider trades speak quieter than the news flow.
const INSIDER_WEIGHT: f64 = 0.3;
const NEWS_WEIGHT: f64 = 0.7;

/// Blends insider-trade direction with news sentiment per ticker.
pub struct SentimentAgent;

impl SentimentAgent {
  pub fn new() -> Self {
    SentimentAgent {}
  }

  pub fn static_sentiment_agent(state: AgentState, ctx: AgentContext) -> AgentFuture {
    Box::pin(async move { SentimentAgent::new().run(state, ctx).await })
  }

  pub async fn run(&self, state: AgentState, ctx: AgentContext) -> Result<StateDelta, Error> {
    let tickers = state.tickers();
    let start_date = state.string_field("start_date");
    let end_date = state.string_field("end_date").unwrap_or_default();

    let mut analysis: serde_json::Map<String, Value> = serde_json::Map::new();

    for ticker in &tickers {
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Fetching insider trades");
      let trades = ctx
        .provider
        .get_insider_trades(ticker, &end_date, start_date.as_deref(), 1000)
        .await?;

      // Sellers read bearish, buyers bullish.
      let insider_bearish =
        trades.iter().filter(|t| t.transaction_shares.map_or(false, |s| s < 0.0)).count() as f64;
      let insider_bullish =
        trades.iter().filter(|t| t.transaction_shares.map_or(false, |s| s > 0.0)).count() as f64;

      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Fetching company news");
      let news = ctx
        .provider
        .get_company_news(ticker, &end_date, start_date.as_deref(), 100)
        .await?;

      let news_bullish =
        news.iter().filter(|n| n.sentiment.as_deref() == Some("positive")).count() as f64;
      let news_bearish =
        news.iter().filter(|n| n.sentiment.as_deref() == Some("negative")).count() as f64;

      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Combining signals");
      let weighted_bullish = insider_bullish * INSIDER_WEIGHT + news_bullish * NEWS_WEIGHT;
      let weighted_bearish = insider_bearish * INSIDER_WEIGHT + news_bearish * NEWS_WEIGHT;
      let total = (trades.len() as f64) * INSIDER_WEIGHT + (news.len() as f64) * NEWS_WEIGHT;
      let (signal, confidence) = combine_votes(weighted_bullish, weighted_bearish, total);

      let reasoning = format!(
        "Weighted Bullish signals: {:.1}, Weighted Bearish signals: {:.1}",
        weighted_bullish, weighted_bearish
      );
      analysis.insert(
        ticker.clone(),
        json!({"signal": signal, "confidence": confidence, "reasoning": reasoning}),
      );
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Done");
    }

    let analysis = Value::Object(analysis);
    if ctx.options.show_reasoning {
      show_agent_reasoning(&analysis.to_string(), "Sentiment Analysis Agent");
    }
    ctx.bus.update_status(SIGNAL_KEY, None, "Done");

    Ok(StateDelta::for_agent_signals(SIGNAL_KEY, analysis))
  }
}
