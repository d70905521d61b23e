//! Shared fakes for unit tests: a deterministic market-data provider and a
//! scripted LLM factory.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::Arc;

use crate::ai_agent::data::models::{
  CompanyNews, FinancialMetrics, InsiderTrade, LineItem, Price,
};
use crate::ai_agent::data::provider::DataProvider;
use crate::ai_agent::graph::context::{AgentContext, RunOptions};
use crate::ai_agent::llm::model_provider::{
  ChatMessage, LLMChatter, LLMModelConfig, LLMResponse, ModelProvider,
};
use crate::ai_agent::llm::models::ChatterFactory;
use crate::ai_agent::progress::ProgressBus;

/// Deterministic provider: synthesizes a gently trending price series per
/// ticker and fixed fundamentals, so agents always have data to chew on.
pub struct MockDataProvider {
  pub missing_tickers: HashSet<String>,
  pub delay: Option<std::time::Duration>,
}

impl MockDataProvider {
  pub fn new() -> Self {
    MockDataProvider { missing_tickers: HashSet::new(), delay: None }
  }

  pub fn without_data_for(ticker: &str) -> Self {
    let mut missing = HashSet::new();
    missing.insert(ticker.to_string());
    MockDataProvider { missing_tickers: missing, delay: None }
  }

  /// A provider that stalls on every price fetch, for cancellation tests.
  pub fn with_delay(delay: std::time::Duration) -> Self {
    MockDataProvider { missing_tickers: HashSet::new(), delay: Some(delay) }
  }

  fn base_price(ticker: &str) -> f64 {
    let seed: u32 = ticker.bytes().map(|b| b as u32).sum();
    50.0 + (seed % 200) as f64
  }
}

#[async_trait]
impl DataProvider for MockDataProvider {
  async fn get_prices(&self, ticker: &str, start_date: &str, end_date: &str) -> Result<Vec<Price>> {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.missing_tickers.contains(ticker) {
      return Ok(Vec::new());
    }
    let start = NaiveDate::parse_from_str(start_date, "%Y-%m-%d")?;
    let end = NaiveDate::parse_from_str(end_date, "%Y-%m-%d")?;
    let base = Self::base_price(ticker);

    let mut prices = Vec::new();
    let mut day = start;
    let mut i = 0usize;
    while day <= end {
      let close = base * (1.0 + 0.002 * i as f64 + 0.015 * (i as f64 * 0.7).sin());
      prices.push(Price {
        open: close * 0.995,
        close,
        high: close * 1.01,
        low: close * 0.99,
        volume: 1_000_000 + (i as i64 * 10_000),
        time: day.format("%Y-%m-%d").to_string(),
      });
      day = day.succ_opt().ok_or_else(|| anyhow!("date overflow"))?;
      i += 1;
    }
    Ok(prices)
  }

  async fn get_financial_metrics(
    &self,
    ticker: &str,
    end_date: &str,
    period: &str,
    _limit: usize,
  ) -> Result<Vec<FinancialMetrics>> {
    if self.missing_tickers.contains(ticker) {
      return Ok(Vec::new());
    }
    Ok(vec![FinancialMetrics {
      ticker: ticker.to_string(),
      report_period: end_date.to_string(),
      period: period.to_string(),
      currency: "USD".to_string(),
      market_cap: Some(1.0e12),
      enterprise_value: Some(1.1e12),
      price_to_earnings_ratio: Some(22.0),
      price_to_book_ratio: Some(4.0),
      price_to_sales_ratio: Some(6.0),
      enterprise_value_to_ebitda_ratio: Some(15.0),
      free_cash_flow_yield: Some(0.04),
      peg_ratio: Some(1.8),
      gross_margin: Some(0.45),
      operating_margin: Some(0.25),
      net_margin: Some(0.22),
      return_on_equity: Some(0.28),
      return_on_assets: Some(0.12),
      return_on_invested_capital: Some(0.18),
      current_ratio: Some(1.8),
      quick_ratio: Some(1.4),
      debt_to_equity: Some(0.4),
      debt_to_assets: Some(0.2),
      interest_coverage: Some(12.0),
      revenue_growth: Some(0.12),
      earnings_growth: Some(0.15),
      book_value_growth: Some(0.11),
      earnings_per_share_growth: Some(0.14),
      free_cash_flow_growth: Some(0.1),
      payout_ratio: Some(0.2),
      earnings_per_share: Some(6.1),
      book_value_per_share: Some(22.0),
      free_cash_flow_per_share: Some(5.5),
    }])
  }

  async fn search_line_items(
    &self,
    ticker: &str,
    line_items: &[String],
    end_date: &str,
    period: &str,
    _limit: usize,
  ) -> Result<Vec<LineItem>> {
    if self.missing_tickers.contains(ticker) {
      return Ok(Vec::new());
    }
    let mut extra = std::collections::HashMap::new();
    for item in line_items {
      extra.insert(item.clone(), serde_json::json!(1.0e9));
    }
    Ok(vec![LineItem {
      ticker: ticker.to_string(),
      report_period: end_date.to_string(),
      period: period.to_string(),
      currency: "USD".to_string(),
      extra,
    }])
  }

  async fn get_insider_trades(
    &self,
    ticker: &str,
    end_date: &str,
    _start_date: Option<&str>,
    _limit: usize,
  ) -> Result<Vec<InsiderTrade>> {
    if self.missing_tickers.contains(ticker) {
      return Ok(Vec::new());
    }
    let trade = |name: &str, shares: f64| InsiderTrade {
      ticker: ticker.to_string(),
      issuer: None,
      name: Some(name.to_string()),
      title: Some("Officer".to_string()),
      is_board_director: Some(false),
      transaction_date: Some(end_date.to_string()),
      transaction_shares: Some(shares),
      transaction_price_per_share: None,
      transaction_value: None,
      shares_owned_before_transaction: None,
      shares_owned_after_transaction: None,
      security_title: None,
      filing_date: Some(end_date.to_string()),
    };
    Ok(vec![trade("alpha", 1200.0), trade("beta", -300.0), trade("gamma", 500.0)])
  }

  async fn get_company_news(
    &self,
    ticker: &str,
    end_date: &str,
    _start_date: Option<&str>,
    _limit: usize,
  ) -> Result<Vec<CompanyNews>> {
    if self.missing_tickers.contains(ticker) {
      return Ok(Vec::new());
    }
    let item = |title: &str, sentiment: &str| CompanyNews {
      ticker: ticker.to_string(),
      title: title.to_string(),
      author: None,
      source: Some("wire".to_string()),
      date: end_date.to_string(),
      url: None,
      sentiment: Some(sentiment.to_string()),
    };
    Ok(vec![
      item("earnings beat expectations", "positive"),
      item("sector outlook mixed", "neutral"),
      item("supply concerns linger", "negative"),
    ])
  }

  async fn get_market_cap(&self, ticker: &str, _end_date: &str) -> Result<Option<f64>> {
    if self.missing_tickers.contains(ticker) {
      return Ok(None);
    }
    Ok(Some(1.0e12))
  }
}

struct CannedChatter {
  reply: String,
}

#[async_trait]
impl LLMChatter for CannedChatter {
  async fn chat(&self, _messages: Vec<ChatMessage>, _config: &LLMModelConfig) -> Result<LLMResponse> {
    Ok(LLMResponse { content: self.reply.clone() })
  }
}

/// Factory producing a chatter that always replies with the given text, or
/// fails outright when constructed with `failing()`.
pub struct ScriptedChatterFactory {
  reply: Option<String>,
}

impl ScriptedChatterFactory {
  pub fn replying(reply: &str) -> Self {
    ScriptedChatterFactory { reply: Some(reply.to_string()) }
  }

  pub fn failing() -> Self {
    ScriptedChatterFactory { reply: None }
  }
}

impl ChatterFactory for ScriptedChatterFactory {
  fn make(&self, _config: &LLMModelConfig) -> Result<Box<dyn LLMChatter>> {
    match &self.reply {
      Some(reply) => Ok(Box::new(CannedChatter { reply: reply.clone() })),
      None => Err(anyhow!("no LLM available in this test")),
    }
  }
}

pub fn test_context() -> AgentContext {
  AgentContext {
    provider: Arc::new(MockDataProvider::new()),
    bus: ProgressBus::new(),
    chatters: Arc::new(ScriptedChatterFactory::failing()),
    options: Arc::new(RunOptions::new("gpt-4o", ModelProvider::OpenAI)),
  }
}

pub fn test_context_with_reply(reply: &str) -> AgentContext {
  AgentContext {
    provider: Arc::new(MockDataProvider::new()),
    bus: ProgressBus::new(),
    chatters: Arc::new(ScriptedChatterFactory::replying(reply)),
    options: Arc::new(RunOptions::new("gpt-4o", ModelProvider::OpenAI)),
  }
}
