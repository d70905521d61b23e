use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One daily OHLCV bar as served by the market-data API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
  pub open: f64,
  pub close: f64,
  pub high: f64,
  pub low: f64,
  pub volume: i64,
  pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceResponse {
  pub ticker: String,
  pub prices: Vec<Price>,
}

/// Snapshot of the upstream financial-metrics record. Every ratio is
/// optional; the upstream omits whatever it cannot compute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialMetrics {
  pub ticker: String,
  pub report_period: String,
  pub period: String,
  pub currency: String,
  pub market_cap: Option<f64>,
  pub enterprise_value: Option<f64>,
  pub price_to_earnings_ratio: Option<f64>,
  pub price_to_book_ratio: Option<f64>,
  pub price_to_sales_ratio: Option<f64>,
  pub enterprise_value_to_ebitda_ratio: Option<f64>,
  pub free_cash_flow_yield: Option<f64>,
  pub peg_ratio: Option<f64>,
  pub gross_margin: Option<f64>,
  pub operating_margin: Option<f64>,
  pub net_margin: Option<f64>,
  pub return_on_equity: Option<f64>,
  pub return_on_assets: Option<f64>,
  pub return_on_invested_capital: Option<f64>,
  pub current_ratio: Option<f64>,
  pub quick_ratio: Option<f64>,
  pub debt_to_equity: Option<f64>,
  pub debt_to_assets: Option<f64>,
  pub interest_coverage: Option<f64>,
  pub revenue_growth: Option<f64>,
  pub earnings_growth: Option<f64>,
  pub book_value_growth: Option<f64>,
  pub earnings_per_share_growth: Option<f64>,
  pub free_cash_flow_growth: Option<f64>,
  pub payout_ratio: Option<f64>,
  pub earnings_per_share: Option<f64>,
  pub book_value_per_share: Option<f64>,
  pub free_cash_flow_per_share: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialMetricsResponse {
  pub financial_metrics: Vec<FinancialMetrics>,
}

/// A line-item search hit. Requested items land in `extra` because the
/// upstream flattens them into the record by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
  pub ticker: String,
  pub report_period: String,
  pub period: String,
  pub currency: String,
  #[serde(flatten)]
  pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemResponse {
  pub search_results: Vec<LineItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsiderTrade {
  pub ticker: String,
  pub issuer: Option<String>,
  pub name: Option<String>,
  pub title: Option<String>,
  pub is_board_director: Option<bool>,
  pub transaction_date: Option<String>,
  pub transaction_shares: Option<f64>,
  pub transaction_price_per_share: Option<f64>,
  pub transaction_value: Option<f64>,
  pub shares_owned_before_transaction: Option<f64>,
  pub shares_owned_after_transaction: Option<f64>,
  pub security_title: Option<String>,
  pub filing_date: Option<String>,
}

impl InsiderTrade {
  /// The date an analyst should reason about: the transaction date when
  /// present, else the filing date.
  pub fn effective_date(&self) -> Option<&str> {
    self.transaction_date.as_deref().or(self.filing_date.as_deref())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsiderTradeResponse {
  pub insider_trades: Vec<InsiderTrade>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyNews {
  pub ticker: String,
  pub title: String,
  pub author: Option<String>,
  pub source: Option<String>,
  pub date: String,
  pub url: Option<String>,
  pub sentiment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyNewsResponse {
  pub news: Vec<CompanyNews>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyFacts {
  pub ticker: String,
  pub name: String,
  pub market_cap: Option<f64>,
  pub industry: Option<String>,
  pub sector: Option<String>,
  pub exchange: Option<String>,
  pub weighted_average_shares: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyFactsResponse {
  pub company_facts: CompanyFacts,
}
