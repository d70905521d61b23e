use std::collections::HashMap;
use std::sync::Mutex;

use crate::ai_agent::data::models::{CompanyNews, FinancialMetrics, InsiderTrade, Price};

/// In-process market-data cache keyed by ticker.
///
/// The cache is an owned component of the data provider rather than a
/// process global, so each provider (and each test) starts empty. Writers
/// take the table lock for their section; merges never overwrite an
/// existing record with the same key date.
pub struct Cache {
  prices: Mutex<HashMap<String, Vec<Price>>>,
  financial_metrics: Mutex<HashMap<String, Vec<FinancialMetrics>>>,
  insider_trades: Mutex<HashMap<String, Vec<InsiderTrade>>>,
  company_news: Mutex<HashMap<String, Vec<CompanyNews>>>,
}

impl Cache {
  pub fn new() -> Self {
    Cache {
      prices: Mutex::new(HashMap::new()),
      financial_metrics: Mutex::new(HashMap::new()),
      insider_trades: Mutex::new(HashMap::new()),
      company_news: Mutex::new(HashMap::new()),
    }
  }

  pub fn get_prices(&self, ticker: &str) -> Vec<Price> {
    let table = self.prices.lock().unwrap_or_else(|p| p.into_inner());
    table.get(ticker).cloned().unwrap_or_default()
  }

  pub fn set_prices(&self, ticker: &str, data: Vec<Price>) {
    let mut table = self.prices.lock().unwrap_or_else(|p| p.into_inner());
    let existing = table.entry(ticker.to_string()).or_default();
    merge_by_key(existing, data, |p| p.time.clone());
  }

  pub fn get_financial_metrics(&self, ticker: &str) -> Vec<FinancialMetrics> {
    let table = self.financial_metrics.lock().unwrap_or_else(|p| p.into_inner());
    table.get(ticker).cloned().unwrap_or_default()
  }

  pub fn set_financial_metrics(&self, ticker: &str, data: Vec<FinancialMetrics>) {
    let mut table = self.financial_metrics.lock().unwrap_or_else(|p| p.into_inner());
    let existing = table.entry(ticker.to_string()).or_default();
    merge_by_key(existing, data, |m| m.report_period.clone());
  }

  pub fn get_insider_trades(&self, ticker: &str) -> Vec<InsiderTrade> {
    let table = self.insider_trades.lock().unwrap_or_else(|p| p.into_inner());
    table.get(ticker).cloned().unwrap_or_default()
  }

  pub fn set_insider_trades(&self, ticker: &str, data: Vec<InsiderTrade>) {
    let mut table = self.insider_trades.lock().unwrap_or_else(|p| p.into_inner());
    let existing = table.entry(ticker.to_string()).or_default();
    merge_by_key(existing, data, |t| {
      format!("{}:{}", t.filing_date.clone().unwrap_or_default(), t.name.clone().unwrap_or_default())
    });
  }

  pub fn get_company_news(&self, ticker: &str) -> Vec<CompanyNews> {
    let table = self.company_news.lock().unwrap_or_else(|p| p.into_inner());
    table.get(ticker).cloned().unwrap_or_default()
  }

  pub fn set_company_news(&self, ticker: &str, data: Vec<CompanyNews>) {
    let mut table = self.company_news.lock().unwrap_or_else(|p| p.into_inner());
    let existing = table.entry(ticker.to_string()).or_default();
    merge_by_key(existing, data, |n| format!("{}:{}", n.date, n.title));
  }
}

impl Default for Cache {
  fn default() -> Self {
    Cache::new()
  }
}

fn merge_by_key<T, F>(existing: &mut Vec<T>, new_data: Vec<T>, key_of: F)
where
  F: Fn(&T) -> String,
{
  let known: std::collections::HashSet<String> = existing.iter().map(&key_of).collect();
  for item in new_data {
    if !known.contains(&key_of(&item)) {
      existing.push(item);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn price(time: &str, close: f64) -> Price {
    Price { open: close, close, high: close, low: close, volume: 1000, time: time.to_string() }
  }

  #[test]
  fn merges_without_duplicating_same_day_bars() {
    let cache = Cache::new();
    cache.set_prices("AAPL", vec![price("2024-01-02", 185.0), price("2024-01-03", 186.0)]);
    cache.set_prices("AAPL", vec![price("2024-01-03", 999.0), price("2024-01-04", 187.0)]);

    let cached = cache.get_prices("AAPL");
    assert_eq!(cached.len(), 3);
    // The first write for 2024-01-03 wins; a refetch never clobbers it.
    let jan3 = cached.iter().find(|p| p.time == "2024-01-03").unwrap();
    assert_eq!(jan3.close, 186.0);
  }

  #[test]
  fn tickers_are_isolated() {
    let cache = Cache::new();
    cache.set_prices("AAPL", vec![price("2024-01-02", 185.0)]);
    assert!(cache.get_prices("MSFT").is_empty());
    assert_eq!(cache.get_prices("AAPL").len(), 1);
  }
}
