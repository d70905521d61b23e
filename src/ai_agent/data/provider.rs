use anyhow::{anyhow, Result};
use async_trait::async_trait;
use polars::prelude::{DataFrame, NamedFrom, Series, SortMultipleOptions};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

use crate::ai_agent::data::cache::Cache;
use crate::ai_agent::data::models::{
  CompanyNews, CompanyNewsResponse, FinancialMetrics, FinancialMetricsResponse, InsiderTrade,
  InsiderTradeResponse, LineItem, LineItemResponse, Price, PriceResponse,
};

/// How long to back off when the upstream rate-limits us. Fixed by the
/// upstream's documented window, not configurable.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

pub struct HttpReply {
  pub status: u16,
  pub body: String,
}

/// Raw HTTP seam under the provider, so tests can script status codes.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn get(&self, url: &str) -> Result<HttpReply>;
  async fn post(&self, url: &str, body: serde_json::Value) -> Result<HttpReply>;
}

pub struct ReqwestTransport {
  client: reqwest::Client,
  api_key: String,
}

impl ReqwestTransport {
  pub fn new(api_key: String) -> Self {
    ReqwestTransport { client: reqwest::Client::new(), api_key }
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn get(&self, url: &str) -> Result<HttpReply> {
    let response = self.client.get(url).header("X-API-KEY", &self.api_key).send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok(HttpReply { status, body })
  }

  async fn post(&self, url: &str, body: serde_json::Value) -> Result<HttpReply> {
    let response = self
      .client
      .post(url)
      .header("X-API-KEY", &self.api_key)
      .json(&body)
      .send()
      .await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok(HttpReply { status, body })
  }
}

/// Uniform market-data access for the analyst agents.
#[async_trait]
pub trait DataProvider: Send + Sync {
  async fn get_prices(&self, ticker: &str, start_date: &str, end_date: &str) -> Result<Vec<Price>>;

  async fn get_financial_metrics(
    &self,
    ticker: &str,
    end_date: &str,
    period: &str,
    limit: usize,
  ) -> Result<Vec<FinancialMetrics>>;

  async fn search_line_items(
    &self,
    ticker: &str,
    line_items: &[String],
    end_date: &str,
    period: &str,
    limit: usize,
  ) -> Result<Vec<LineItem>>;

  async fn get_insider_trades(
    &self,
    ticker: &str,
    end_date: &str,
    start_date: Option<&str>,
    limit: usize,
  ) -> Result<Vec<InsiderTrade>>;

  async fn get_company_news(
    &self,
    ticker: &str,
    end_date: &str,
    start_date: Option<&str>,
    limit: usize,
  ) -> Result<Vec<CompanyNews>>;

  async fn get_market_cap(&self, ticker: &str, end_date: &str) -> Result<Option<f64>>;
}

/// FinancialDatasets.ai-backed provider with an owned per-ticker cache.
pub struct FinancialDatasetsProvider {
  base_url: String,
  transport: Box<dyn Transport>,
  cache: Cache,
}

impl FinancialDatasetsProvider {
  pub fn new(api_key: String) -> Self {
    FinancialDatasetsProvider {
      base_url: "https://api.financialdatasets.ai".to_string(),
      transport: Box::new(ReqwestTransport::new(api_key)),
      cache: Cache::new(),
    }
  }

  pub fn with_transport(base_url: &str, transport: Box<dyn Transport>) -> Self {
    FinancialDatasetsProvider { base_url: base_url.to_string(), transport, cache: Cache::new() }
  }

  /// GET with the fixed 60-second sleep-and-retry on 429. Any other
  /// non-success status fails fast.
  async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
    loop {
      let reply = self.transport.get(url).await?;
      if reply.status == 429 {
        log::warn!("Rate limited by upstream, sleeping {}s before retry", RATE_LIMIT_BACKOFF.as_secs());
        tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
        continue;
      }
      if !(200..300).contains(&reply.status) {
        return Err(anyhow!("API request failed: {} - {}", reply.status, reply.body));
      }
      return Ok(serde_json::from_str(&reply.body)?);
    }
  }

  async fn post_json<T: DeserializeOwned>(&self, url: &str, body: serde_json::Value) -> Result<T> {
    loop {
      let reply = self.transport.post(url, body.clone()).await?;
      if reply.status == 429 {
        log::warn!("Rate limited by upstream, sleeping {}s before retry", RATE_LIMIT_BACKOFF.as_secs());
        tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
        continue;
      }
      if !(200..300).contains(&reply.status) {
        return Err(anyhow!("API request failed: {} - {}", reply.status, reply.body));
      }
      return Ok(serde_json::from_str(&reply.body)?);
    }
  }
}

#[async_trait]
impl DataProvider for FinancialDatasetsProvider {
  async fn get_prices(&self, ticker: &str, start_date: &str, end_date: &str) -> Result<Vec<Price>> {
    let cached = self.cache.get_prices(ticker);
    if !cached.is_empty() {
      let mut in_range: Vec<Price> = cached
        .into_iter()
        .filter(|p| p.time.as_str() >= start_date && p.time.as_str() <= end_date)
        .collect();
      if !in_range.is_empty() {
        in_range.sort_by(|a, b| a.time.cmp(&b.time));
        log::debug!("Returning {} cached price bars for {}", in_range.len(), ticker);
        return Ok(in_range);
      }
    }

    let url = format!(
      "{}/prices/?ticker={}&interval=day&interval_multiplier=1&start_date={}&end_date={}",
      self.base_url, ticker, start_date, end_date
    );
    let response: PriceResponse = self.fetch_json(&url).await?;

    if !response.prices.is_empty() {
      self.cache.set_prices(ticker, response.prices.clone());
    }
    Ok(response.prices)
  }

  async fn get_financial_metrics(
    &self,
    ticker: &str,
    end_date: &str,
    period: &str,
    limit: usize,
  ) -> Result<Vec<FinancialMetrics>> {
    let cached = self.cache.get_financial_metrics(ticker);
    if !cached.is_empty() {
      let mut in_range: Vec<FinancialMetrics> =
        cached.into_iter().filter(|m| m.report_period.as_str() <= end_date).collect();
      if !in_range.is_empty() {
        in_range.sort_by(|a, b| b.report_period.cmp(&a.report_period));
        in_range.truncate(limit);
        return Ok(in_range);
      }
    }

    let url = format!(
      "{}/financial-metrics/?ticker={}&report_period_lte={}&limit={}&period={}",
      self.base_url, ticker, end_date, limit, period
    );
    let response: FinancialMetricsResponse = self.fetch_json(&url).await?;

    if !response.financial_metrics.is_empty() {
      self.cache.set_financial_metrics(ticker, response.financial_metrics.clone());
    }
    Ok(response.financial_metrics)
  }

  async fn search_line_items(
    &self,
    ticker: &str,
    line_items: &[String],
    end_date: &str,
    period: &str,
    limit: usize,
  ) -> Result<Vec<LineItem>> {
    let url = format!("{}/financials/search/line-items", self.base_url);
    let body = json!({
      "tickers": [ticker],
      "line_items": line_items,
      "end_date": end_date,
      "period": period,
      "limit": limit,
    });
    let response: LineItemResponse = self.post_json(&url, body).await?;
    let mut results = response.search_results;
    results.truncate(limit);
    Ok(results)
  }

  async fn get_insider_trades(
    &self,
    ticker: &str,
    end_date: &str,
    start_date: Option<&str>,
    limit: usize,
  ) -> Result<Vec<InsiderTrade>> {
    let cached = self.cache.get_insider_trades(ticker);
    if !cached.is_empty() {
      let mut in_range: Vec<InsiderTrade> = cached
        .into_iter()
        .filter(|t| {
          let date = t.effective_date().unwrap_or_default();
          let after_start = start_date.map_or(true, |s| date >= s);
          after_start && date <= end_date
        })
        .collect();
      if !in_range.is_empty() {
        in_range.sort_by(|a, b| {
          let a_date = a.effective_date().unwrap_or_default();
          let b_date = b.effective_date().unwrap_or_default();
          b_date.cmp(&a_date)
        });
        return Ok(in_range);
      }
    }

    // Paginate backward by moving the upper filing-date bound to the oldest
    // record of the previous page.
    let mut all_trades: Vec<InsiderTrade> = Vec::new();
    let mut current_end_date = end_date.to_string();

    loop {
      let mut url = format!(
        "{}/insider-trades/?ticker={}&filing_date_lte={}",
        self.base_url, ticker, current_end_date
      );
      if let Some(start) = start_date {
        url.push_str(&format!("&filing_date_gte={}", start));
      }
      url.push_str(&format!("&limit={}", limit));

      let response: InsiderTradeResponse = self.fetch_json(&url).await?;
      let batch = response.insider_trades;
      if batch.is_empty() {
        break;
      }

      let batch_len = batch.len();
      let oldest_filing = batch
        .iter()
        .filter_map(|t| t.filing_date.as_deref())
        .min()
        .map(|d| d.split('T').next().unwrap_or(d).to_string());
      all_trades.extend(batch);

      if start_date.is_none() || batch_len < limit {
        break;
      }
      match (oldest_filing, start_date) {
        (Some(oldest), Some(start)) => {
          if oldest.as_str() <= start {
            break;
          }
          current_end_date = oldest;
        }
        _ => break,
      }
    }

    if !all_trades.is_empty() {
      self.cache.set_insider_trades(ticker, all_trades.clone());
    }
    Ok(all_trades)
  }

  async fn get_company_news(
    &self,
    ticker: &str,
    end_date: &str,
    start_date: Option<&str>,
    limit: usize,
  ) -> Result<Vec<CompanyNews>> {
    let cached = self.cache.get_company_news(ticker);
    if !cached.is_empty() {
      let mut in_range: Vec<CompanyNews> = cached
        .into_iter()
        .filter(|n| {
          let after_start = start_date.map_or(true, |s| n.date.as_str() >= s);
          after_start && n.date.as_str() <= end_date
        })
        .collect();
      if !in_range.is_empty() {
        in_range.sort_by(|a, b| b.date.cmp(&a.date));
        return Ok(in_range);
      }
    }

    let mut all_news: Vec<CompanyNews> = Vec::new();
    let mut current_end_date = end_date.to_string();

    loop {
      let mut url =
        format!("{}/news/?ticker={}&end_date={}", self.base_url, ticker, current_end_date);
      if let Some(start) = start_date {
        url.push_str(&format!("&start_date={}", start));
      }
      url.push_str(&format!("&limit={}", limit));

      let response: CompanyNewsResponse = self.fetch_json(&url).await?;
      let batch = response.news;
      if batch.is_empty() {
        break;
      }

      let batch_len = batch.len();
      let oldest_date = batch
        .iter()
        .map(|n| n.date.as_str())
        .min()
        .map(|d| d.split('T').next().unwrap_or(d).to_string());
      all_news.extend(batch);

      if start_date.is_none() || batch_len < limit {
        break;
      }
      match (oldest_date, start_date) {
        (Some(oldest), Some(start)) => {
          if oldest.as_str() <= start {
            break;
          }
          current_end_date = oldest;
        }
        _ => break,
      }
    }

    if !all_news.is_empty() {
      self.cache.set_company_news(ticker, all_news.clone());
    }
    Ok(all_news)
  }

  async fn get_market_cap(&self, ticker: &str, end_date: &str) -> Result<Option<f64>> {
    let metrics = self.get_financial_metrics(ticker, end_date, "ttm", 1).await?;
    Ok(metrics.first().and_then(|m| m.market_cap))
  }
}

/// Convert price bars into a polars frame sorted by time, the shape the
/// technical and risk agents consume.
pub fn prices_to_df(prices: &[Price]) -> Result<DataFrame> {
  let opens: Vec<f64> = prices.iter().map(|p| p.open).collect();
  let closes: Vec<f64> = prices.iter().map(|p| p.close).collect();
  let highs: Vec<f64> = prices.iter().map(|p| p.high).collect();
  let lows: Vec<f64> = prices.iter().map(|p| p.low).collect();
  let volumes: Vec<i64> = prices.iter().map(|p| p.volume).collect();
  let times: Vec<String> = prices.iter().map(|p| p.time.clone()).collect();

  let df = DataFrame::new(vec![
    Series::new("open", &opens),
    Series::new("close", &closes),
    Series::new("high", &highs),
    Series::new("low", &lows),
    Series::new("volume", &volumes),
    Series::new("time", &times),
  ])?;

  let df = df.sort(&["time"], SortMultipleOptions::default())?;
  Ok(df)
}

/// Last close of the frame, if any.
pub fn latest_close(df: &DataFrame) -> Option<f64> {
  let close = df.column("close").ok()?.f64().ok()?;
  if close.is_empty() {
    return None;
  }
  close.get(close.len() - 1)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Scripted transport: pops one reply per request, records URLs.
  struct ScriptedTransport {
    replies: Mutex<Vec<HttpReply>>,
    requests: Mutex<Vec<String>>,
    calls: AtomicUsize,
  }

  impl ScriptedTransport {
    fn shared(replies: Vec<HttpReply>) -> std::sync::Arc<ScriptedTransport> {
      std::sync::Arc::new(ScriptedTransport {
        replies: Mutex::new(replies),
        requests: Mutex::new(Vec::new()),
        calls: AtomicUsize::new(0),
      })
    }
  }

  #[async_trait]
  impl Transport for std::sync::Arc<ScriptedTransport> {
    async fn get(&self, url: &str) -> Result<HttpReply> {
      self.requests.lock().unwrap().push(url.to_string());
      self.calls.fetch_add(1, Ordering::SeqCst);
      let mut replies = self.replies.lock().unwrap();
      if replies.is_empty() {
        return Err(anyhow!("scripted transport exhausted"));
      }
      Ok(replies.remove(0))
    }

    async fn post(&self, url: &str, _body: serde_json::Value) -> Result<HttpReply> {
      self.get(url).await
    }
  }

  fn price_body(times: &[(&str, f64)]) -> String {
    let prices: Vec<serde_json::Value> = times
      .iter()
      .map(|(t, c)| {
        json!({"open": c, "close": c, "high": c, "low": c, "volume": 100, "time": t})
      })
      .collect();
    json!({"ticker": "AAPL", "prices": prices}).to_string()
  }

  #[tokio::test(start_paused = true)]
  async fn sleeps_exactly_sixty_seconds_on_429_then_succeeds() {
    let transport = ScriptedTransport::shared(vec![
      HttpReply { status: 429, body: String::new() },
      HttpReply { status: 200, body: price_body(&[("2024-01-02", 185.0)]) },
    ]);
    let provider = FinancialDatasetsProvider::with_transport("http://test", Box::new(transport.clone()));

    let started = tokio::time::Instant::now();
    let prices = provider.get_prices("AAPL", "2024-01-01", "2024-01-31").await.unwrap();

    assert_eq!(prices.len(), 1);
    assert_eq!(started.elapsed(), Duration::from_secs(60));
  }

  #[tokio::test]
  async fn fails_fast_on_other_client_errors() {
    let transport = ScriptedTransport::shared(vec![HttpReply { status: 403, body: "denied".into() }]);
    let provider = FinancialDatasetsProvider::with_transport("http://test", Box::new(transport.clone()));

    let err = provider.get_prices("AAPL", "2024-01-01", "2024-01-31").await.unwrap_err();
    assert!(err.to_string().contains("403"));
  }

  #[tokio::test]
  async fn serves_range_queries_from_cache_after_first_fetch() {
    let transport = ScriptedTransport::shared(vec![HttpReply {
      status: 200,
      body: price_body(&[("2024-01-02", 185.0), ("2024-01-03", 186.0), ("2024-01-04", 187.0)]),
    }]);
    let provider = FinancialDatasetsProvider::with_transport("http://test", Box::new(transport.clone()));

    let first = provider.get_prices("AAPL", "2024-01-01", "2024-01-31").await.unwrap();
    assert_eq!(first.len(), 3);

    // Narrower range is answered from cache; the transport is exhausted so a
    // second network hit would error.
    let second = provider.get_prices("AAPL", "2024-01-03", "2024-01-04").await.unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].time, "2024-01-03");
  }

  fn trade_body(entries: &[(&str, f64)]) -> String {
    let trades: Vec<serde_json::Value> = entries
      .iter()
      .map(|(date, shares)| {
        json!({
          "ticker": "AAPL",
          "name": format!("insider-{}", date),
          "filing_date": date,
          "transaction_shares": shares,
        })
      })
      .collect();
    json!({"insider_trades": trades}).to_string()
  }

  #[tokio::test]
  async fn paginates_backward_until_start_date_crossed() {
    // Two full pages (limit 2), second page crosses the start date.
    let transport = ScriptedTransport::shared(vec![
      HttpReply { status: 200, body: trade_body(&[("2024-03-01", -100.0), ("2024-02-20", 50.0)]) },
      HttpReply { status: 200, body: trade_body(&[("2024-01-15", 10.0), ("2023-12-20", 5.0)]) },
    ]);
    let provider = FinancialDatasetsProvider::with_transport("http://test", Box::new(transport.clone()));

    let trades =
      provider.get_insider_trades("AAPL", "2024-03-10", Some("2024-01-01"), 2).await.unwrap();
    assert_eq!(trades.len(), 4);

    // The second request must have moved the upper bound to the oldest
    // filing date of the first page.
    let requests = transport.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].contains("filing_date_lte=2024-03-10"));
    assert!(requests[1].contains("filing_date_lte=2024-02-20"));
  }

  #[tokio::test]
  async fn short_page_stops_pagination() {
    let transport = ScriptedTransport::shared(vec![HttpReply {
      status: 200,
      body: trade_body(&[("2024-02-20", 50.0)]),
    }]);
    let provider = FinancialDatasetsProvider::with_transport("http://test", Box::new(transport.clone()));

    let trades =
      provider.get_insider_trades("AAPL", "2024-03-10", Some("2024-01-01"), 10).await.unwrap();
    assert_eq!(trades.len(), 1);
  }

  #[tokio::test]
  async fn market_cap_comes_from_latest_metrics() {
    let body = json!({
      "financial_metrics": [{
        "ticker": "AAPL",
        "report_period": "2024-03-31",
        "period": "ttm",
        "currency": "USD",
        "market_cap": 2.9e12,
      }]
    })
    .to_string();
    let transport = ScriptedTransport::shared(vec![HttpReply { status: 200, body }]);
    let provider = FinancialDatasetsProvider::with_transport("http://test", Box::new(transport.clone()));

    let cap = provider.get_market_cap("AAPL", "2024-04-01").await.unwrap();
    assert_eq!(cap, Some(2.9e12));
  }

  #[test]
  fn prices_to_df_sorts_by_time() {
    let prices = vec![
      Price { open: 2.0, close: 2.0, high: 2.0, low: 2.0, volume: 10, time: "2024-01-03".into() },
      Price { open: 1.0, close: 1.0, high: 1.0, low: 1.0, volume: 10, time: "2024-01-02".into() },
    ];
    let df = prices_to_df(&prices).unwrap();
    assert_eq!(latest_close(&df), Some(2.0));
  }
}
