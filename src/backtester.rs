use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::Serialize;
use serde_json::{json, Value};
use statrs::statistics::Statistics;
use std::collections::HashMap;
use std::sync::Arc;

use crate::ai_agent::agents::portfolio_manager::{Action, PortfolioDecision};
use crate::ai_agent::data::provider::DataProvider;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const ANNUAL_RISK_FREE_RATE: f64 = 0.0434;

/// Per-ticker ledger entry. Long and short sides are tracked separately;
/// cost bases are share-weighted averages and reset to zero with the
/// position.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Position {
  pub long_shares: i64,
  pub short_shares: i64,
  pub long_cost_basis: f64,
  pub short_cost_basis: f64,
  pub short_margin_used: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RealizedGains {
  pub long: f64,
  pub short: f64,
}

/// Margin-aware long/short portfolio ledger.
#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
  pub cash: f64,
  pub margin_requirement: f64,
  pub margin_used: f64,
  pub positions: HashMap<String, Position>,
  pub realized_gains: HashMap<String, RealizedGains>,
}

impl Portfolio {
  pub fn new(initial_cash: f64, margin_requirement: f64, tickers: &[String]) -> Self {
    let positions = tickers.iter().map(|t| (t.clone(), Position::default())).collect();
    let realized_gains = tickers.iter().map(|t| (t.clone(), RealizedGains::default())).collect();
    Portfolio { cash: initial_cash, margin_requirement, margin_used: 0.0, positions, realized_gains }
  }

  /// Snapshot in the wire shape the graph nodes read.
  pub fn to_json(&self) -> Value {
    let positions: serde_json::Map<String, Value> = self
      .positions
      .iter()
      .map(|(ticker, p)| {
        (
          ticker.clone(),
          json!({
            "long": p.long_shares,
            "short": p.short_shares,
            "long_cost_basis": p.long_cost_basis,
            "short_cost_basis": p.short_cost_basis,
            "short_margin_used": p.short_margin_used,
          }),
        )
      })
      .collect();
    let realized: serde_json::Map<String, Value> = self
      .realized_gains
      .iter()
      .map(|(ticker, g)| (ticker.clone(), json!({"long": g.long, "short": g.short})))
      .collect();
    json!({
      "cash": self.cash,
      "margin_requirement": self.margin_requirement,
      "margin_used": self.margin_used,
      "positions": Value::Object(positions),
      "realized_gains": Value::Object(realized),
    })
  }

  /// Net liquidation value: cash plus longs minus shorts at market. This is
  /// the authoritative portfolio value; exposure metrics derive from the
  /// positions alone.
  pub fn net_liquidation_value(&self, prices: &HashMap<String, f64>) -> f64 {
    let mut total = self.cash;
    for (ticker, position) in &self.positions {
      if let Some(price) = prices.get(ticker) {
        total += position.long_shares as f64 * price;
        total -= position.short_shares as f64 * price;
      }
    }
    total
  }

  /// Execute one decision at the given price. Quantities are floored to
  /// non-negative integers; trades that cannot be fully funded execute for
  /// the largest affordable quantity. Returns the executed share count.
  pub fn execute_trade(&mut self, ticker: &str, action: Action, quantity: i64, price: f64) -> i64 {
    if quantity <= 0 || price <= 0.0 {
      return 0;
    }
    let position = self.positions.entry(ticker.to_string()).or_default();

    match action {
      Action::Hold => 0,

      Action::Buy => {
        let affordable = (self.cash / price) as i64;
        let executed = quantity.min(affordable);
        if executed <= 0 {
          return 0;
        }
        let cost = executed as f64 * price;
        let total_shares = position.long_shares + executed;
        position.long_cost_basis =
          (position.long_cost_basis * position.long_shares as f64 + cost) / total_shares as f64;
        position.long_shares = total_shares;
        self.cash -= cost;
        executed
      }

      Action::Sell => {
        let executed = quantity.min(position.long_shares);
        if executed <= 0 {
          return 0;
        }
        let realized = (price - position.long_cost_basis) * executed as f64;
        self.realized_gains.entry(ticker.to_string()).or_default().long += realized;
        position.long_shares -= executed;
        self.cash += executed as f64 * price;
        if position.long_shares == 0 {
          position.long_cost_basis = 0.0;
        }
        executed
      }

      Action::Short => {
        let executed = if self.margin_requirement > 0.0 {
          let affordable = (self.cash / (price * self.margin_requirement)) as i64;
          quantity.min(affordable)
        } else {
          quantity
        };
        if executed <= 0 {
          return 0;
        }
        let proceeds = price * executed as f64;
        let margin_required = proceeds * self.margin_requirement;
        let total_shares = position.short_shares + executed;
        position.short_cost_basis =
          (position.short_cost_basis * position.short_shares as f64 + proceeds)
            / total_shares as f64;
        position.short_shares = total_shares;
        position.short_margin_used += margin_required;
        self.margin_used += margin_required;
        self.cash += proceeds;
        self.cash -= margin_required;
        executed
      }

      Action::Cover => {
        let executed = quantity.min(position.short_shares);
        if executed <= 0 {
          return 0;
        }
        let cover_cost = executed as f64 * price;
        let realized = (position.short_cost_basis - price) * executed as f64;
        let portion = executed as f64 / position.short_shares as f64;
        let margin_released = portion * position.short_margin_used;

        position.short_shares -= executed;
        position.short_margin_used -= margin_released;
        self.margin_used -= margin_released;
        self.cash += margin_released;
        self.cash -= cover_cost;
        self.realized_gains.entry(ticker.to_string()).or_default().short += realized;

        if position.short_shares == 0 {
          self.margin_used -= position.short_margin_used;
          position.short_cost_basis = 0.0;
          position.short_margin_used = 0.0;
        }
        executed
      }
    }
  }
}

/// One row of the performance series.
#[derive(Debug, Clone, Serialize)]
pub struct DailySnapshot {
  pub date: NaiveDate,
  pub portfolio_value: f64,
  pub long_exposure: f64,
  pub short_exposure: f64,
  pub gross_exposure: f64,
  pub net_exposure: f64,
  pub long_short_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
  pub sharpe_ratio: Option<f64>,
  pub sortino_ratio: Option<f64>,
  pub max_drawdown: Option<f64>,
  pub max_drawdown_date: Option<String>,
}

pub struct BacktestOutput {
  pub decisions: HashMap<String, PortfolioDecision>,
  pub analyst_signals: Value,
}

/// The decision engine the backtester replays: one DAG run per trading day.
#[async_trait]
pub trait BacktestAgent: Send + Sync {
  async fn run(
    &self,
    tickers: &[String],
    start_date: &str,
    end_date: &str,
    portfolio: &Portfolio,
  ) -> Result<BacktestOutput>;
}

pub struct Backtester {
  agent: Arc<dyn BacktestAgent>,
  provider: Arc<dyn DataProvider>,
  tickers: Vec<String>,
  start_date: String,
  end_date: String,
  initial_capital: f64,
  pub portfolio: Portfolio,
  pub portfolio_values: Vec<DailySnapshot>,
}

impl Backtester {
  pub fn new(
    agent: Arc<dyn BacktestAgent>,
    provider: Arc<dyn DataProvider>,
    tickers: Vec<String>,
    start_date: &str,
    end_date: &str,
    initial_capital: f64,
    margin_requirement: f64,
  ) -> Self {
    let portfolio = Portfolio::new(initial_capital, margin_requirement, &tickers);
    Backtester {
      agent,
      provider,
      tickers,
      start_date: start_date.to_string(),
      end_date: end_date.to_string(),
      initial_capital,
      portfolio,
      portfolio_values: Vec::new(),
    }
  }

  /// Replay every business day in range: price the book, run the DAG with a
  /// 30-day lookback, apply the decisions, append the day's snapshot. Days
  /// with missing prices are skipped whole.
  pub async fn run_backtest(&mut self) -> Result<PerformanceMetrics> {
    let start = NaiveDate::parse_from_str(&self.start_date, "%Y-%m-%d")?;
    let end = NaiveDate::parse_from_str(&self.end_date, "%Y-%m-%d")?;
    if end < start {
      return Err(anyhow!("Backtest end date precedes start date"));
    }

    let mut metrics = PerformanceMetrics::default();
    let mut day = start;

    while day <= end {
      if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
        day += Duration::days(1);
        continue;
      }

      let day_str = day.format("%Y-%m-%d").to_string();
      let previous_str = (day - Duration::days(1)).format("%Y-%m-%d").to_string();
      let lookback_start = (day - Duration::days(30)).format("%Y-%m-%d").to_string();

      let current_prices = match self.fetch_day_prices(&previous_str, &day_str).await {
        Some(prices) => prices,
        None => {
          log::warn!("Skipping trading day {} due to missing price data", day_str);
          day += Duration::days(1);
          continue;
        }
      };

      let output = self
        .agent
        .run(&self.tickers, &lookback_start, &day_str, &self.portfolio)
        .await?;

      let tickers = self.tickers.clone();
      for ticker in &tickers {
        let decision = output.decisions.get(ticker);
        let action = decision.map(|d| d.action).unwrap_or(Action::Hold);
        let quantity = decision.map(|d| d.quantity).unwrap_or(0);
        let price = current_prices[ticker];
        self.portfolio.execute_trade(ticker, action, quantity, price);
      }

      self.portfolio_values.push(self.snapshot(day, &current_prices));

      if self.portfolio_values.len() >= 4 {
        update_performance_metrics(&self.portfolio_values, &mut metrics);
      }

      day += Duration::days(1);
    }

    Ok(metrics)
  }

  async fn fetch_day_prices(
    &self,
    previous_str: &str,
    day_str: &str,
  ) -> Option<HashMap<String, f64>> {
    let mut prices = HashMap::new();
    for ticker in &self.tickers {
      let bars = self.provider.get_prices(ticker, previous_str, day_str).await.ok()?;
      let close = bars.last().map(|bar| bar.close)?;
      prices.insert(ticker.clone(), close);
    }
    Some(prices)
  }

  fn snapshot(&self, date: NaiveDate, prices: &HashMap<String, f64>) -> DailySnapshot {
    let mut long_exposure = 0.0;
    let mut short_exposure = 0.0;
    for (ticker, position) in &self.portfolio.positions {
      if let Some(price) = prices.get(ticker) {
        long_exposure += position.long_shares as f64 * price;
        short_exposure += position.short_shares as f64 * price;
      }
    }
    DailySnapshot {
      date,
      portfolio_value: self.portfolio.net_liquidation_value(prices),
      long_exposure,
      short_exposure,
      gross_exposure: long_exposure + short_exposure,
      net_exposure: long_exposure - short_exposure,
      long_short_ratio: if short_exposure > 1e-9 {
        long_exposure / short_exposure
      } else {
        f64::INFINITY
      },
    }
  }

  pub fn total_return_pct(&self) -> Option<f64> {
    self
      .portfolio_values
      .last()
      .map(|last| (last.portfolio_value / self.initial_capital - 1.0) * 100.0)
  }
}

/// Recompute Sharpe, Sortino, and max drawdown over the value series.
pub fn update_performance_metrics(values: &[DailySnapshot], metrics: &mut PerformanceMetrics) {
  let series: Vec<f64> = values.iter().map(|v| v.portfolio_value).collect();
  let returns: Vec<f64> = series
    .windows(2)
    .filter(|w| w[0].abs() > 1e-12)
    .map(|w| w[1] / w[0] - 1.0)
    .collect();
  if returns.len() < 2 {
    return;
  }

  let daily_risk_free = ANNUAL_RISK_FREE_RATE / TRADING_DAYS_PER_YEAR;
  let excess: Vec<f64> = returns.iter().map(|r| r - daily_risk_free).collect();
  let mean_excess = excess.iter().cloned().mean();
  let std_excess = excess.iter().cloned().std_dev();

  metrics.sharpe_ratio = Some(if std_excess > 1e-12 {
    TRADING_DAYS_PER_YEAR.sqrt() * mean_excess / std_excess
  } else {
    0.0
  });

  let negative: Vec<f64> = excess.iter().cloned().filter(|r| *r < 0.0).collect();
  metrics.sortino_ratio = Some(if negative.len() >= 2 {
    let downside_std = negative.iter().cloned().std_dev();
    if downside_std > 1e-12 {
      TRADING_DAYS_PER_YEAR.sqrt() * mean_excess / downside_std
    } else if mean_excess > 0.0 {
      f64::INFINITY
    } else {
      0.0
    }
  } else if mean_excess > 0.0 {
    f64::INFINITY
  } else {
    0.0
  });

  let mut running_max = f64::MIN;
  let mut min_drawdown = 0.0;
  let mut trough_date: Option<NaiveDate> = None;
  for snapshot in values {
    running_max = running_max.max(snapshot.portfolio_value);
    if running_max > 1e-12 {
      let drawdown = (snapshot.portfolio_value - running_max) / running_max;
      if drawdown < min_drawdown {
        min_drawdown = drawdown;
        trough_date = Some(snapshot.date);
      }
    }
  }
  metrics.max_drawdown = Some(min_drawdown * 100.0);
  metrics.max_drawdown_date = trough_date.map(|d| d.format("%Y-%m-%d").to_string());
}
