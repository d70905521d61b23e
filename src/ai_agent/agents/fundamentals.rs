use anyhow::Error;
use serde_json::{json, Value};

use crate::ai_agent::agents::{combine_votes, Signal};
use crate::ai_agent::data::models::FinancialMetrics;
use crate::ai_agent::graph::context::AgentContext;
use crate::ai_agent::graph::graph::AgentFuture;
use crate::ai_agent::graph::state::{show_agent_reasoning, AgentState, StateDelta};

pub const SIGNAL_KEY: &str = "fundamentals_agent";

/// Scores the latest financial metrics along four axes: profitability,
/// growth, financial health, and valuation ratios.
pub struct FundamentalsAgent;

impl FundamentalsAgent {
  pub fn new() -> Self {
    FundamentalsAgent {}
  }

  pub fn static_fundamentals_agent(state: AgentState, ctx: AgentContext) -> AgentFuture {
    Box::pin(async move { FundamentalsAgent::new().run(state, ctx).await })
  }

  pub async fn run(&self, state: AgentState, ctx: AgentContext) -> Result<StateDelta, Error> {
    let tickers = state.tickers();
    let end_date = state.string_field("end_date").unwrap_or_default();

    let mut analysis: serde_json::Map<String, Value> = serde_json::Map::new();

    for ticker in &tickers {
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Fetching financial metrics");
      let metrics = ctx.provider.get_financial_metrics(ticker, &end_date, "ttm", 10).await?;

      let latest = match metrics.first() {
        Some(m) => m,
        None => {
          ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Failed: No financial metrics found");
          continue;
        }
      };

      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Analyzing profitability");
      let profitability = profitability_signal(latest);
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Analyzing growth");
      let growth = growth_signal(latest);
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Analyzing financial health");
      let health = health_signal(latest);
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Analyzing valuation ratios");
      let ratios = price_ratios_signal(latest);

      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Calculating final signal");
      let axes = [profitability, growth, health, ratios];
      let bullish = axes.iter().filter(|s| s.0 == Signal::Bullish).count() as f64;
      let bearish = axes.iter().filter(|s| s.0 == Signal::Bearish).count() as f64;
      let (overall, confidence) = combine_votes(bullish, bearish, axes.len() as f64);

      let reasoning = json!({
        "profitability_signal": {"signal": axes[0].0, "details": axes[0].1},
        "growth_signal": {"signal": axes[1].0, "details": axes[1].1},
        "financial_health_signal": {"signal": axes[2].0, "details": axes[2].1},
        "price_ratios_signal": {"signal": axes[3].0, "details": axes[3].1},
      });

      analysis.insert(
        ticker.clone(),
        json!({"signal": overall, "confidence": confidence, "reasoning": reasoning}),
      );
      ctx.bus.update_with_analysis(SIGNAL_KEY, Some(ticker.as_str()), "Done", &reasoning.to_string());
    }

    let analysis = Value::Object(analysis);
    if ctx.options.show_reasoning {
      show_agent_reasoning(&analysis.to_string(), "Fundamental Analysis Agent");
    }
    ctx.bus.update_status(SIGNAL_KEY, None, "Done");

    Ok(StateDelta::for_agent_signals(SIGNAL_KEY, analysis))
  }
}

fn fmt_ratio(label: &str, value: Option<f64>) -> String {
  match value {
    Some(v) => format!("{}: {:.2}", label, v),
    None => format!("{}: N/A", label),
  }
}

fn profitability_signal(m: &FinancialMetrics) -> (Signal, String) {
  let checks = [
    (m.return_on_equity, 0.15),
    (m.net_margin, 0.20),
    (m.operating_margin, 0.15),
  ];
  let score = checks.iter().filter(|(v, t)| v.map_or(false, |v| v > *t)).count();
  let signal = if score >= 2 { Signal::Bullish } else if score == 0 { Signal::Bearish } else { Signal::Neutral };
  let details = format!(
    "{}, {}, {}",
    fmt_ratio("ROE", m.return_on_equity),
    fmt_ratio("Net Margin", m.net_margin),
    fmt_ratio("Op Margin", m.operating_margin)
  );
  (signal, details)
}

fn growth_signal(m: &FinancialMetrics) -> (Signal, String) {
  let checks = [
    (m.revenue_growth, 0.10),
    (m.earnings_growth, 0.10),
    (m.book_value_growth, 0.10),
  ];
  let score = checks.iter().filter(|(v, t)| v.map_or(false, |v| v > *t)).count();
  let signal = if score >= 2 { Signal::Bullish } else if score == 0 { Signal::Bearish } else { Signal::Neutral };
  let details = format!(
    "{}, {}",
    fmt_ratio("Revenue Growth", m.revenue_growth),
    fmt_ratio("Earnings Growth", m.earnings_growth)
  );
  (signal, details)
}

fn health_signal(m: &FinancialMetrics) -> (Signal, String) {
  let mut score = 0;
  if m.current_ratio.map_or(false, |v| v > 1.5) {
    score += 1;
  }
  if m.debt_to_equity.map_or(false, |v| v < 0.5) {
    score += 1;
  }
  match (m.free_cash_flow_per_share, m.earnings_per_share) {
    (Some(fcf), Some(eps)) if fcf > eps * 0.8 => score += 1,
    _ => {}
  }
  let signal = if score >= 2 { Signal::Bullish } else if score == 0 { Signal::Bearish } else { Signal::Neutral };
  let details = format!(
    "{}, {}",
    fmt_ratio("Current Ratio", m.current_ratio),
    fmt_ratio("D/E", m.debt_to_equity)
  );
  (signal, details)
}

/// Rich multiples read bearish, cheap multiples bullish.
fn price_ratios_signal(m: &FinancialMetrics) -> (Signal, String) {
  let checks = [
    (m.price_to_earnings_ratio, 25.0),
    (m.price_to_book_ratio, 3.0),
    (m.price_to_sales_ratio, 5.0),
  ];
  let score = checks.iter().filter(|(v, t)| v.map_or(false, |v| v > *t)).count();
  let signal = if score >= 2 { Signal::Bearish } else if score == 0 { Signal::Bullish } else { Signal::Neutral };
  let details = format!(
    "{}, {}, {}",
    fmt_ratio("P/E", m.price_to_earnings_ratio),
    fmt_ratio("P/B", m.price_to_book_ratio),
    fmt_ratio("P/S", m.price_to_sales_ratio)
  );
  (signal, details)
}
