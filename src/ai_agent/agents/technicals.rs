use anyhow::Error;
use serde_json::{json, Value};

use crate::ai_agent::agents::Signal;
use crate::ai_agent::graph::context::AgentContext;
use crate::ai_agent::graph::graph::AgentFuture;
use crate::ai_agent::graph::state::{show_agent_reasoning, AgentState, StateDelta};

pub const SIGNAL_KEY: &str = "technical_analyst_agent";

/// Rule-based technical analysis: an ensemble of trend, mean-reversion,
/// momentum, and volatility strategies over the daily closes.
pub struct TechnicalAnalystAgent;

struct StrategySignal {
  signal: Signal,
  confidence: f64,
}

impl TechnicalAnalystAgent {
  pub fn new() -> Self {
    TechnicalAnalystAgent {}
  }

  pub fn static_technical_analyst_agent(state: AgentState, ctx: AgentContext) -> AgentFuture {
    Box::pin(async move { TechnicalAnalystAgent::new().run(state, ctx).await })
  }

  pub async fn run(&self, state: AgentState, ctx: AgentContext) -> Result<StateDelta, Error> {
    let tickers = state.tickers();
    let start_date = state.string_field("start_date").unwrap_or_default();
    let end_date = state.string_field("end_date").unwrap_or_default();

    let mut analysis: serde_json::Map<String, Value> = serde_json::Map::new();

    for ticker in &tickers {
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Fetching price data");
      let prices = ctx.provider.get_prices(ticker, &start_date, &end_date).await?;

      if prices.is_empty() {
        ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Failed: No price data found");
        continue;
      }

      let closes: Vec<f64> = prices.iter().map(|p| p.close).collect();

      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Calculating trend signals");
      let trend = trend_signal(&closes);
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Calculating mean reversion");
      let mean_reversion = mean_reversion_signal(&closes);
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Calculating momentum");
      let momentum = momentum_signal(&closes);
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Analyzing volatility");
      let volatility = volatility_signal(&closes);

      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Combining signals");
      let weighted = [
        (&trend, 0.30),
        (&mean_reversion, 0.25),
        (&momentum, 0.25),
        (&volatility, 0.20),
      ];
      let mut score = 0.0;
      let mut confidence_sum = 0.0;
      for (strategy, weight) in weighted {
        let direction = match strategy.signal {
          Signal::Bullish => 1.0,
          Signal::Bearish => -1.0,
          Signal::Neutral => 0.0,
        };
        score += direction * strategy.confidence * weight;
        confidence_sum += strategy.confidence * weight;
      }

      let overall = if score > 0.15 {
        Signal::Bullish
      } else if score < -0.15 {
        Signal::Bearish
      } else {
        Signal::Neutral
      };
      let confidence = (confidence_sum.min(1.0) * 100.0).round();

      let entry = json!({
        "signal": overall,
        "confidence": confidence,
        "strategy_signals": {
          "trend": {"signal": trend.signal, "confidence": (trend.confidence * 100.0).round()},
          "mean_reversion": {"signal": mean_reversion.signal, "confidence": (mean_reversion.confidence * 100.0).round()},
          "momentum": {"signal": momentum.signal, "confidence": (momentum.confidence * 100.0).round()},
          "volatility": {"signal": volatility.signal, "confidence": (volatility.confidence * 100.0).round()},
        },
      });
      analysis.insert(ticker.clone(), entry);
      ctx.bus.update_status(SIGNAL_KEY, Some(ticker.as_str()), "Done");
    }

    let analysis = Value::Object(analysis);
    if ctx.options.show_reasoning {
      show_agent_reasoning(&analysis.to_string(), "Technical Analyst");
    }
    ctx.bus.update_status(SIGNAL_KEY, None, "Done");

    Ok(StateDelta::for_agent_signals(SIGNAL_KEY, analysis))
  }
}

/// EMA-crossover trend following: short EMA above long EMA reads bullish,
/// confidence scales with the normalized gap.
fn trend_signal(closes: &[f64]) -> StrategySignal {
  if closes.len() < 10 {
    return StrategySignal { signal: Signal::Neutral, confidence: 0.0 };
  }
  let short = ema(closes, 8);
  let long = ema(closes, 21.min(closes.len()));
  let last = closes[closes.len() - 1];
  if last <= 0.0 {
    return StrategySignal { signal: Signal::Neutral, confidence: 0.0 };
  }
  let gap = (short - long) / last;
  let signal = if gap > 0.0 { Signal::Bullish } else if gap < 0.0 { Signal::Bearish } else { Signal::Neutral };
  StrategySignal { signal, confidence: (gap.abs() * 50.0).min(1.0) }
}

/// Z-score of the last close against the 20-day mean; beyond two sigmas we
/// expect a snap back.
fn mean_reversion_signal(closes: &[f64]) -> StrategySignal {
  let window = 20.min(closes.len());
  if window < 5 {
    return StrategySignal { signal: Signal::Neutral, confidence: 0.0 };
  }
  let recent = &closes[closes.len() - window..];
  let mean = recent.iter().sum::<f64>() / window as f64;
  let variance = recent.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / window as f64;
  let std = variance.sqrt();
  if std < 1e-12 {
    return StrategySignal { signal: Signal::Neutral, confidence: 0.0 };
  }
  let z = (closes[closes.len() - 1] - mean) / std;
  let signal = if z < -2.0 {
    Signal::Bullish
  } else if z > 2.0 {
    Signal::Bearish
  } else {
    Signal::Neutral
  };
  StrategySignal { signal, confidence: (z.abs() / 4.0).min(1.0) }
}

/// Sign agreement between the 5-day and 10-day returns.
fn momentum_signal(closes: &[f64]) -> StrategySignal {
  if closes.len() < 11 {
    return StrategySignal { signal: Signal::Neutral, confidence: 0.0 };
  }
  let last = closes[closes.len() - 1];
  let five = closes[closes.len() - 6];
  let ten = closes[closes.len() - 11];
  if five <= 0.0 || ten <= 0.0 {
    return StrategySignal { signal: Signal::Neutral, confidence: 0.0 };
  }
  let r5 = last / five - 1.0;
  let r10 = last / ten - 1.0;
  let signal = if r5 > 0.0 && r10 > 0.0 {
    Signal::Bullish
  } else if r5 < 0.0 && r10 < 0.0 {
    Signal::Bearish
  } else {
    Signal::Neutral
  };
  StrategySignal { signal, confidence: ((r5.abs() + r10.abs()) * 5.0).min(1.0) }
}

/// Low realized volatility relative to its recent average reads bullish
/// (calm tape), elevated volatility bearish.
fn volatility_signal(closes: &[f64]) -> StrategySignal {
  if closes.len() < 15 {
    return StrategySignal { signal: Signal::Neutral, confidence: 0.0 };
  }
  let returns: Vec<f64> = closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect();
  let window = 10;
  let recent = &returns[returns.len() - window..];
  let older = &returns[..returns.len() - window];
  let recent_vol = stdev(recent);
  let older_vol = stdev(older);
  if older_vol < 1e-12 {
    return StrategySignal { signal: Signal::Neutral, confidence: 0.0 };
  }
  let ratio = recent_vol / older_vol;
  let signal = if ratio < 0.8 {
    Signal::Bullish
  } else if ratio > 1.2 {
    Signal::Bearish
  } else {
    Signal::Neutral
  };
  StrategySignal { signal, confidence: ((ratio - 1.0).abs()).min(1.0) }
}

fn ema(values: &[f64], window: usize) -> f64 {
  let alpha = 2.0 / (window as f64 + 1.0);
  let mut current = values[0];
  for value in &values[1..] {
    current = alpha * value + (1.0 - alpha) * current;
  }
  current
}

fn stdev(values: &[f64]) -> f64 {
  if values.len() < 2 {
    return 0.0;
  }
  let mean = values.iter().sum::<f64>() / values.len() as f64;
  let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
  variance.sqrt()
}
