pub mod fundamentals;
pub mod portfolio_manager;
pub mod risk_manager;
pub mod sentiment;
pub mod technicals;
pub mod warren_buffett;

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of an analyst's view on a ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
  Bullish,
  Bearish,
  Neutral,
}

impl Signal {
  pub fn as_str(&self) -> &'static str {
    match self {
      Signal::Bullish => "bullish",
      Signal::Bearish => "bearish",
      Signal::Neutral => "neutral",
    }
  }
}

impl fmt::Display for Signal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Signal {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "bullish" => Ok(Signal::Bullish),
      "bearish" => Ok(Signal::Bearish),
      "neutral" => Ok(Signal::Neutral),
      _ => Err(format!("Unknown signal: {}", s)),
    }
  }
}

impl Serialize for Signal {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for Signal {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Signal::from_str(&s).map_err(serde::de::Error::custom)
  }
}

/// Tally a set of directional votes into an overall signal plus the
/// confidence every rule-based analyst reports: the winning share of votes.
pub fn combine_votes(bullish: f64, bearish: f64, total: f64) -> (Signal, f64) {
  let signal = if bullish > bearish {
    Signal::Bullish
  } else if bearish > bullish {
    Signal::Bearish
  } else {
    Signal::Neutral
  };
  let confidence = if total > 0.0 {
    ((bullish.max(bearish) / total) * 100.0).round()
  } else {
    0.0
  };
  (signal, confidence)
}
