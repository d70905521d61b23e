use std::collections::HashMap;

use crate::ai_agent::agents::fundamentals::FundamentalsAgent;
use crate::ai_agent::agents::sentiment::SentimentAgent;
use crate::ai_agent::agents::technicals::TechnicalAnalystAgent;
use crate::ai_agent::agents::warren_buffett::WarrenBuffettAgent;
use crate::ai_agent::agents::{fundamentals, sentiment, technicals, warren_buffett};
use crate::ai_agent::graph::graph::AgentFunction;

/// Registry row for one analyst strategy.
pub struct AnalystConfig {
  pub display_name: &'static str,
  pub agent_function: AgentFunction,
  pub signal_key: &'static str,
  pub order: usize,
}

/// The closed analyst registry, single source of truth for selection,
/// graph wiring, and the agents listing endpoint.
pub fn get_analyst_config() -> HashMap<&'static str, AnalystConfig> {
  let mut config: HashMap<&'static str, AnalystConfig> = HashMap::new();

  config.insert(
    "warren_buffett",
    AnalystConfig {
      display_name: "Warren Buffett",
      agent_function: WarrenBuffettAgent::static_warren_buffett_agent,
      signal_key: warren_buffett::SIGNAL_KEY,
      order: 8,
    },
  );
  config.insert(
    "technical_analyst",
    AnalystConfig {
      display_name: "Technical Analyst",
      agent_function: TechnicalAnalystAgent::static_technical_analyst_agent,
      signal_key: technicals::SIGNAL_KEY,
      order: 9,
    },
  );
  config.insert(
    "fundamentals_analyst",
    AnalystConfig {
      display_name: "Fundamentals Analyst",
      agent_function: FundamentalsAgent::static_fundamentals_agent,
      signal_key: fundamentals::SIGNAL_KEY,
      order: 10,
    },
  );
  config.insert(
    "sentiment_analyst",
    AnalystConfig {
      display_name: "Sentiment Analyst",
      agent_function: SentimentAgent::static_sentiment_agent,
      signal_key: sentiment::SIGNAL_KEY,
      order: 11,
    },
  );

  config
}

/// `(display_name, key)` pairs in display order, for the agents endpoint.
pub fn get_analyst_order() -> Vec<(String, String)> {
  let config = get_analyst_config();
  let mut pairs: Vec<(&&str, &AnalystConfig)> = config.iter().collect();
  pairs.sort_by_key(|(_, c)| c.order);
  pairs
    .into_iter()
    .map(|(key, c)| (c.display_name.to_string(), key.to_string()))
    .collect()
}

/// Keep only the requested keys that exist in the registry; unknown keys
/// are silently dropped.
pub fn filter_selected(requested: &[String]) -> Vec<String> {
  let config = get_analyst_config();
  requested.iter().filter(|key| config.contains_key(key.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn registry_orders_analysts_stably() {
    let order = get_analyst_order();
    let keys: Vec<&str> = order.iter().map(|(_, k)| k.as_str()).collect();
    assert_eq!(keys, vec!["warren_buffett", "technical_analyst", "fundamentals_analyst", "sentiment_analyst"]);
  }

  #[test]
  fn unknown_keys_are_dropped_silently() {
    let requested = vec![
      "technical_analyst".to_string(),
      "not_an_agent".to_string(),
      "fundamentals_analyst".to_string(),
    ];
    assert_eq!(filter_selected(&requested), vec!["technical_analyst", "fundamentals_analyst"]);
    assert!(filter_selected(&["nobody".to_string()]).is_empty());
  }
}
