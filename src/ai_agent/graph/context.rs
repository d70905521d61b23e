use std::str::FromStr;
use std::sync::Arc;

use crate::ai_agent::data::provider::DataProvider;
use crate::ai_agent::llm::model_provider::ModelProvider;
use crate::ai_agent::llm::models::ChatterFactory;
use crate::ai_agent::progress::ProgressBus;

/// Per-agent model override carried in the request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentModelConfig {
  pub agent_id: String,
  pub model_name: Option<String>,
  pub model_provider: Option<String>,
}

/// Options fixed for the lifetime of one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
  pub model_name: String,
  pub model_provider: ModelProvider,
  pub show_reasoning: bool,
  pub agent_models: Vec<AgentModelConfig>,
}

impl RunOptions {
  pub fn new(model_name: &str, model_provider: ModelProvider) -> Self {
    RunOptions {
      model_name: model_name.to_string(),
      model_provider,
      show_reasoning: false,
      agent_models: Vec::new(),
    }
  }

  /// Resolve the model an agent should call: its override when one was
  /// supplied, the run default otherwise.
  pub fn agent_model(&self, agent_id: &str) -> (String, ModelProvider) {
    for config in &self.agent_models {
      if config.agent_id == agent_id {
        let name = config.model_name.clone().unwrap_or_else(|| self.model_name.clone());
        let provider = config
          .model_provider
          .as_deref()
          .and_then(|p| ModelProvider::from_str(p).ok())
          .unwrap_or(self.model_provider);
        return (name, provider);
      }
    }
    (self.model_name.clone(), self.model_provider)
  }
}

/// Everything a node needs besides the state snapshot: market data, the
/// progress bus for this run, the LLM factory, and the run options.
#[derive(Clone)]
pub struct AgentContext {
  pub provider: Arc<dyn DataProvider>,
  pub bus: ProgressBus,
  pub chatters: Arc<dyn ChatterFactory>,
  pub options: Arc<RunOptions>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn agent_model_falls_back_to_run_default() {
    let mut options = RunOptions::new("gpt-4o", ModelProvider::OpenAI);
    options.agent_models.push(AgentModelConfig {
      agent_id: "warren_buffett".to_string(),
      model_name: Some("llama3-70b-8192".to_string()),
      model_provider: Some("Groq".to_string()),
    });
    options.agent_models.push(AgentModelConfig {
      agent_id: "sentiment_analyst".to_string(),
      model_name: None,
      model_provider: None,
    });

    assert_eq!(
      options.agent_model("warren_buffett"),
      ("llama3-70b-8192".to_string(), ModelProvider::Groq)
    );
    // Override row with no fields falls back field-by-field.
    assert_eq!(
      options.agent_model("sentiment_analyst"),
      ("gpt-4o".to_string(), ModelProvider::OpenAI)
    );
    // No override row at all.
    assert_eq!(
      options.agent_model("fundamentals_analyst"),
      ("gpt-4o".to_string(), ModelProvider::OpenAI)
    );
  }
}
