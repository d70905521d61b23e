use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;

use crate::ai_agent::llm::groq::GroqChatter;
use crate::ai_agent::llm::model_provider::{LLMChatter, LLMModelConfig, ModelProvider};
use crate::ai_agent::llm::ollama::OllamaChatter;
use crate::app::config::Config;

/// Catalog entry describing one model a run can select.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMModel {
  pub display_name: String,
  pub model_name: String,
  pub provider: ModelProvider,
}

impl LLMModel {
  fn new(display_name: &str, model_name: &str, provider: ModelProvider) -> Self {
    LLMModel {
      display_name: display_name.to_string(),
      model_name: model_name.to_string(),
      provider,
    }
  }

  /// Whether the provider can be asked for structured JSON directly. For
  /// models without it, the gateway falls back to fenced-JSON extraction.
  pub fn has_json_mode(&self) -> bool {
    match self.provider {
      ModelProvider::DeepSeek | ModelProvider::Gemini => false,
      ModelProvider::Ollama => {
        self.model_name.contains("llama3") || self.model_name.contains("neural-chat")
      }
      _ => true,
    }
  }
}

static AVAILABLE_MODELS: Lazy<Vec<LLMModel>> = Lazy::new(|| {
  vec![
    LLMModel::new("[anthropic] claude-3.5-haiku", "claude-3-5-haiku-latest", ModelProvider::Anthropic),
    LLMModel::new("[anthropic] claude-3.5-sonnet", "claude-3-5-sonnet-latest", ModelProvider::Anthropic),
    LLMModel::new("[deepseek] deepseek-chat", "deepseek-chat", ModelProvider::DeepSeek),
    LLMModel::new("[gemini] gemini-1.5-flash", "gemini-1.5-flash-latest", ModelProvider::Gemini),
    LLMModel::new("[gemini] gemini-1.5-pro", "gemini-1.5-pro-latest", ModelProvider::Gemini),
    LLMModel::new("[groq] llama3-8b", "llama3-8b-8192", ModelProvider::Groq),
    LLMModel::new("[groq] llama3-70b", "llama3-70b-8192", ModelProvider::Groq),
    LLMModel::new("[openai] gpt-4o", "gpt-4o", ModelProvider::OpenAI),
    LLMModel::new("[openai] gpt-4-turbo", "gpt-4-turbo", ModelProvider::OpenAI),
  ]
});

static OLLAMA_MODELS: Lazy<Vec<LLMModel>> = Lazy::new(|| {
  vec![
    LLMModel::new("[google] gemma3 (4B)", "gemma3:4b", ModelProvider::Ollama),
    LLMModel::new("[alibaba] qwen3 (4B)", "qwen3:4b", ModelProvider::Ollama),
    LLMModel::new("[meta] llama3.1 (8B)", "llama3.1:latest", ModelProvider::Ollama),
    LLMModel::new("[google] gemma3 (12B)", "gemma3:12b", ModelProvider::Ollama),
    LLMModel::new("[mistral] mistral-small3.1 (24B)", "mistral-small3.1", ModelProvider::Ollama),
    LLMModel::new("[meta] llama-3.3 (70B)", "llama3.3:70b-instruct-q4_0", ModelProvider::Ollama),
  ]
});

pub fn get_available_models() -> &'static [LLMModel] {
  AVAILABLE_MODELS.as_slice()
}

pub fn get_ollama_models() -> &'static [LLMModel] {
  OLLAMA_MODELS.as_slice()
}

pub fn get_model_info(model_name: &str) -> Option<&'static LLMModel> {
  get_available_models()
    .iter()
    .chain(get_ollama_models().iter())
    .find(|model| model.model_name == model_name)
}

/// Cloud models serialized for the language-models endpoint.
pub fn get_models_list() -> Vec<serde_json::Value> {
  get_available_models()
    .iter()
    .map(|m| {
      json!({
        "display_name": m.display_name,
        "model_name": m.model_name,
        "provider": m.provider.as_str(),
      })
    })
    .collect()
}

pub fn ollama_base_url() -> String {
  let host = env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
  format!("http://{}:11434", host)
}

/// Seam through which agents obtain chat clients; tests install a stub.
pub trait ChatterFactory: Send + Sync {
  fn make(&self, config: &LLMModelConfig) -> Result<Box<dyn LLMChatter>>;
}

pub struct RealChatterFactory {
  config: Config,
}

impl RealChatterFactory {
  pub fn new(config: Config) -> Self {
    RealChatterFactory { config }
  }
}

impl ChatterFactory for RealChatterFactory {
  fn make(&self, config: &LLMModelConfig) -> Result<Box<dyn LLMChatter>> {
    log::info!("Initializing LLM client for provider {}, model {}", config.provider, config.model_name);
    match config.provider {
      ModelProvider::Groq => Ok(Box::new(GroqChatter::new(self.config.groq_api_key.clone()))),
      ModelProvider::Ollama => Ok(Box::new(OllamaChatter::new(ollama_base_url()))),
      other => Err(anyhow!("{} client not yet implemented", other)),
    }
  }
}
