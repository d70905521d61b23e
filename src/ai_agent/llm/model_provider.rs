use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelProvider {
  Anthropic,
  DeepSeek,
  Gemini,
  Groq,
  OpenAI,
  Ollama,
}

impl ModelProvider {
  pub fn as_str(&self) -> &'static str {
    match self {
      ModelProvider::Anthropic => "Anthropic",
      ModelProvider::DeepSeek => "DeepSeek",
      ModelProvider::Gemini => "Gemini",
      ModelProvider::Groq => "Groq",
      ModelProvider::OpenAI => "OpenAI",
      ModelProvider::Ollama => "Ollama",
    }
  }
}

impl fmt::Display for ModelProvider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ModelProvider {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "anthropic" => Ok(ModelProvider::Anthropic),
      "deepseek" => Ok(ModelProvider::DeepSeek),
      "gemini" => Ok(ModelProvider::Gemini),
      "groq" => Ok(ModelProvider::Groq),
      "openai" => Ok(ModelProvider::OpenAI),
      "ollama" => Ok(ModelProvider::Ollama),
      _ => Err(format!("Unknown model provider: {}", s)),
    }
  }
}

/// Settings for one chat call, resolved per agent.
#[derive(Debug, Clone)]
pub struct LLMModelConfig {
  pub provider: ModelProvider,
  pub model_name: String,
  pub temperature: Option<f32>,
  pub max_tokens: Option<u32>,
  pub top_p: Option<f32>,
}

impl LLMModelConfig {
  pub fn new(model_name: &str, provider: ModelProvider) -> Self {
    LLMModelConfig {
      provider,
      model_name: model_name.to_string(),
      temperature: Some(0.5),
      max_tokens: Some(1024),
      top_p: Some(0.5),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
  pub role: String,
  pub content: String,
}

impl ChatMessage {
  pub fn system(content: impl Into<String>) -> Self {
    ChatMessage { role: "system".to_string(), content: content.into() }
  }

  pub fn user(content: impl Into<String>) -> Self {
    ChatMessage { role: "user".to_string(), content: content.into() }
  }

  pub fn assistant(content: impl Into<String>) -> Self {
    ChatMessage { role: "assistant".to_string(), content: content.into() }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
  pub content: String,
}

#[async_trait]
pub trait LLMChatter: Send + Sync {
  async fn chat(&self, messages: Vec<ChatMessage>, config: &LLMModelConfig) -> Result<LLMResponse>;
}
