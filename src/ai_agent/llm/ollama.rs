use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::ai_agent::llm::model_provider::{ChatMessage, LLMChatter, LLMModelConfig, LLMResponse};

/// Chat client against a locally running Ollama server.
pub struct OllamaChatter {
  base_url: String,
  client: Client,
}

impl OllamaChatter {
  pub fn new(base_url: String) -> Self {
    OllamaChatter { base_url, client: Client::new() }
  }
}

#[derive(Serialize)]
struct OllamaChatRequest {
  model: String,
  messages: Vec<ChatMessage>,
  stream: bool,
  options: serde_json::Value,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
  content: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
  message: OllamaResponseMessage,
}

#[async_trait]
impl LLMChatter for OllamaChatter {
  async fn chat(&self, messages: Vec<ChatMessage>, config: &LLMModelConfig) -> Result<LLMResponse> {
    let request = OllamaChatRequest {
      model: config.model_name.clone(),
      messages,
      stream: false,
      options: json!({
        "temperature": config.temperature,
        "top_p": config.top_p,
      }),
    };

    let url = format!("{}/api/chat", self.base_url);
    let response = self.client.post(&url).json(&request).send().await?;

    if !response.status().is_success() {
      return Err(anyhow!("Ollama chat request failed with status {}", response.status()));
    }

    let parsed: OllamaChatResponse = response.json().await?;
    Ok(LLMResponse { content: parsed.message.content })
  }
}
