use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::ai_agent::llm::model_provider::{ChatMessage, LLMChatter, LLMModelConfig, LLMResponse};

const GROQ_CHAT_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

#[derive(Serialize, Debug)]
struct GroqChatRequest {
  model: String,
  messages: Vec<ChatMessage>,
  #[serde(skip_serializing_if = "Option::is_none")]
  temperature: Option<f32>,
  #[serde(rename = "max_tokens")]
  #[serde(skip_serializing_if = "Option::is_none")]
  max_completion_tokens: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  top_p: Option<f32>,
}

#[derive(Deserialize, Debug)]
struct GroqResponseMessage {
  content: String,
}

#[derive(Deserialize, Debug)]
struct GroqChoice {
  message: GroqResponseMessage,
}

#[derive(Deserialize, Debug)]
struct GroqChatResponse {
  choices: Vec<GroqChoice>,
}

pub struct GroqChatter {
  api_key: String,
  client: Client,
}

impl GroqChatter {
  pub fn new(api_key: String) -> Self {
    GroqChatter { api_key, client: Client::new() }
  }
}

#[async_trait]
impl LLMChatter for GroqChatter {
  async fn chat(&self, messages: Vec<ChatMessage>, config: &LLMModelConfig) -> Result<LLMResponse> {
    let request = GroqChatRequest {
      model: config.model_name.clone(),
      messages,
      temperature: config.temperature,
      max_completion_tokens: config.max_tokens,
      top_p: config.top_p,
    };

    let response = self
      .client
      .post(GROQ_CHAT_URL)
      .bearer_auth(&self.api_key)
      .json(&request)
      .send()
      .await?;

    if !response.status().is_success() {
      return Err(anyhow!("Groq chat request failed with status {}", response.status()));
    }

    let parsed: GroqChatResponse = response.json().await?;
    let first = parsed
      .choices
      .into_iter()
      .next()
      .ok_or_else(|| anyhow!("No response choices received from Groq"))?;
    Ok(LLMResponse { content: first.message.content })
  }
}
