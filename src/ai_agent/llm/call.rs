use serde::de::DeserializeOwned;

use crate::ai_agent::llm::model_provider::{ChatMessage, LLMModelConfig, ModelProvider};
use crate::ai_agent::llm::models::{get_model_info, ChatterFactory};
use crate::ai_agent::progress::ProgressBus;

pub const DEFAULT_MAX_RETRIES: usize = 3;

/// One structured-output call against whichever model the agent resolved.
///
/// Models with native JSON mode are parsed directly; everything else goes
/// through fenced-JSON extraction. Errors are retried `max_retries` times
/// with a progress event per failure, after which the default is returned.
/// This function never fails out to the caller: an LLM problem must not
/// abort a run.
pub async fn call_model<T, F>(
  messages: Vec<ChatMessage>,
  model_name: &str,
  model_provider: ModelProvider,
  agent_name: &str,
  bus: &ProgressBus,
  factory: &dyn ChatterFactory,
  max_retries: usize,
  default_factory: F,
) -> T
where
  T: DeserializeOwned,
  F: Fn() -> T,
{
  let json_mode = get_model_info(model_name).map(|m| m.has_json_mode()).unwrap_or(true);
  let config = LLMModelConfig::new(model_name, model_provider);

  for attempt in 1..=max_retries {
    let outcome = attempt_call::<T>(&messages, &config, json_mode, factory).await;
    match outcome {
      Ok(value) => return value,
      Err(e) => {
        bus.update_status(agent_name, None, &format!("Error - retry {}/{}", attempt, max_retries));
        if attempt == max_retries {
          log::error!("LLM call for {} failed after {} attempts: {}", agent_name, max_retries, e);
        }
      }
    }
  }

  default_factory()
}

async fn attempt_call<T: DeserializeOwned>(
  messages: &[ChatMessage],
  config: &LLMModelConfig,
  json_mode: bool,
  factory: &dyn ChatterFactory,
) -> anyhow::Result<T> {
  let chatter = factory.make(config)?;
  let response = chatter.chat(messages.to_vec(), config).await?;
  parse_structured(&response.content, json_mode)
}

fn parse_structured<T: DeserializeOwned>(content: &str, json_mode: bool) -> anyhow::Result<T> {
  if json_mode {
    if let Ok(value) = serde_json::from_str::<T>(content.trim()) {
      return Ok(value);
    }
  }
  let block = extract_json_block(content)
    .ok_or_else(|| anyhow::anyhow!("No JSON object found in model response"))?;
  Ok(serde_json::from_str(&block)?)
}

/// Pull the first ```json fenced block out of a markdown-ish reply.
pub fn extract_json_block(content: &str) -> Option<String> {
  let start = content.find("```json")?;
  let rest = &content[start + 7..];
  let end = rest.find("```")?;
  Some(rest[..end].trim().to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ai_agent::llm::model_provider::{LLMChatter, LLMResponse};
  use anyhow::{anyhow, Result};
  use async_trait::async_trait;
  use serde::Deserialize;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{Arc, Mutex};

  #[derive(Deserialize, Debug, PartialEq)]
  struct TickerCall {
    signal: String,
    confidence: f64,
  }

  struct CannedChatter {
    reply: String,
  }

  #[async_trait]
  impl LLMChatter for CannedChatter {
    async fn chat(&self, _messages: Vec<ChatMessage>, _config: &LLMModelConfig) -> Result<LLMResponse> {
      Ok(LLMResponse { content: self.reply.clone() })
    }
  }

  struct FailingChatter {
    attempts: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl LLMChatter for FailingChatter {
    async fn chat(&self, _messages: Vec<ChatMessage>, _config: &LLMModelConfig) -> Result<LLMResponse> {
      self.attempts.fetch_add(1, Ordering::SeqCst);
      Err(anyhow!("upstream unavailable"))
    }
  }

  struct StubFactory {
    reply: Option<String>,
    attempts: Arc<AtomicUsize>,
  }

  impl ChatterFactory for StubFactory {
    fn make(&self, _config: &LLMModelConfig) -> Result<Box<dyn LLMChatter>> {
      match &self.reply {
        Some(reply) => Ok(Box::new(CannedChatter { reply: reply.clone() })),
        None => Ok(Box::new(FailingChatter { attempts: self.attempts.clone() })),
      }
    }
  }

  fn neutral() -> TickerCall {
    TickerCall { signal: "neutral".to_string(), confidence: 0.0 }
  }

  #[tokio::test]
  async fn parses_direct_json_reply() {
    let factory = StubFactory {
      reply: Some(r#"{"signal": "bullish", "confidence": 80.0}"#.to_string()),
      attempts: Arc::new(AtomicUsize::new(0)),
    };
    let bus = ProgressBus::new();

    let result: TickerCall = call_model(
      vec![ChatMessage::user("analyze")],
      "gpt-4o",
      ModelProvider::OpenAI,
      "warren_buffett_agent",
      &bus,
      &factory,
      3,
      neutral,
    )
    .await;

    assert_eq!(result.signal, "bullish");
  }

  #[tokio::test]
  async fn extracts_fenced_json_for_non_json_models() {
    let reply = "Here is my analysis:\n```json\n{\"signal\": \"bearish\", \"confidence\": 55.0}\n```\nThanks.";
    let factory =
      StubFactory { reply: Some(reply.to_string()), attempts: Arc::new(AtomicUsize::new(0)) };
    let bus = ProgressBus::new();

    let result: TickerCall = call_model(
      vec![ChatMessage::user("analyze")],
      "deepseek-chat",
      ModelProvider::DeepSeek,
      "warren_buffett_agent",
      &bus,
      &factory,
      3,
      neutral,
    )
    .await;

    assert_eq!(result.signal, "bearish");
  }

  #[tokio::test]
  async fn returns_default_after_exhausting_retries() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let factory = StubFactory { reply: None, attempts: attempts.clone() };
    let bus = ProgressBus::new();

    let statuses: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let statuses_clone = statuses.clone();
    bus.register_handler(Arc::new(move |update| {
      statuses_clone.lock().unwrap().push(update.status.clone());
    }));

    let result: TickerCall = call_model(
      vec![ChatMessage::user("analyze")],
      "llama3-70b-8192",
      ModelProvider::Groq,
      "portfolio_manager",
      &bus,
      &factory,
      3,
      neutral,
    )
    .await;

    assert_eq!(result, neutral());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let seen = statuses.lock().unwrap().clone();
    assert_eq!(seen, vec!["Error - retry 1/3", "Error - retry 2/3", "Error - retry 3/3"]);
  }

  #[test]
  fn json_block_extraction_handles_missing_fences() {
    assert_eq!(
      extract_json_block("```json\n{\"a\": 1}\n```").as_deref(),
      Some("{\"a\": 1}")
    );
    assert!(extract_json_block("no json here").is_none());
    assert!(extract_json_block("```json unterminated").is_none());
  }
}
