use std::env;

/// Process configuration pulled from the environment (.env supported).
#[derive(Clone, Debug)]
pub struct Config {
  pub anthropic_api_key: String,
  pub deepseek_api_key: String,
  pub groq_api_key: String,
  pub google_api_key: String,
  pub financial_datasets_api_key: String,
  pub openai_api_key: String,
  pub database_path: String,
}

impl Config {
  pub fn load() -> Self {
    match dotenv::dotenv() {
      Ok(_) => log::info!("Loaded .env file"),
      Err(_) => log::warn!("No .env file found, relying on process environment"),
    }

    Config {
      anthropic_api_key: optional_var("ANTHROPIC_API_KEY"),
      deepseek_api_key: optional_var("DEEPSEEK_API_KEY"),
      groq_api_key: optional_var("GROQ_API_KEY"),
      google_api_key: optional_var("GOOGLE_API_KEY"),
      financial_datasets_api_key: optional_var("FINANCIAL_DATASETS_API_KEY"),
      openai_api_key: optional_var("OPENAI_API_KEY"),
      database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "hedge_fund.db".to_string()),
    }
  }

  #[cfg(test)]
  pub fn for_tests() -> Self {
    Config {
      anthropic_api_key: String::new(),
      deepseek_api_key: String::new(),
      groq_api_key: String::new(),
      google_api_key: String::new(),
      financial_datasets_api_key: String::new(),
      openai_api_key: String::new(),
      database_path: ":memory:".to_string(),
    }
  }
}

fn optional_var(name: &str) -> String {
  env::var(name).unwrap_or_else(|_| {
    log::warn!("{} not set; calls needing it will fail", name);
    String::new()
  })
}
