use anyhow::Result;
use std::sync::Arc;

use crate::app::config::Config;
use crate::app::repositories::flow_repository::FlowRepository;
use crate::app::repositories::flow_run_repository::FlowRunRepository;
use crate::app::repositories::Database;
use crate::app::services::agent_service::AgentService;
use crate::app::services::ollama_service::OllamaManager;

/// Shared application state handed to every route.
#[derive(Clone)]
pub struct AppState {
  pub agent_service: Arc<AgentService>,
  pub ollama: Arc<OllamaManager>,
  pub flows: FlowRepository,
  pub flow_runs: FlowRunRepository,
}

impl AppState {
  pub fn new(config: &Config) -> Result<Self> {
    let db = Database::open(&config.database_path)?;
    Ok(AppState {
      agent_service: Arc::new(AgentService::new(config.clone())),
      ollama: Arc::new(OllamaManager::new()),
      flows: FlowRepository::new(db.clone()),
      flow_runs: FlowRunRepository::new(db),
    })
  }
}
