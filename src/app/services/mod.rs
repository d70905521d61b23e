pub mod agent_service;
pub mod ollama_service;
