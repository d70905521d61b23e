pub mod call;
pub mod groq;
pub mod model_provider;
pub mod models;
pub mod ollama;
