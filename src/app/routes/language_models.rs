use actix_web::{web, HttpResponse, Responder};
use serde_json::Value;

use crate::ai_agent::llm::models::get_models_list;

pub fn configure(cfg: &mut web::ServiceConfig) {
  cfg.service(web::resource("/language-models").route(web::get().to(get_language_models)));
  cfg.service(web::resource("/language-models/providers").route(web::get().to(get_providers)));
}

async fn get_language_models() -> impl Responder {
  HttpResponse::Ok().json(serde_json::json!({"models": get_models_list()}))
}

/// Cloud models grouped by provider.
async fn get_providers() -> impl Responder {
  let models = get_models_list();
  let mut providers: Vec<(String, Vec<Value>)> = Vec::new();

  for model in models {
    let provider_name = model["provider"].as_str().unwrap_or("Unknown").to_string();
    let entry = serde_json::json!({
      "display_name": model["display_name"],
      "model_name": model["model_name"],
    });
    match providers.iter_mut().find(|(name, _)| *name == provider_name) {
      Some((_, models)) => models.push(entry),
      None => providers.push((provider_name, vec![entry])),
    }
  }

  let grouped: Vec<Value> = providers
    .into_iter()
    .map(|(name, models)| serde_json::json!({"name": name, "models": models}))
    .collect();
  HttpResponse::Ok().json(serde_json::json!({"providers": grouped}))
}
