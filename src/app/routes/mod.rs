pub mod flow_runs;
pub mod flows;
pub mod hedge_fund;
pub mod language_models;
pub mod ollama;
pub mod storage;

use actix_web::{web, HttpResponse, Responder};

pub fn configure(cfg: &mut web::ServiceConfig) {
  cfg.service(web::resource("/ping").route(web::get().to(ping)));
  hedge_fund::configure(cfg);
  language_models::configure(cfg);
  flows::configure(cfg);
  flow_runs::configure(cfg);
  ollama::configure(cfg);
  storage::configure(cfg);
}

async fn ping() -> impl Responder {
  HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}
