use actix_web::{web, HttpResponse, Responder};
use futures::StreamExt;

use crate::ai_agent::utils::analysts::get_analyst_order;
use crate::app::factory::AppState;
use crate::app::models::schemas::HedgeFundRequest;
use crate::app::services::agent_service::AgentService;

pub fn configure(cfg: &mut web::ServiceConfig) {
  cfg.service(web::resource("/hedge-fund/run").route(web::post().to(run_hedge_fund)));
  cfg.service(web::resource("/hedge-fund/agents").route(web::get().to(get_agents)));
}

/// Kick off a streaming run. The response is `text/event-stream`; dropping
/// the connection cancels the run within one tick.
async fn run_hedge_fund(
  state: web::Data<AppState>,
  request: web::Json<HedgeFundRequest>,
) -> impl Responder {
  let request = request.into_inner();
  if let Err(message) = AgentService::validate(&request) {
    return HttpResponse::BadRequest().json(serde_json::json!({"message": message}));
  }

  let frames = state.agent_service.run_streaming(request, None);
  let body = frames.map(|frame| Ok::<_, actix_web::Error>(web::Bytes::from(frame)));
  HttpResponse::Ok()
    .content_type("text/event-stream")
    .insert_header(("Cache-Control", "no-cache"))
    .streaming(body)
}

async fn get_agents() -> impl Responder {
  let agents: Vec<serde_json::Value> = get_analyst_order()
    .into_iter()
    .map(|(display_name, key)| serde_json::json!({"display_name": display_name, "key": key}))
    .collect();
  HttpResponse::Ok().json(serde_json::json!({"agents": agents}))
}
