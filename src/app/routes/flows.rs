use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use crate::app::factory::AppState;
use crate::app::models::schemas::{FlowCreateRequest, FlowUpdateRequest};

pub fn configure(cfg: &mut web::ServiceConfig) {
  // The search route must register ahead of the id match.
  cfg.service(web::resource("/flows/search/{name}").route(web::get().to(search_flows)));
  cfg.service(
    web::resource("/flows")
      .route(web::post().to(create_flow))
      .route(web::get().to(list_flows)),
  );
  cfg.service(web::resource("/flows/{flow_id}/duplicate").route(web::post().to(duplicate_flow)));
  cfg.service(
    web::resource("/flows/{flow_id}")
      .route(web::get().to(get_flow))
      .route(web::put().to(update_flow))
      .route(web::delete().to(delete_flow)),
  );
}

#[derive(Deserialize)]
struct ListQuery {
  #[serde(default = "default_true")]
  include_templates: bool,
}

fn default_true() -> bool {
  true
}

#[derive(Deserialize, Default)]
struct DuplicateBody {
  name: Option<String>,
}

async fn create_flow(
  state: web::Data<AppState>,
  request: web::Json<FlowCreateRequest>,
) -> impl Responder {
  if request.name.trim().is_empty() {
    return HttpResponse::BadRequest().json(serde_json::json!({"message": "name is required"}));
  }
  match state.flows.create_flow(&request) {
    Ok(flow) => HttpResponse::Ok().json(flow),
    Err(e) => internal_error(e),
  }
}

async fn list_flows(state: web::Data<AppState>, query: web::Query<ListQuery>) -> impl Responder {
  match state.flows.get_all_flows(query.include_templates) {
    Ok(flows) => {
      // Summary rows only; nodes/edges stay out of the listing.
      let summaries: Vec<serde_json::Value> = flows
        .iter()
        .map(|f| {
          serde_json::json!({
            "id": f.id,
            "name": f.name,
            "description": f.description,
            "is_template": f.is_template,
            "tags": f.tags,
            "created_at": f.created_at,
            "updated_at": f.updated_at,
          })
        })
        .collect();
      HttpResponse::Ok().json(summaries)
    }
    Err(e) => internal_error(e),
  }
}

async fn get_flow(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
  match state.flows.get_flow_by_id(path.into_inner()) {
    Ok(Some(flow)) => HttpResponse::Ok().json(flow),
    Ok(None) => not_found(),
    Err(e) => internal_error(e),
  }
}

async fn update_flow(
  state: web::Data<AppState>,
  path: web::Path<i64>,
  request: web::Json<FlowUpdateRequest>,
) -> impl Responder {
  match state.flows.update_flow(path.into_inner(), &request) {
    Ok(Some(flow)) => HttpResponse::Ok().json(flow),
    Ok(None) => not_found(),
    Err(e) => internal_error(e),
  }
}

async fn delete_flow(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
  let flow_id = path.into_inner();
  match state.flows.delete_flow(flow_id) {
    Ok(true) => {
      if let Err(e) = state.flow_runs.delete_flow_runs_by_flow_id(flow_id) {
        log::error!("Failed to delete runs for flow {}: {}", flow_id, e);
      }
      HttpResponse::Ok().json(serde_json::json!({"success": true}))
    }
    Ok(false) => not_found(),
    Err(e) => internal_error(e),
  }
}

async fn duplicate_flow(
  state: web::Data<AppState>,
  path: web::Path<i64>,
  body: Option<web::Json<DuplicateBody>>,
) -> impl Responder {
  let name = body.and_then(|b| b.into_inner().name);
  match state.flows.duplicate_flow(path.into_inner(), name.as_deref()) {
    Ok(Some(flow)) => HttpResponse::Ok().json(flow),
    Ok(None) => not_found(),
    Err(e) => internal_error(e),
  }
}

async fn search_flows(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
  match state.flows.get_flows_by_name(&path.into_inner()) {
    Ok(flows) => HttpResponse::Ok().json(flows),
    Err(e) => internal_error(e),
  }
}

fn not_found() -> HttpResponse {
  HttpResponse::NotFound().json(serde_json::json!({"message": "Flow not found"}))
}

fn internal_error(e: anyhow::Error) -> HttpResponse {
  log::error!("Flow route failure: {}", e);
  HttpResponse::InternalServerError().json(serde_json::json!({"message": e.to_string()}))
}
