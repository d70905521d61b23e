use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use crate::app::factory::AppState;
use crate::app::models::schemas::{FlowRunCreateRequest, FlowRunUpdateRequest};

pub fn configure(cfg: &mut web::ServiceConfig) {
  cfg.service(
    web::resource("/flows/{flow_id}/runs")
      .route(web::post().to(create_flow_run))
      .route(web::get().to(list_flow_runs)),
  );
  cfg.service(web::resource("/flows/{flow_id}/runs/active").route(web::get().to(get_active_run)));
  cfg.service(web::resource("/flows/{flow_id}/runs/latest").route(web::get().to(get_latest_run)));
  cfg.service(web::resource("/flows/{flow_id}/runs/count").route(web::get().to(get_run_count)));
  cfg.service(
    web::resource("/flows/{flow_id}/runs/{run_id}")
      .route(web::get().to(get_flow_run))
      .route(web::put().to(update_flow_run))
      .route(web::delete().to(delete_flow_run)),
  );
}

#[derive(Deserialize)]
struct PageQuery {
  #[serde(default = "default_limit")]
  limit: i64,
  #[serde(default)]
  offset: i64,
}

fn default_limit() -> i64 {
  50
}

fn flow_missing(state: &AppState, flow_id: i64) -> Option<HttpResponse> {
  match state.flows.get_flow_by_id(flow_id) {
    Ok(Some(_)) => None,
    Ok(None) => {
      Some(HttpResponse::NotFound().json(serde_json::json!({"message": "Flow not found"})))
    }
    Err(e) => Some(internal_error(e)),
  }
}

async fn create_flow_run(
  state: web::Data<AppState>,
  path: web::Path<i64>,
  request: Option<web::Json<FlowRunCreateRequest>>,
) -> impl Responder {
  let flow_id = path.into_inner();
  if let Some(response) = flow_missing(&state, flow_id) {
    return response;
  }
  let request_data = request.and_then(|r| r.into_inner().request_data);
  match state.flow_runs.create_flow_run(flow_id, request_data.as_ref()) {
    Ok(run) => HttpResponse::Ok().json(run),
    Err(e) => internal_error(e),
  }
}

async fn list_flow_runs(
  state: web::Data<AppState>,
  path: web::Path<i64>,
  query: web::Query<PageQuery>,
) -> impl Responder {
  let flow_id = path.into_inner();
  if let Some(response) = flow_missing(&state, flow_id) {
    return response;
  }
  let limit = query.limit.clamp(1, 100);
  let offset = query.offset.max(0);
  match state.flow_runs.get_flow_runs_by_flow_id(flow_id, limit, offset) {
    Ok(runs) => HttpResponse::Ok().json(runs),
    Err(e) => internal_error(e),
  }
}

async fn get_active_run(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
  let flow_id = path.into_inner();
  if let Some(response) = flow_missing(&state, flow_id) {
    return response;
  }
  match state.flow_runs.get_active_flow_run(flow_id) {
    Ok(run) => HttpResponse::Ok().json(run),
    Err(e) => internal_error(e),
  }
}

async fn get_latest_run(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
  let flow_id = path.into_inner();
  if let Some(response) = flow_missing(&state, flow_id) {
    return response;
  }
  match state.flow_runs.get_latest_flow_run(flow_id) {
    Ok(run) => HttpResponse::Ok().json(run),
    Err(e) => internal_error(e),
  }
}

async fn get_run_count(state: web::Data<AppState>, path: web::Path<i64>) -> impl Responder {
  let flow_id = path.into_inner();
  if let Some(response) = flow_missing(&state, flow_id) {
    return response;
  }
  match state.flow_runs.get_flow_run_count(flow_id) {
    Ok(count) => HttpResponse::Ok().json(serde_json::json!({"count": count})),
    Err(e) => internal_error(e),
  }
}

async fn get_flow_run(state: web::Data<AppState>, path: web::Path<(i64, i64)>) -> impl Responder {
  let (flow_id, run_id) = path.into_inner();
  if let Some(response) = flow_missing(&state, flow_id) {
    return response;
  }
  match state.flow_runs.get_flow_run_by_id(run_id) {
    Ok(Some(run)) if run.flow_id == flow_id => HttpResponse::Ok().json(run),
    Ok(_) => run_not_found(),
    Err(e) => internal_error(e),
  }
}

async fn update_flow_run(
  state: web::Data<AppState>,
  path: web::Path<(i64, i64)>,
  request: web::Json<FlowRunUpdateRequest>,
) -> impl Responder {
  let (flow_id, run_id) = path.into_inner();
  match state.flow_runs.get_flow_run_by_id(run_id) {
    Ok(Some(run)) if run.flow_id == flow_id => {}
    Ok(_) => return run_not_found(),
    Err(e) => return internal_error(e),
  }
  match state.flow_runs.update_flow_run(run_id, &request) {
    Ok(Some(run)) => HttpResponse::Ok().json(run),
    Ok(None) => run_not_found(),
    Err(e) => internal_error(e),
  }
}

async fn delete_flow_run(state: web::Data<AppState>, path: web::Path<(i64, i64)>) -> impl Responder {
  let (flow_id, run_id) = path.into_inner();
  match state.flow_runs.get_flow_run_by_id(run_id) {
    Ok(Some(run)) if run.flow_id == flow_id => {}
    Ok(_) => return run_not_found(),
    Err(e) => return internal_error(e),
  }
  match state.flow_runs.delete_flow_run(run_id) {
    Ok(true) => HttpResponse::Ok().json(serde_json::json!({"success": true})),
    Ok(false) => run_not_found(),
    Err(e) => internal_error(e),
  }
}

fn run_not_found() -> HttpResponse {
  HttpResponse::NotFound().json(serde_json::json!({"message": "Flow run not found"}))
}

fn internal_error(e: anyhow::Error) -> HttpResponse {
  log::error!("Flow run route failure: {}", e);
  HttpResponse::InternalServerError().json(serde_json::json!({"message": e.to_string()}))
}
