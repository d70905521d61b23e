use actix_web::{web, HttpResponse, Responder};
use futures::StreamExt;
use serde::Deserialize;

use crate::app::factory::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
  cfg.service(web::resource("/ollama/status").route(web::get().to(get_status)));
  cfg.service(web::resource("/ollama/start").route(web::post().to(start_server)));
  cfg.service(web::resource("/ollama/stop").route(web::post().to(stop_server)));
  cfg.service(web::resource("/ollama/models/recommended").route(web::get().to(get_recommended)));
  cfg.service(web::resource("/ollama/models/downloads/active").route(web::get().to(active_downloads)));
  cfg.service(
    web::resource("/ollama/models/download/progress/{model:.*}")
      .route(web::get().to(download_progress_of)),
  );
  cfg.service(
    web::resource("/ollama/models/download/progress")
      .route(web::post().to(download_with_progress)),
  );
  cfg.service(
    web::resource("/ollama/models/download/{model:.*}").route(web::delete().to(cancel_download)),
  );
  cfg.service(web::resource("/ollama/models/download").route(web::post().to(download_model)));
  cfg.service(web::resource("/ollama/models/{model:.*}").route(web::delete().to(delete_model)));
}

#[derive(Deserialize)]
struct ModelRequest {
  model_name: String,
}

async fn get_status(state: web::Data<AppState>) -> impl Responder {
  HttpResponse::Ok().json(state.ollama.check_status().await)
}

async fn start_server(state: web::Data<AppState>) -> impl Responder {
  let status = state.ollama.check_status().await;
  if !status.installed {
    return HttpResponse::BadRequest()
      .json(serde_json::json!({"message": "Ollama is not installed on this system"}));
  }
  if status.running {
    return HttpResponse::Ok()
      .json(serde_json::json!({"success": true, "message": "Ollama server is already running"}));
  }
  let (success, message) = state.ollama.start_server().await;
  if success {
    HttpResponse::Ok().json(serde_json::json!({"success": true, "message": message}))
  } else {
    HttpResponse::InternalServerError().json(serde_json::json!({"message": message}))
  }
}

async fn stop_server(state: web::Data<AppState>) -> impl Responder {
  let status = state.ollama.check_status().await;
  if !status.installed {
    return HttpResponse::BadRequest()
      .json(serde_json::json!({"message": "Ollama is not installed on this system"}));
  }
  if !status.running {
    return HttpResponse::Ok()
      .json(serde_json::json!({"success": true, "message": "Ollama server is already stopped"}));
  }
  let (success, message) = state.ollama.stop_server().await;
  if success {
    HttpResponse::Ok().json(serde_json::json!({"success": true, "message": message}))
  } else {
    HttpResponse::InternalServerError().json(serde_json::json!({"message": message}))
  }
}

/// Legacy blocking download.
async fn download_model(
  state: web::Data<AppState>,
  request: web::Json<ModelRequest>,
) -> impl Responder {
  let status = state.ollama.check_status().await;
  if !status.running {
    return HttpResponse::BadRequest().json(
      serde_json::json!({"message": "Ollama server is not running. Please start it first."}),
    );
  }
  let (success, message) = state.ollama.download_model(&request.model_name).await;
  if success {
    HttpResponse::Ok().json(serde_json::json!({"success": true, "message": message}))
  } else {
    HttpResponse::InternalServerError().json(serde_json::json!({"message": message}))
  }
}

/// Download with progress streamed as SSE frames.
async fn download_with_progress(
  state: web::Data<AppState>,
  request: web::Json<ModelRequest>,
) -> impl Responder {
  let frames = state.ollama.download_model_with_progress(&request.model_name);
  let body = frames.map(|frame| Ok::<_, actix_web::Error>(web::Bytes::from(frame)));
  HttpResponse::Ok()
    .content_type("text/event-stream")
    .insert_header(("Cache-Control", "no-cache"))
    .streaming(body)
}

async fn download_progress_of(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
  match state.ollama.get_download_progress(&path.into_inner()) {
    Some(progress) => HttpResponse::Ok().json(progress),
    None => HttpResponse::NotFound()
      .json(serde_json::json!({"message": "No active download for this model"})),
  }
}

async fn active_downloads(state: web::Data<AppState>) -> impl Responder {
  HttpResponse::Ok().json(state.ollama.get_all_download_progress())
}

async fn cancel_download(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
  let model = path.into_inner();
  if state.ollama.cancel_download(&model) {
    HttpResponse::Ok().json(
      serde_json::json!({"success": true, "message": format!("Download of {} cancelled", model)}),
    )
  } else {
    HttpResponse::NotFound()
      .json(serde_json::json!({"message": "No active download for this model"}))
  }
}

async fn delete_model(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
  let (success, message) = state.ollama.delete_model(&path.into_inner()).await;
  if success {
    HttpResponse::Ok().json(serde_json::json!({"success": true, "message": message}))
  } else {
    HttpResponse::InternalServerError().json(serde_json::json!({"message": message}))
  }
}

async fn get_recommended(state: web::Data<AppState>) -> impl Responder {
  HttpResponse::Ok().json(state.ollama.get_recommended_models())
}
