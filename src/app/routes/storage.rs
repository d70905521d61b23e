use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

pub fn configure(cfg: &mut web::ServiceConfig) {
  cfg.service(web::resource("/storage/save-json").route(web::post().to(save_json)));
}

#[derive(Deserialize)]
struct SaveJsonRequest {
  filename: String,
  data: Value,
}

/// Persist a JSON payload under the outputs/ directory.
async fn save_json(request: web::Json<SaveJsonRequest>) -> impl Responder {
  let filename = request.filename.trim();
  if filename.is_empty() || !is_plain_filename(filename) {
    return HttpResponse::BadRequest()
      .json(serde_json::json!({"message": "filename must be a plain file name"}));
  }

  let outputs_dir = PathBuf::from("outputs");
  if let Err(e) = std::fs::create_dir_all(&outputs_dir) {
    return storage_error(e.into());
  }

  let path = outputs_dir.join(filename);
  let pretty = match serde_json::to_string_pretty(&request.data) {
    Ok(pretty) => pretty,
    Err(e) => return storage_error(e.into()),
  };
  if let Err(e) = std::fs::write(&path, pretty) {
    return storage_error(e.into());
  }

  HttpResponse::Ok().json(serde_json::json!({
    "success": true,
    "message": format!("File saved successfully to {}", path.display()),
    "filename": filename,
  }))
}

fn is_plain_filename(filename: &str) -> bool {
  let path = Path::new(filename);
  let mut components = path.components();
  matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
}

fn storage_error(e: anyhow::Error) -> HttpResponse {
  log::error!("Failed to save file: {}", e);
  HttpResponse::InternalServerError()
    .json(serde_json::json!({"message": format!("Failed to save file: {}", e)}))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_traversal_and_nested_paths() {
    assert!(is_plain_filename("results.json"));
    assert!(!is_plain_filename("../escape.json"));
    assert!(!is_plain_filename("nested/dir.json"));
    assert!(!is_plain_filename("/absolute.json"));
    assert!(!is_plain_filename(".."));
  }
}
