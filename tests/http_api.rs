use actix_web::{test, web, App};
use serde_json::{json, Value};
use std::sync::Arc;

use hedgefund_backend::app::config::Config;
use hedgefund_backend::app::factory::AppState;
use hedgefund_backend::app::repositories::flow_repository::FlowRepository;
use hedgefund_backend::app::repositories::flow_run_repository::FlowRunRepository;
use hedgefund_backend::app::repositories::Database;
use hedgefund_backend::app::routes;
use hedgefund_backend::app::services::agent_service::AgentService;
use hedgefund_backend::app::services::ollama_service::OllamaManager;

fn test_config() -> Config {
  Config {
    anthropic_api_key: String::new(),
    deepseek_api_key: String::new(),
    groq_api_key: String::new(),
    google_api_key: String::new(),
    financial_datasets_api_key: String::new(),
    openai_api_key: String::new(),
    database_path: ":memory:".to_string(),
  }
}

fn test_state() -> AppState {
  let db = Database::open(":memory:").unwrap();
  AppState {
    agent_service: Arc::new(AgentService::new(test_config())),
    ollama: Arc::new(OllamaManager::new()),
    flows: FlowRepository::new(db.clone()),
    flow_runs: FlowRunRepository::new(db),
  }
}

macro_rules! app {
  ($state:expr) => {
    test::init_service(
      App::new().app_data(web::Data::new($state.clone())).configure(routes::configure),
    )
    .await
  };
}

#[actix_web::test]
async fn ping_answers_ok() {
  let app = app!(test_state());
  let response = test::call_service(&app, test::TestRequest::get().uri("/ping").to_request()).await;
  assert!(response.status().is_success());
}

#[actix_web::test]
async fn agents_listing_is_ordered_with_display_names() {
  let app = app!(test_state());
  let body: Value =
    test::call_and_read_body_json(&app, test::TestRequest::get().uri("/hedge-fund/agents").to_request())
      .await;

  let agents = body["agents"].as_array().unwrap();
  assert!(!agents.is_empty());
  assert_eq!(agents[0]["key"], "warren_buffett");
  assert_eq!(agents[0]["display_name"], "Warren Buffett");
  assert!(agents.iter().any(|a| a["key"] == "technical_analyst"));
}

#[actix_web::test]
async fn language_models_group_by_provider() {
  let app = app!(test_state());
  let body: Value =
    test::call_and_read_body_json(&app, test::TestRequest::get().uri("/language-models").to_request())
      .await;
  assert!(body["models"].as_array().unwrap().len() > 3);

  let providers: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::get().uri("/language-models/providers").to_request(),
  )
  .await;
  let groups = providers["providers"].as_array().unwrap();
  assert!(groups.iter().any(|g| g["name"] == "OpenAI"));
  for group in groups {
    assert!(!group["models"].as_array().unwrap().is_empty());
  }
}

#[actix_web::test]
async fn hedge_fund_run_rejects_invalid_requests_with_400() {
  let app = app!(test_state());
  let response = test::call_service(
    &app,
    test::TestRequest::post()
      .uri("/hedge-fund/run")
      .set_json(json!({"tickers": [], "selected_agents": []}))
      .to_request(),
  )
  .await;
  assert_eq!(response.status(), 400);

  let response = test::call_service(
    &app,
    test::TestRequest::post()
      .uri("/hedge-fund/run")
      .set_json(json!({
        "tickers": ["AAPL"],
        "selected_agents": [],
        "initial_cash": -10.0,
      }))
      .to_request(),
  )
  .await;
  assert_eq!(response.status(), 400);
}

#[actix_web::test]
async fn flow_crud_over_http() {
  let state = test_state();
  let app = app!(state);

  let created: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::post()
      .uri("/flows")
      .set_json(json!({
        "name": "Momentum Sweep",
        "nodes": [{"id": "n1"}],
        "edges": [],
        "tags": ["momentum"],
      }))
      .to_request(),
  )
  .await;
  let flow_id = created["id"].as_i64().unwrap();
  assert_eq!(created["name"], "Momentum Sweep");
  assert_eq!(created["is_template"], false);

  let fetched: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::get().uri(&format!("/flows/{}", flow_id)).to_request(),
  )
  .await;
  assert_eq!(fetched["nodes"][0]["id"], "n1");

  let updated: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::put()
      .uri(&format!("/flows/{}", flow_id))
      .set_json(json!({"name": "Momentum Sweep v2"}))
      .to_request(),
  )
  .await;
  assert_eq!(updated["name"], "Momentum Sweep v2");
  assert_eq!(updated["nodes"][0]["id"], "n1");

  let found: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::get().uri("/flows/search/momentum").to_request(),
  )
  .await;
  assert_eq!(found.as_array().unwrap().len(), 1);

  let copy: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::post().uri(&format!("/flows/{}/duplicate", flow_id)).to_request(),
  )
  .await;
  assert_eq!(copy["name"], "Momentum Sweep v2 (Copy)");
  assert_eq!(copy["is_template"], false);

  let listing: Value =
    test::call_and_read_body_json(&app, test::TestRequest::get().uri("/flows").to_request()).await;
  assert_eq!(listing.as_array().unwrap().len(), 2);
  // Listing rows are summaries without the graph blobs.
  assert!(listing[0].get("nodes").is_none());

  let deleted =
    test::call_service(&app, test::TestRequest::delete().uri(&format!("/flows/{}", flow_id)).to_request())
      .await;
  assert!(deleted.status().is_success());

  let missing = test::call_service(
    &app,
    test::TestRequest::get().uri(&format!("/flows/{}", flow_id)).to_request(),
  )
  .await;
  assert_eq!(missing.status(), 404);
}

#[actix_web::test]
async fn flow_run_lifecycle_over_http() {
  let state = test_state();
  let app = app!(state);

  let flow: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::post()
      .uri("/flows")
      .set_json(json!({"name": "Runner", "nodes": [], "edges": []}))
      .to_request(),
  )
  .await;
  let flow_id = flow["id"].as_i64().unwrap();

  // Runs against a missing flow are 404.
  let missing = test::call_service(
    &app,
    test::TestRequest::post().uri("/flows/9999/runs").set_json(json!({})).to_request(),
  )
  .await;
  assert_eq!(missing.status(), 404);

  let run: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::post()
      .uri(&format!("/flows/{}/runs", flow_id))
      .set_json(json!({"request_data": {"tickers": ["AAPL"]}}))
      .to_request(),
  )
  .await;
  assert_eq!(run["run_number"], 1);
  assert_eq!(run["status"], "IDLE");
  let run_id = run["id"].as_i64().unwrap();

  let second: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::post().uri(&format!("/flows/{}/runs", flow_id)).to_request(),
  )
  .await;
  assert_eq!(second["run_number"], 2);

  let started: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::put()
      .uri(&format!("/flows/{}/runs/{}", flow_id, run_id))
      .set_json(json!({"status": "IN_PROGRESS"}))
      .to_request(),
  )
  .await;
  assert!(started["started_at"].is_string());

  let active: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::get().uri(&format!("/flows/{}/runs/active", flow_id)).to_request(),
  )
  .await;
  assert_eq!(active["id"], run_id);

  let completed: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::put()
      .uri(&format!("/flows/{}/runs/{}", flow_id, run_id))
      .set_json(json!({"status": "COMPLETE", "results": {"decisions": {}}}))
      .to_request(),
  )
  .await;
  assert!(completed["completed_at"].is_string());

  let count: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::get().uri(&format!("/flows/{}/runs/count", flow_id)).to_request(),
  )
  .await;
  assert_eq!(count["count"], 2);

  let latest: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::get().uri(&format!("/flows/{}/runs/latest", flow_id)).to_request(),
  )
  .await;
  assert_eq!(latest["run_number"], 2);
}

#[actix_web::test]
async fn recommended_models_are_served_without_a_server() {
  let app = app!(test_state());
  let body: Value = test::call_and_read_body_json(
    &app,
    test::TestRequest::get().uri("/ollama/models/recommended").to_request(),
  )
  .await;
  let models = body.as_array().unwrap();
  assert!(!models.is_empty());
  assert!(models.iter().all(|m| m["provider"] == "Ollama"));
}
