use actix_web::{web, App, HttpServer};
use std::env;

use hedgefund_backend::app::config::Config;
use hedgefund_backend::app::factory::AppState;
use hedgefund_backend::app::routes;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
  if env::var_os("RUST_LOG").is_none() {
    env::set_var("RUST_LOG", "actix_web=info,hedgefund_backend=info");
  }
  env_logger::init();
  dotenv::dotenv().ok();

  let config = Config::load();
  let state = AppState::new(&config)
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

  log::info!("Starting hedge fund backend on 127.0.0.1:8080");
  HttpServer::new(move || {
    App::new()
      .app_data(web::Data::new(state.clone()))
      .configure(routes::configure)
      .wrap(actix_web::middleware::Logger::default())
  })
  .bind(("127.0.0.1", 8080))?
  .run()
  .await
}
