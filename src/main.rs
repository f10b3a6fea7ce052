//! API Gatekeeper
//!
//! Service entry point: loads configuration, builds the engine, starts the
//! background maintenance sweeper, and serves the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use api_gatekeeper::api::{self, ApiState};
use api_gatekeeper::config;
use api_gatekeeper::core::Gatekeeper;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    info!("Starting API Gatekeeper...");

    let config = config::load_config().expect("Failed to load configuration");

    if let Err(e) = PrometheusBuilder::new().install() {
        warn!("metrics exporter not installed: {}", e);
    }

    let gatekeeper = Arc::new(Gatekeeper::new(&config).expect("Failed to build engine"));

    // Background eviction of expired counters, penalty records, and
    // observation windows, off the request path.
    let sweeper = gatekeeper.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweeper.sweep().await;
        }
    });

    let state = web::Data::new(ApiState {
        gatekeeper: gatekeeper.clone(),
    });

    info!(
        "Listening on {}:{} (store: {})",
        config.server.host, config.server.port, config.storage.backend
    );
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::config)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await
}
