mod cli;
mod config;
mod handlers;
mod registry;
mod relay;
mod storage;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::Cli,
    config::Config,
    handlers::{health_check, login, logout, signup},
    registry::{spawn_sweeper, SessionRegistry, SharedRegistry},
    relay::{websocket_handler, RelayState},
    storage::CredentialStore,
};
use clap::Parser;

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(users_file) = cli.users_file {
        config.users_file = users_file;
    }

    info!("Starting parley relay on port {}", config.port);
    info!("Credential file: {}", config.users_file);
    info!("Session TTL: {} seconds", config.session_ttl_seconds);

    let credentials = match CredentialStore::open(&config.users_file) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open credential file: {}", e);
            std::process::exit(1);
        }
    };

    let registry: SharedRegistry = Arc::new(Mutex::new(SessionRegistry::new(
        credentials,
        Duration::from_secs(config.session_ttl_seconds),
    )));
    spawn_sweeper(
        registry.clone(),
        Duration::from_secs(config.sweep_interval_seconds),
    );

    let relay_state = RelayState::new();

    let auth_routes = Router::new()
        .route("/health", get(health_check))
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .with_state(registry);

    let ws_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(relay_state);

    let app = Router::new()
        .merge(auth_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("Parley relay listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
