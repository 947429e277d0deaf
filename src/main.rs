//! LineWatch - Staged Quality-Inspection Backend
//! Ingest a tabular production dataset, partition it into training/testing/
//! simulation time windows, train a classifier via the external ML service,
//! then replay the simulation window as a live, throttled prediction stream
//! to connected observers.

mod api;
mod dataset;
mod hub;
mod middleware;
mod ml;
mod models;
mod simulation;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    middleware as axum_middleware,
    response::Response,
    routing::{get, post},
    Router,
};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    dataset::DatasetStore,
    hub::SimulationHub,
    ml::{MlServiceClient, Predictor},
    models::{Config, WsServerEvent},
    simulation::{SharedSimulationState, SimulationEngine},
};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub datasets: Arc<DatasetStore>,
    pub hub: Arc<SimulationHub>,
    pub ml: Arc<MlServiceClient>,
    pub engine: Arc<SimulationEngine>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Config loads .env before anything reads the environment.
    let config = Config::from_env()?;
    init_tracing();

    info!("🔍 LineWatch Inspection Backend Starting");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let datasets = Arc::new(DatasetStore::new());
    let hub = Arc::new(SimulationHub::new(1000));
    let ml = Arc::new(MlServiceClient::new(
        http_client,
        config.ml_service_url.clone(),
    ));
    let predictor: Arc<dyn Predictor> = ml.clone();
    let engine = Arc::new(SimulationEngine::new(
        datasets.clone(),
        predictor,
        hub.clone(),
        Arc::new(SharedSimulationState::new()),
        Duration::from_millis(config.simulation_tick_ms),
    ));

    info!(
        ml_service = %config.ml_service_url,
        tick_ms = config.simulation_tick_ms,
        "configuration loaded"
    );

    let app_state = AppState {
        datasets,
        hub,
        ml,
        engine,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/dataset/upload", post(api::upload_dataset))
        .route("/api/dataset/metadata", get(api::get_dataset_metadata))
        .route("/api/dataset/validate-ranges", post(api::validate_ranges))
        .route("/api/dataset/validated-ranges", get(api::get_validated_ranges))
        .route("/api/model/train", post(api::train_model))
        .route("/api/model/status", get(api::get_model_status))
        .route("/api/simulation/start", post(api::start_simulation))
        .route("/api/simulation/stop", post(api::stop_simulation))
        .route("/api/simulation/reset", post(api::reset_simulation))
        .route("/api/simulation/status", get(api::get_simulation_status))
        .route(
            "/api/simulation/current-data",
            get(api::get_current_window_data),
        )
        .route("/ws/simulation", get(websocket_handler))
        .layer(axum_middleware::from_fn(
            middleware::logging::request_logging,
        ))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Initialize tracing with env-filter overridable verbosity
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linewatch_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let subscription = state.hub.join();
    let subscriber_id = subscription.id;
    let mut rx = subscription.rx;

    // On connect, replay recent predictions so a late joiner isn't looking at
    // an empty feed, then the current counters.
    for event in state.hub.recent_events() {
        let msg = serde_json::to_string(&WsServerEvent::PredictionUpdate(event))
            .unwrap_or_else(|_| "{}".to_string());
        if socket.send(Message::Text(msg)).await.is_err() {
            state.hub.leave(subscriber_id);
            return;
        }
    }
    let status = serde_json::to_string(&WsServerEvent::StatusUpdate(state.engine.status()))
        .unwrap_or_else(|_| "{}".to_string());
    if socket.send(Message::Text(status)).await.is_err() {
        state.hub.leave(subscriber_id);
        return;
    }

    loop {
        tokio::select! {
            // Forward simulation events to this subscriber
            event = rx.recv() => match event {
                Ok(event) => {
                    let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                        warn!("Failed to serialize ws event: {}", e);
                        "{}".to_string()
                    });
                    if socket.send(Message::Text(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(subscriber = %subscriber_id, dropped = n, "slow subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            // Handle incoming messages from client
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    // Try to parse as JSON first
                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                        if json.get("type").and_then(|t| t.as_str()) == Some("ping") {
                            // Echo back pong with the same timestamp for latency calculation
                            let timestamp = json.get("data")
                                .and_then(|d| d.get("timestamp"))
                                .and_then(|t| t.as_i64())
                                .unwrap_or(0);
                            let pong = serde_json::json!({
                                "type": "pong",
                                "data": { "timestamp": timestamp }
                            });
                            let _ = socket.send(Message::Text(pong.to_string())).await;
                        }
                    } else if text == "ping" {
                        // Legacy plain text ping
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    state.hub.leave(subscriber_id);
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "🔍 LineWatch Operational"
}
