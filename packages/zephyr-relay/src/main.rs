//! Zephyr Relay Server
//!
//! A lightweight WebSocket relay that brokers peer discovery and connection
//! setup for room-scoped P2P sharing:
//!
//! 1. **Room registry**: peers join a named room and receive a consistent
//!    snapshot of who is already there.
//!
//! 2. **Signaling relay**: targeted offer/answer/candidate envelopes are
//!    forwarded between members with the sender id re-stamped server-side.
//!
//! 3. **Liveness supervision**: unresponsive connections are probed on a
//!    fixed interval and evicted through the normal leave path.
//!
//! **Privacy**: the relay never inspects session descriptions or candidate
//! payloads, and chat/file traffic flows peer-to-peer — it never touches
//! this server.

mod handler;
mod liveness;
mod state;

use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "zephyr-relay", version, about = "Zephyr signaling relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// Liveness probe interval in seconds
    #[arg(long, default_value_t = 30, env = "PROBE_INTERVAL_SECS")]
    probe_interval_secs: u64,

    /// Stale-room sweep interval in seconds
    #[arg(long, default_value_t = 3600, env = "SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Age in hours after which an empty room is swept
    #[arg(long, default_value_t = 24, env = "ROOM_MAX_AGE_HOURS")]
    room_max_age_hours: i64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zephyr_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        port: args.port,
        probe_interval_secs: args.probe_interval_secs,
        sweep_interval_secs: args.sweep_interval_secs,
        room_max_age_hours: args.room_max_age_hours,
    };

    let state = RelayState::new(config);

    // Liveness supervisor: probe every open connection, evict the silent.
    let supervisor_state = state.clone();
    let probe_interval = Duration::from_secs(state.config.probe_interval_secs);
    tokio::spawn(async move {
        liveness::run(supervisor_state, probe_interval).await;
    });

    // Periodic sweep of empty rooms nobody ever joined or came back to.
    let sweep_state = state.clone();
    let sweep_interval = state.config.sweep_interval_secs;
    let max_age = chrono::Duration::hours(state.config.room_max_age_hours);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep_state.sweep_stale(max_age);
        }
    });

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/rooms", post(create_room_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!("Zephyr relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Body accepted by `POST /rooms`.
#[derive(Debug, serde::Deserialize, Default)]
struct CreateRoomRequest {
    room_id: Option<String>,
}

/// Explicit room creation. Idempotent: creating an existing room returns it.
/// Rooms that never see a join are reclaimed by the stale sweep.
async fn create_room_handler(
    State(state): State<RelayState>,
    body: Option<Json<CreateRoomRequest>>,
) -> impl IntoResponse {
    let room_id = body
        .and_then(|Json(req)| req.room_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let created = state.create_room(&room_id);
    Json(json!({
        "room_id": room_id,
        "created": created,
    }))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "zephyr-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "connections": state.connection_count(),
        "rooms": state.room_count(),
        "members": state.member_count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.probe_interval_secs, 30);
        assert_eq!(config.sweep_interval_secs, 3600);
        assert_eq!(config.room_max_age_hours, 24);
    }

    #[test]
    fn test_health_json_structure() {
        let json_val = json!({
            "status": "ok",
            "service": "zephyr-relay",
            "version": env!("CARGO_PKG_VERSION"),
        });
        assert_eq!(json_val["status"], "ok");
        assert_eq!(json_val["service"], "zephyr-relay");
    }

    #[tokio::test]
    async fn test_state_creation() {
        let state = RelayState::new(RelayConfig::default());
        assert_eq!(state.connection_count(), 0);
        assert_eq!(state.room_count(), 0);
    }
}
