pub mod auth;
pub mod broker;
pub mod closure;
pub mod config;
pub mod db;
pub mod envelope;
pub mod http;
pub mod live;
pub mod pipeline;
pub mod repo;
pub mod sessionizer;
pub mod state;
pub mod tick;
pub mod trust;

pub use state::AppState;

use axum::{Router, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/sessions", get(http::sessions::list_sessions))
        .route("/sessions/{session_id}", get(http::sessions::get_session))
        .route(
            "/sessions/{session_id}/telemetry",
            get(http::sessions::get_session_telemetry),
        )
        .route(
            "/sessions/{session_id}/events",
            get(http::sessions::get_session_events),
        )
        .route(
            "/sessions/{session_id}/meta",
            get(http::meta::get_meta).put(http::meta::put_meta),
        )
        .route(
            "/sessions/{session_id}/notes",
            get(http::meta::list_notes).post(http::meta::add_note),
        )
        .route(
            "/sessions/{session_id}/events/overrides",
            get(http::meta::get_overrides).put(http::meta::put_overrides),
        )
        .route(
            "/sessions/{session_id}/reports",
            get(http::reports::list_reports).post(http::reports::create_report),
        )
        .route(
            "/sessions/{session_id}/reports/latest",
            get(http::reports::latest_report),
        )
        .route("/reports/{report_id}", get(http::reports::get_report))
        .route("/live/telemetry", get(http::sse::recent_telemetry))
        .route("/live/events", get(http::sse::recent_events))
        .route("/stream/telemetry", get(http::sse::stream_telemetry))
        .route("/stream/events", get(http::sse::stream_events))
        .route(
            "/stream/envelopes/telemetry",
            get(http::sse::stream_telemetry_envelopes),
        )
        .route(
            "/stream/envelopes/events",
            get(http::sse::stream_event_envelopes),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

mod health {
    use crate::state::AppState;
    use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

    pub async fn health() -> impl IntoResponse {
        Json(serde_json::json!({"status": "ok"}))
    }

    pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
        match sqlx::query("SELECT 1").fetch_one(&state.pool).await {
            Ok(_) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
            Err(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "degraded"})),
            ),
        }
    }
}
