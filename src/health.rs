//! # Health and Monitoring Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness with active session count
//! - `GET /api/v1/metrics`: session counters and live sessions per state
//! - `GET /api/v1/sessions/{session_id}`: snapshot of one live session

use crate::error::AppResult;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let registry = &state.runtime.registry;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-counsel-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": registry.count(),
            "capacity": registry.capacity()
        },
        "providers": {
            "mode": config.providers.mode.as_str(),
            "agents": state.runtime.pipeline.services().agents.count(),
            "affect_enabled": state.runtime.pipeline.services().affect.is_some()
        },
        "demo_mode": state.runtime.demo_mode
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "counters": metrics,
        "live_sessions": {
            "total": state.runtime.registry.count(),
            "by_state": state.runtime.registry.state_counts()
        }
    }))
}

/// Returns 404 with the standard error body when the session is not live.
pub async fn session_snapshot(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let handle = state.runtime.registry.get(&path.into_inner())?;
    Ok(HttpResponse::Ok().json(handle.snapshot()))
}
