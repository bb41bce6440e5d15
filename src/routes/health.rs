use axum::{routing::get, Extension, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub uptime_secs: u64,
    pub connections: usize,
    pub rooms:       usize,
    pub warmed_up:   bool,
}

pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Lets clients tell a cold start apart from a dead server.
pub async fn health(Extension(state): Extension<AppState>) -> Json<Health> {
    Json(Health {
        uptime_secs: state.started.elapsed().as_secs(),
        connections: state.core.connections().len(),
        rooms:       state.core.registry().len(),
        warmed_up:   state.is_warm(),
    })
}
