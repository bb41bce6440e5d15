use axum::Router;

pub mod health;
pub mod history;
pub mod ws;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .nest("/api", history::router())
        .nest("/ws",  ws::router())
}
