use axum::{
    extract::{Path, Query},
    http::HeaderMap,
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;

use crate::{
    auth::Handshake,
    error::{AppErr, AppResult},
    protocol::Message,
    state::AppState,
};

pub const MAX_PAGE: usize = 200;

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<usize>,
}

pub fn router() -> Router {
    Router::new().route("/rooms/:room_id/messages", get(recent))
}

/* ---------------- out-of-band history page ---------------- */
async fn recent(
    Path(room_id): Path<String>,
    Query(q): Query<PageQuery>,
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
) -> AppResult<Json<Vec<Message>>> {
    state.auth.authenticate(&Handshake::from_parts(&headers, None)).await?;

    let limit = page_limit(q.limit, state.core.config().history_limit)?;
    let page = state.core.store().recent(&room_id, limit).await?;
    Ok(Json(page))
}

fn page_limit(asked: Option<usize>, default: usize) -> AppResult<usize> {
    match asked {
        None => Ok(default.clamp(1, MAX_PAGE)),
        Some(n @ 1..=MAX_PAGE) => Ok(n),
        Some(n) => Err(AppErr::Bad(format!("limit must be between 1 and {MAX_PAGE}, got {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_bounds() {
        assert_eq!(page_limit(None, 50).unwrap(), 50);
        assert_eq!(page_limit(Some(200), 50).unwrap(), 200);
        assert!(matches!(page_limit(Some(0), 50), Err(AppErr::Bad(_))));
        assert!(matches!(page_limit(Some(201), 50), Err(AppErr::Bad(_))));
    }
}
