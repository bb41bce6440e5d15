use std::sync::Arc;

use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Extension, Query},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    auth::{Handshake, Identity},
    error::AppResult,
    protocol::{ClientEvent, ServerEvent},
    session::ChatCore,
    state::AppState,
};

pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

pub fn router() -> Router {
    Router::new().route("/chat", get(ws_handler))
}

/// Authenticates before upgrading; a refused handshake never touches a room.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
    Extension(state): Extension<AppState>,
) -> AppResult<impl IntoResponse> {
    let who = state
        .auth
        .authenticate(&Handshake::from_parts(&headers, q.token))
        .await
        .inspect_err(|e| warn!(error = %e, "handshake refused"))?;

    let core = state.core.clone();
    Ok(ws
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |sock| user_ws(sock, who, core)))
}

/* ---------------- per connection ---------------- */
async fn user_ws(sock: WebSocket, who: Identity, core: Arc<ChatCore>) {
    let (mut sink, mut stream) = sock.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn = core.connect(who, tx);

    // outbox -> socket; ends once the connection is dropped from the table
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(raw)) => match serde_json::from_str::<ClientEvent>(&raw) {
                Ok(ev) => {
                    // errors already went back to the client
                    let _ = core.handle(&conn, ev).await;
                }
                Err(e) => {
                    core.fanout().to_conn(&conn, &ServerEvent::Error {
                        code: "InvalidMessage".into(),
                        message: format!("malformed event: {e}"),
                        room_id: None,
                        client_ref: None,
                    });
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%conn, error = %e, "socket read failed");
                break;
            }
        }
    }

    core.disconnect(&conn).await;
    if writer.await.is_err() {
        debug!(%conn, "writer task ended abnormally");
    }
}
