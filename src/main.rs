use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, Extension};
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

use nightlife_chat::{
    auth::{Authenticator, JwtVerifier},
    presence::{self, Reconciler},
    routes,
    state::AppState,
    store::{MemoryStore, MessageStore, SqliteStore},
    ChatCore, Config, LiveStatus,
};

const BODY_LIMIT: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let config = Config::from_env()?;
    let store: Arc<dyn MessageStore> = match &config.database_url {
        Some(url) => Arc::new(SqliteStore::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set, chat history lives in memory only");
            Arc::new(MemoryStore::new(config.ring_capacity))
        }
    };

    let core  = Arc::new(ChatCore::new(config.clone(), store));
    let auth  = Authenticator::new(Arc::new(JwtVerifier::new(config.jwt_secret.clone())));
    let state = AppState::new(core.clone(), auth);

    let rec = Reconciler::new(&core);
    tokio::spawn(presence::task(rec.clone(), config.reconcile_interval));
    tokio::spawn(presence::typing_task(rec, config.typing_idle));
    tokio::spawn(log_live_status(core.subscribe_live()));

    let app = routes::router()
        .layer(Extension(state.clone()))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(config.bind_addr).await?;
    state.mark_warm();
    info!(addr = %config.bind_addr, "chat server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

/* ── live-status log ── */
async fn log_live_status(mut rx: broadcast::Receiver<LiveStatus>) {
    loop {
        match rx.recv().await {
            Ok(s) => info!(room = %s.room_id, dj = %s.dj_id, is_live = s.is_live, "dj live status"),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "live status log lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
