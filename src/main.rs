use std::sync::Arc;

use pulse_chat_backend::config::Config;
use pulse_chat_backend::realtime::RealtimeService;
use pulse_chat_backend::store::pg::PgStore;
use pulse_chat_backend::store::ChatStore;
use pulse_chat_backend::{router, AppState};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_chat_backend=info,tower_http=info".parse().unwrap()),
        )
        .init();

    let config = Config::from_env().expect("invalid configuration");

    let store = PgStore::connect(&config.database_url).expect("Failed to create pool");
    store.run_migrations().await.expect("Failed to run migrations");
    let store: Arc<dyn ChatStore> = Arc::new(store);

    let realtime = Arc::new(RealtimeService::new(Arc::clone(&store)));
    let state = AppState {
        store,
        realtime: Arc::clone(&realtime),
        jwt_secret: config.jwt_secret.clone(),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind");
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(realtime))
        .await
        .expect("server error");
}

async fn shutdown_signal(realtime: Arc<RealtimeService>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining connections");
    realtime.shutdown();
}
