//! HTTP surface assembly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::cache::MemoryCache;
use crate::config::Settings;
use crate::gateway;
use crate::metrics::{MetricsSink, PromSink};
use crate::state::AppState;
use crate::store::{SqliteStore, StoreError};

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", post(gateway::chat_completions))
        .route("/v1/embeddings", post(gateway::embeddings))
        .route("/v1/models", get(gateway::list_models))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("store init failed: {0}")]
    Store(#[from] StoreError),
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Open the store, seed it on first run, and serve until shutdown.
pub async fn serve(settings: Settings) -> Result<(), ServeError> {
    let store = SqliteStore::open(settings.database_url.as_deref())?;
    if let Some(key) = store.seed_defaults(&settings.default_tenant_id)? {
        tracing::info!(
            tenant = %settings.default_tenant_id,
            "seeded default tenant; API key: {key}"
        );
    }
    if !settings.enable_real_calls {
        tracing::info!("ENABLE_REAL_CALLS is off; adapters return canned responses");
    }

    let port = settings.port;
    let state = AppState::new(
        Arc::new(store),
        Arc::new(MemoryCache::new()),
        Arc::new(PromSink::new()),
        settings,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(ServeError::Bind)?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, app(state))
        .await
        .map_err(ServeError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        let store = SqliteStore::open_in_memory().unwrap();
        store.seed_defaults("default").unwrap();
        AppState::new(
            Arc::new(store),
            Arc::new(MemoryCache::new()),
            Arc::new(PromSink::new()),
            Settings::default(),
        )
    }

    #[tokio::test]
    async fn health_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(test_state());
        let handle = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        let body = response.json::<Value>().await.unwrap();
        assert_eq!(body["status"], "ok");
        handle.abort();
    }
}
