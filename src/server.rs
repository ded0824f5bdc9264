use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::api::{self, AppState};
use crate::db::{DbHandle, WorkflowDb};
use crate::storage::ImageStore;

/// Configuration for the BEO workflow server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub storage_root: std::path::PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            db_path: std::path::PathBuf::from("beoflow.db"),
            storage_root: std::path::PathBuf::from("storage"),
            dev_mode: false,
        }
    }
}

/// Build the full application router: JSON API plus the static mounts
/// for uploaded PDFs and processed page images. The frontend is served
/// separately, so every browser client is cross-origin and CORS is open
/// for all configurations.
pub fn build_router(state: Arc<AppState>) -> Router {
    let originals = ServeDir::new(state.store.originals_dir());
    let thumbnails = ServeDir::new(state.store.thumbnails_dir());
    let high_res = ServeDir::new(state.store.high_res_dir());

    api::api_router()
        .nest_service("/storage/originals", originals)
        .nest_service("/storage/thumbnails", thumbnails)
        .nest_service("/storage/high_res", high_res)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the BEO workflow server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let db = WorkflowDb::new(&config.db_path).context("Failed to initialize workflow database")?;
    let store = ImageStore::new(&config.storage_root)?;

    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        store,
        reviews: std::sync::Mutex::new(HashMap::new()),
    });

    let app = build_router(state);

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!("BEO workflow server running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = WorkflowDb::new_in_memory().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let state = Arc::new(AppState {
            db: DbHandle::new(db),
            store,
            reviews: std::sync::Mutex::new(HashMap::new()),
        });
        (build_router(state), dir)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/api/beos")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_cors_is_open_for_any_origin() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_serves_stored_originals() {
        let dir = tempfile::tempdir().unwrap();
        let db = WorkflowDb::new_in_memory().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        store.save_original("sess", b"%PDF-1.4 fake").unwrap();
        let state = Arc::new(AppState {
            db: DbHandle::new(db),
            store,
            reviews: std::sync::Mutex::new(HashMap::new()),
        });
        let app = build_router(state);

        let req = Request::builder()
            .uri("/storage/originals/sess.pdf")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"%PDF-1.4 fake");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/api/session/no-such-session")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_day_date_is_400() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/api/beos/day/not-a-date")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.db_path, std::path::PathBuf::from("beoflow.db"));
        assert_eq!(config.storage_root, std::path::PathBuf::from("storage"));
        assert!(!config.dev_mode);
    }
}
