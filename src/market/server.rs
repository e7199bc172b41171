use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::api::{self, AppState};
use super::commission::CommissionSchedule;
use super::db::MarketDb;
use super::ws;

/// Configuration for the marketplace server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub broadcast_capacity: usize,
    pub commission: CommissionSchedule,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: PathBuf::from("data/homebid.db"),
            dev_mode: false,
            broadcast_capacity: 256,
            commission: CommissionSchedule::default(),
        }
    }
}

/// Build the full application router: REST API plus the WebSocket endpoint.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the database, bind, and serve until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = MarketDb::new(&config.db_path).context("Failed to initialize marketplace database")?;
    let state = Arc::new(AppState::new(
        db,
        config.commission.clone(),
        config.broadcast_capacity,
    ));

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        db = %config.db_path.display(),
        dev_mode = config.dev_mode,
        "homebid listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = MarketDb::new_in_memory().unwrap();
        let state = Arc::new(AppState::new(db, CommissionSchedule::default(), 16));
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_quote_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/commission/quote?amount_cents=250000")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let quote: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(quote["rate_bps"], 800);
        assert_eq!(quote["fee_cents"], 20_000);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = test_router();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        // A plain GET without upgrade headers is rejected by the extractor.
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_ws_identity_checked_before_upgrade() {
        let db = MarketDb::new_in_memory().unwrap();
        let ana = db
            .create_user("Ana", "ana@example.com", crate::market::models::Role::Customer)
            .unwrap();
        let app = build_router(Arc::new(AppState::new(db, CommissionSchedule::default(), 16)));

        let cases = [
            (Some("999"), "/ws", StatusCode::UNAUTHORIZED),
            (Some("abc"), "/ws", StatusCode::UNAUTHORIZED),
            (None, "/ws?user_id=7", StatusCode::UNAUTHORIZED),
            (Some("1"), "/ws?user_id=7", StatusCode::FORBIDDEN),
        ];
        for (header, uri, expected) in cases {
            let mut builder = Request::builder().uri(uri);
            if let Some(id) = header {
                builder = builder.header(api::USER_HEADER, id);
            }
            let resp = app
                .clone()
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), expected, "{:?} {}", header, uri);
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert!(body["error"].is_string());
        }

        // A known user gets past identity and only fails the upgrade itself
        let req = Request::builder()
            .uri(format!("/ws?user_id={}", ana.id))
            .header(api::USER_HEADER, ana.id.to_string())
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_ne!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/nothing-here")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, PathBuf::from("data/homebid.db"));
        assert!(!config.dev_mode);
        assert_eq!(config.broadcast_capacity, 256);
    }
}
