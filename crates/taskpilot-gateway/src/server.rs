//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{delete, get, post},
};
use std::path::Path;
use std::sync::Arc;
use taskpilot_core::config::TaskPilotConfig;
use taskpilot_crm::{CrmApi, CrmClient};
use taskpilot_db::CacheDb;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub config: TaskPilotConfig,
    pub db: Arc<CacheDb>,
    pub crm: Arc<dyn CrmApi>,
    pub start_time: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/api/v1/info", get(super::routes::system_info))
        // Automation rules CRUD
        .route("/api/v1/automations", get(super::routes::list_automations))
        .route("/api/v1/automations", post(super::routes::save_automation))
        .route(
            "/api/v1/automations/{id}",
            delete(super::routes::delete_automation),
        )
        // Triggers and sweeps
        .route("/api/v1/trigger", post(super::routes::trigger))
        .route("/api/v1/reconcile", post(super::routes::reconcile))
        .route("/api/v1/exits/sweep", post(super::routes::sweep_exits))
        .route("/api/v1/sync", post(super::routes::full_sync))
        // HubSpot webhook ingress
        .route("/api/v1/webhook/hubspot", post(super::routes::hubspot_webhook))
        // Monitor views
        .route("/api/v1/runs", get(super::routes::recent_runs))
        .route("/api/v1/executions", get(super::routes::recent_executions))
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(config: TaskPilotConfig) -> anyhow::Result<()> {
    let db_path = shellexpand::tilde(&config.database.path).to_string();
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = CacheDb::open(Path::new(&db_path)).map_err(anyhow::Error::msg)?;
    tracing::info!("💾 Cache DB ready: {db_path}");

    let crm = CrmClient::new(&config.hubspot.base_url, &config.hubspot.resolve_token());
    if config.hubspot.resolve_token().is_empty() {
        tracing::warn!("⚠️ No HubSpot token configured; CRM calls will fail");
    }

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = AppState {
        config,
        db: Arc::new(db),
        crm: Arc::new(crm),
        start_time: std::time::Instant::now(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
