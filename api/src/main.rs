use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use cloudflare_mcp_core::metrics::LogSink;
use cloudflare_mcp_core::storage::{MemoryStorageProvider, PgStorageProvider, StorageProvider};
use cloudflare_mcp_runtime::{DEFAULT_API_URL, RuntimeServices};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod error;
mod middleware;
mod routes;
mod state;

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cloudflare_mcp_api=debug,cloudflare_mcp_runtime=info,cloudflare_mcp_core=info,analytics=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let apps = match state::parse_apps(std::env::var("CLOUDFLARE_MCP_APPS").ok().as_deref()) {
        Ok(apps) => apps,
        Err(message) => {
            tracing::error!(%message, "invalid CLOUDFLARE_MCP_APPS");
            std::process::exit(2);
        }
    };

    let (storage, db): (Arc<dyn StorageProvider>, Option<PgPool>) =
        match std::env::var("DATABASE_URL") {
            Ok(database_url) if !database_url.trim().is_empty() => {
                let pool = PgPoolOptions::new()
                    .max_connections(20)
                    .connect(&database_url)
                    .await
                    .expect("Failed to connect to database");
                let provider = PgStorageProvider::new(pool.clone());
                provider
                    .ensure_schema()
                    .await
                    .expect("Failed to prepare durable_kv table");
                (Arc::new(provider), Some(pool))
            }
            _ => {
                tracing::warn!("DATABASE_URL not set; per-user state is kept in memory");
                (Arc::new(MemoryStorageProvider::new()), None)
            }
        };

    let api_url = std::env::var("CLOUDFLARE_API_URL")
        .ok()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    let app_state = state::AppState {
        services: RuntimeServices {
            storage,
            sink: Arc::new(LogSink),
        },
        db,
        api_url,
        apps: apps.into(),
    };

    let cors_layer = middleware::cors::build_cors_layer();

    let app = Router::new()
        .merge(routes::health::router())
        .merge(routes::mcp_http::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state.clone());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let served: Vec<&str> = app_state.apps.iter().map(|app| app.slug()).collect();
    tracing::info!(apps = ?served, "Cloudflare MCP server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app)
        .await
        .expect("Server error");
}
