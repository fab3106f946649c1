use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub storage: &'static str,
    pub apps: Vec<&'static str>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Reports degraded when the Postgres state store is configured but unreachable.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (storage, storage_ok) = match &state.db {
        Some(db) => (
            "postgres",
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(db)
                .await
                .is_ok(),
        ),
        None => ("memory", true),
    };

    let http_status = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(HealthResponse {
            status: if storage_ok { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            storage,
            apps: state.apps.iter().map(|app| app.slug()).collect(),
        }),
    )
}
