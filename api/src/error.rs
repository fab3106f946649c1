use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cloudflare_mcp_runtime::App;
use serde_json::json;

fn slugs(apps: &[App]) -> String {
    apps.iter().map(|app| app.slug()).collect::<Vec<_>>().join(", ")
}

/// Routing errors surfaced before a request reaches the MCP runtime.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Unknown MCP app '{0}'")]
    UnknownApp(String),
    #[error("MCP app '{app}' is not served by this deployment")]
    AppNotServed { app: App, served: Vec<App> },
    #[error("This deployment serves several MCP apps; address one by path")]
    AmbiguousApp { served: Vec<App> },
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::UnknownApp(_) | AppError::AppNotServed { .. } => "app_not_found",
            AppError::AmbiguousApp { .. } => "app_required",
        }
    }

    fn docs_hint(&self) -> String {
        match self {
            AppError::UnknownApp(_) => format!("Known apps: {}.", slugs(&App::ALL)),
            AppError::AppNotServed { served, .. } | AppError::AmbiguousApp { served } => {
                format!("Use /{{app}}/mcp with one of: {}.", slugs(served))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();
        let status = match self {
            AppError::UnknownApp(_) | AppError::AppNotServed { .. } => StatusCode::NOT_FOUND,
            AppError::AmbiguousApp { .. } => StatusCode::BAD_REQUEST,
        };
        tracing::debug!(error = %self, request_id = %request_id, "MCP route rejected");

        (
            status,
            Json(json!({
                "error": self.code(),
                "message": self.to_string(),
                "docs_hint": self.docs_hint(),
                "request_id": request_id,
            })),
        )
            .into_response()
    }
}
