use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;

/// Hosted MCP clients that call the server straight from the browser.
const CONNECTOR_ORIGINS: &[&str] = &[
    "https://claude.ai",
    "https://playground.ai.cloudflare.com",
];

/// Build a CORS layer from the `CLOUDFLARE_MCP_CORS_ORIGINS` env var.
///
/// - Origins: comma-separated list (default: `http://localhost:6274`, the MCP inspector)
///   plus the hosted connector origins
/// - Methods: GET, POST, OPTIONS
/// - Headers: Authorization, Content-Type, Mcp-Session-Id
/// - Max age: 3600s
pub fn build_cors_layer() -> CorsLayer {
    let configured = std::env::var("CLOUDFLARE_MCP_CORS_ORIGINS").ok();

    CorsLayer::new()
        .allow_origin(allowed_origins(configured.as_deref()))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("authorization"),
            HeaderName::from_static("content-type"),
            HeaderName::from_static("mcp-session-id"),
        ])
        .max_age(std::time::Duration::from_secs(3600))
}

fn allowed_origins(configured: Option<&str>) -> Vec<HeaderValue> {
    let mut origin_values: Vec<String> = configured
        .unwrap_or("http://localhost:6274")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    for connector_origin in CONNECTOR_ORIGINS {
        if !origin_values
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(connector_origin))
        {
            origin_values.push((*connector_origin).to_string());
        }
    }

    origin_values
        .into_iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect()
}
