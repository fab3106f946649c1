use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use cloudflare_mcp_core::MetricsTracker;
use cloudflare_mcp_core::metrics::AuthEvent;
use cloudflare_mcp_runtime::{App, McpRuntimeConfig, handle_http_jsonrpc, user_id_for_bearer_token};
use serde_json::{Value, json};

use crate::error::AppError;
use crate::state::AppState;

const MCP_PATH: &str = "/mcp";

pub fn router() -> Router<AppState> {
    Router::new()
        .route(MCP_PATH, post(mcp_post_default).get(mcp_get))
        .route("/{app}/mcp", post(mcp_post_app).get(mcp_get))
}

async fn mcp_get() -> Response {
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

async fn mcp_post_default(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match state.default_app() {
        Some(app) => mcp_post(state, app, &headers, body).await,
        None => AppError::AmbiguousApp {
            served: state.apps.to_vec(),
        }
        .into_response(),
    }
}

async fn mcp_post_app(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(app) = App::from_slug(&slug) else {
        return AppError::UnknownApp(slug).into_response();
    };
    if !state.serves(app) {
        return AppError::AppNotServed {
            app,
            served: state.apps.to_vec(),
        }
        .into_response();
    }
    mcp_post(state, app, &headers, body).await
}

async fn mcp_post(state: AppState, app: App, headers: &HeaderMap, body: Bytes) -> Response {
    let mut config = McpRuntimeConfig {
        app,
        api_url: state.api_url.clone(),
        token: None,
        default_account_id: None,
    };
    let metrics = MetricsTracker::new(state.services.sink.clone(), config.server_info());

    let token = match extract_bearer_token(headers) {
        Ok(token) => token,
        Err(description) => {
            metrics.track(&AuthEvent {
                outcome: "rejected",
                reason: Some(description.to_string()),
            });
            return mcp_auth_challenge(app, description);
        }
    };
    metrics.track(&AuthEvent {
        outcome: "accepted",
        reason: None,
    });

    let incoming: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return (
                StatusCode::OK,
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {
                        "code": -32700,
                        "message": "Parse error"
                    }
                })),
            )
                .into_response();
        }
    };

    // The upstream token doubles as the caller's identity.
    let user_id = user_id_for_bearer_token(&token);
    config.token = Some(token);
    match handle_http_jsonrpc(config, state.services.clone(), &user_id, incoming).await {
        Some(reply) => (StatusCode::OK, Json(reply)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, &'static str> {
    let Some(raw) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Err("Missing access token");
    };

    let mut parts = raw.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err("Invalid authorization scheme");
    }
    if token.is_empty() {
        return Err("Missing access token");
    }
    Ok(token.to_string())
}

fn mcp_auth_challenge(app: App, description: &str) -> Response {
    let description = description.replace('"', "'");
    let challenge = format!(
        "Bearer realm=\"{}\", error=\"invalid_token\", error_description=\"{description}\"",
        app.server_name()
    );
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "invalid_token",
            "error_description": description,
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(WWW_AUTHENTICATE, value);
    }
    response
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use cloudflare_mcp_core::metrics::MemorySink;
    use cloudflare_mcp_core::storage::MemoryStorageProvider;
    use cloudflare_mcp_runtime::RuntimeServices;
    use tower::ServiceExt;

    use super::*;
    use crate::state::parse_apps;

    pub(crate) fn test_state(apps: &[&str]) -> (AppState, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let state = AppState {
            services: RuntimeServices {
                storage: Arc::new(MemoryStorageProvider::new()),
                sink: sink.clone(),
            },
            db: None,
            api_url: "http://127.0.0.1:9".to_string(),
            apps: parse_apps(Some(&apps.join(","))).unwrap().into(),
        };
        (state, sink)
    }

    async fn post_json(
        state: AppState,
        uri: &str,
        token: Option<&str>,
        body: Value,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let response = router()
            .with_state(state)
            .oneshot(
                request
                    .body(Body::from(body.to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    fn rpc(id: u64, method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), Err("Missing access token"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), Err("Invalid authorization scheme"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  tok "));
        assert_eq!(extract_bearer_token(&headers).unwrap(), "tok");
    }

    #[tokio::test]
    async fn missing_token_gets_a_challenge_and_is_tracked() {
        let (state, sink) = test_state(&["browser"]);
        let (status, headers, body) =
            post_json(state, "/browser/mcp", None, rpc(1, "tools/list", json!({}))).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_token");
        let challenge = headers[WWW_AUTHENTICATE].to_str().unwrap();
        assert!(challenge.starts_with("Bearer realm=\"cloudflare-browser\""));

        let points = sink.points();
        assert_eq!(points[0].indexes, vec!["auth".to_string()]);
        assert_eq!(points[0].blobs[2].as_deref(), Some("rejected"));
    }

    #[tokio::test]
    async fn tools_list_is_served_per_app() {
        let (state, _) = test_state(&["browser", "autorag"]);
        let (status, _, body) =
            post_json(state, "/autorag/mcp", Some("tok"), rpc(1, "tools/list", json!({}))).await;

        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|tool| tool["name"].as_str())
            .collect();
        assert!(names.contains(&"ai_search"));
        assert!(!names.contains(&"get_url_markdown"));
    }

    #[tokio::test]
    async fn unknown_and_unserved_apps_are_not_found() {
        let (state, _) = test_state(&["browser"]);
        let (status, _, body) =
            post_json(state.clone(), "/radar/mcp", Some("tok"), rpc(1, "ping", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "app_not_found");

        let (status, _, body) =
            post_json(state, "/autorag/mcp", Some("tok"), rpc(1, "ping", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["docs_hint"].as_str().unwrap().contains("browser"));
    }

    #[tokio::test]
    async fn bare_path_needs_a_single_served_app() {
        let (single, _) = test_state(&["browser"]);
        let (status, _, body) =
            post_json(single, MCP_PATH, Some("tok"), rpc(1, "initialize", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["serverInfo"]["name"], "cloudflare-browser");

        let (several, _) = test_state(&["browser", "autorag"]);
        let (status, _, body) =
            post_json(several, MCP_PATH, Some("tok"), rpc(1, "ping", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "app_required");
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_body() {
        let (state, _) = test_state(&["browser"]);
        let (status, _, body) = post_json(
            state,
            "/browser/mcp",
            Some("tok"),
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn active_account_persists_per_token() {
        let (state, _) = test_state(&["browser"]);
        let set = rpc(
            1,
            "tools/call",
            json!({ "name": "set_active_account", "arguments": { "active_account_id": "acc-1" } }),
        );
        post_json(state.clone(), "/browser/mcp", Some("tok-a"), set).await;

        let get = rpc(2, "tools/call", json!({ "name": "get_active_account", "arguments": {} }));
        let (_, _, same) = post_json(state.clone(), "/browser/mcp", Some("tok-a"), get.clone()).await;
        assert_eq!(
            same["result"]["structuredContent"]["data"]["active_account_id"],
            "acc-1"
        );

        let (_, _, other) = post_json(state, "/browser/mcp", Some("tok-b"), get).await;
        assert_eq!(
            other["result"]["structuredContent"]["data"]["active_account_id"],
            Value::Null
        );
    }

    #[tokio::test]
    async fn batch_returns_an_array() {
        let (state, _) = test_state(&["browser"]);
        let (status, _, body) = post_json(
            state,
            "/browser/mcp",
            Some("tok"),
            json!([rpc(1, "ping", json!({})), rpc(2, "prompts/list", json!({}))]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn single_element_batch_stays_an_array() {
        let (state, _) = test_state(&["browser"]);
        let (status, _, body) = post_json(
            state,
            "/browser/mcp",
            Some("tok"),
            json!([rpc(1, "ping", json!({}))]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let replies = body.as_array().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["id"], 1);
    }
}
