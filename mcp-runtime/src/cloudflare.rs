//! Thin client for the Cloudflare v4 REST API.

use std::time::Duration;

use reqwest::Method;
use serde_json::{Value, json};

use crate::ToolError;
use crate::util::{client, parse_response_body};

pub const DEFAULT_API_URL: &str = "https://api.cloudflare.com/client/v4";
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub(crate) struct ApiCallResult {
    pub(crate) status: u16,
    pub(crate) content_type: Option<String>,
    pub(crate) bytes: Vec<u8>,
}

impl ApiCallResult {
    pub(crate) fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub(crate) fn body(&self) -> Value {
        parse_response_body(&self.bytes)
    }

    pub(crate) fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("application/json"))
    }
}

/// `result` and `result_info` of a successful `{success, errors, result}`
/// envelope.
#[derive(Debug)]
pub(crate) struct CloudflareResult {
    pub(crate) result: Value,
    pub(crate) result_info: Option<Value>,
}

impl CloudflareResult {
    pub(crate) fn to_value(&self) -> Value {
        let mut payload = json!({ "result": self.result });
        if let Some(info) = &self.result_info {
            payload["result_info"] = info.clone();
        }
        payload
    }
}

#[derive(Clone)]
pub(crate) struct CloudflareClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl CloudflareClient {
    pub(crate) fn new(api_url: &str, token: Option<String>) -> Self {
        Self {
            http: client(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Send a request, retrying 429 and 5xx responses and connection failures
    /// with exponential backoff.
    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<ApiCallResult, ToolError> {
        let token = self.token.as_deref().ok_or_else(|| {
            ToolError::new("auth_missing", "No Cloudflare API token configured")
                .with_docs_hint("Set CLOUDFLARE_API_TOKEN or pass --token.")
        })?;
        let mut url = reqwest::Url::parse(&format!("{}{}", self.api_url, path))
            .map_err(|e| ToolError::new("invalid_url", format!("Invalid API URL/path: {e}")))?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if retryable && attempt < MAX_ATTEMPTS {
                        tracing::warn!(
                            path = %path,
                            status = status.as_u16(),
                            attempt,
                            "Cloudflare API request throttled or failed; retrying"
                        );
                    } else {
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let bytes = response.bytes().await.map_err(|e| {
                            ToolError::new(
                                "response_error",
                                format!("Failed to read API response body: {e}"),
                            )
                        })?;
                        return Ok(ApiCallResult {
                            status: status.as_u16(),
                            content_type,
                            bytes: bytes.to_vec(),
                        });
                    }
                }
                Err(err) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(path = %path, error = %err, attempt, "Cloudflare API unreachable; retrying");
                }
                Err(err) => {
                    return Err(ToolError::new(
                        "connection_error",
                        format!("Failed to reach Cloudflare API at {}: {err}", self.api_url),
                    )
                    .with_docs_hint("Check network access and CLOUDFLARE_API_URL."));
                }
            }

            tokio::time::sleep(backoff).await;
            backoff *= 2;
            attempt += 1;
        }
    }

    /// Send a request and unwrap the standard response envelope.
    pub(crate) async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<CloudflareResult, ToolError> {
        let response = self.send(method, path, query, body).await?;
        unwrap_envelope(path, &response)
    }

    pub(crate) async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<CloudflareResult, ToolError> {
        self.call(Method::GET, path, query, None).await
    }

    pub(crate) async fn post(&self, path: &str, body: &Value) -> Result<CloudflareResult, ToolError> {
        self.call(Method::POST, path, &[], Some(body)).await
    }
}

pub(crate) fn unwrap_envelope(
    path: &str,
    response: &ApiCallResult,
) -> Result<CloudflareResult, ToolError> {
    let body = response.body();
    let success = body.get("success").and_then(Value::as_bool);
    if response.is_success() && success != Some(false) {
        let Some(envelope) = body.as_object().filter(|obj| obj.contains_key("result")) else {
            return Ok(CloudflareResult {
                result: body,
                result_info: None,
            });
        };
        return Ok(CloudflareResult {
            result: envelope.get("result").cloned().unwrap_or(Value::Null),
            result_info: envelope.get("result_info").cloned().filter(|v| !v.is_null()),
        });
    }

    let errors = body.get("errors").cloned().unwrap_or_else(|| json!([]));
    let first_message = errors
        .as_array()
        .and_then(|items| items.first())
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let (code, docs_hint) = match response.status {
        401 | 403 => (
            "cloudflare_unauthorized",
            "Check that the API token is valid and grants access to this account/resource.",
        ),
        404 => (
            "cloudflare_not_found",
            "Check the identifiers passed to the tool and the active account.",
        ),
        429 => (
            "cloudflare_rate_limited",
            "Wait before retrying this tool.",
        ),
        _ => (
            "cloudflare_api_error",
            "Inspect details.errors for the Cloudflare error codes.",
        ),
    };
    Err(ToolError::new(
        code,
        first_message.unwrap_or_else(|| format!("Cloudflare API returned HTTP {}", response.status)),
    )
    .with_docs_hint(docs_hint)
    .with_details(json!({
        "path": path,
        "status": response.status,
        "errors": errors,
    })))
}
