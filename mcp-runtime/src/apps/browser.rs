use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Method;
use serde_json::{Map, Value, json};
use url::Url;

use crate::cloudflare::unwrap_envelope;
use crate::util::{arg_bool, arg_optional_u64_in, required_string};
use crate::{McpServer, ToolDefinition, ToolError, ToolOutput};

const DEFAULT_VIEWPORT: (u64, u64) = (1280, 720);

fn url_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "url": { "type": "string", "format": "uri", "description": "Public http(s) URL" }
        },
        "required": ["url"],
        "additionalProperties": false
    })
}

pub(super) fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_url_html_content",
            description: "Render a page in a headless browser and return the resulting HTML.",
            input_schema: url_schema(),
        },
        ToolDefinition {
            name: "get_url_markdown",
            description: "Render a page in a headless browser and return it as Markdown.",
            input_schema: url_schema(),
        },
        ToolDefinition {
            name: "get_url_screenshot",
            description: "Render a page in a headless browser and return a PNG screenshot.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "format": "uri", "description": "Public http(s) URL" },
                    "viewport_width": { "type": "integer", "minimum": 320, "maximum": 3840, "default": DEFAULT_VIEWPORT.0 },
                    "viewport_height": { "type": "integer", "minimum": 240, "maximum": 2160, "default": DEFAULT_VIEWPORT.1 },
                    "full_page": { "type": "boolean", "default": false }
                },
                "required": ["url"],
                "additionalProperties": false
            }),
        },
    ]
}

fn page_url(args: &Map<String, Value>) -> Result<String, ToolError> {
    let raw = required_string(args, "url")?;
    let invalid = || {
        ToolError::new("validation_failed", "'url' must be an absolute http(s) URL")
            .with_field("url")
    };
    let parsed = Url::parse(&raw).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(invalid());
    }
    Ok(parsed.to_string())
}

impl McpServer {
    /// `endpoint` is `content` or `markdown`.
    pub(crate) async fn tool_browser_render(
        &self,
        args: &Map<String, Value>,
        endpoint: &str,
    ) -> Result<Value, ToolError> {
        let url = page_url(args)?;
        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .post(
                &format!("/accounts/{account_id}/browser-rendering/{endpoint}"),
                &json!({ "url": url }),
            )
            .await?;
        Ok(json!({
            "url": url,
            "content": response.result,
        }))
    }

    pub(crate) async fn tool_get_url_screenshot(
        &self,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let url = page_url(args)?;
        let width = arg_optional_u64_in(args, "viewport_width", 320, 3840)?
            .unwrap_or(DEFAULT_VIEWPORT.0);
        let height = arg_optional_u64_in(args, "viewport_height", 240, 2160)?
            .unwrap_or(DEFAULT_VIEWPORT.1);
        let full_page = arg_bool(args, "full_page", false)?;

        let account_id = self.active_account_id().await?;
        let path = format!("/accounts/{account_id}/browser-rendering/screenshot");
        let body = json!({
            "url": url,
            "viewport": { "width": width, "height": height },
            "screenshotOptions": { "fullPage": full_page }
        });
        let response = self
            .cloudflare
            .send(Method::POST, &path, &[], Some(&body))
            .await?;

        // Failures come back as a JSON envelope, images as raw bytes.
        if !response.is_success() || response.is_json() {
            unwrap_envelope(&path, &response)?;
            return Err(ToolError::new(
                "unexpected_response",
                "Browser Rendering returned JSON instead of an image",
            )
            .with_details(json!({ "path": path, "body": response.body() })));
        }

        let mime_type = response
            .content_type
            .clone()
            .unwrap_or_else(|| "image/png".to_string());
        Ok(ToolOutput::Image {
            data: STANDARD.encode(&response.bytes),
            meta: json!({
                "url": url,
                "mime_type": mime_type,
                "bytes": response.bytes.len(),
                "viewport": { "width": width, "height": height },
                "full_page": full_page,
            }),
            mime_type,
        })
    }
}
