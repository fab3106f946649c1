use std::sync::Mutex;
use std::time::Duration;

use cloudflare_mcp_core::error::codes;
use cloudflare_mcp_core::{PollConfig, PollError, poll_until_ready};
use serde_json::{Map, Value, json};

use crate::util::{arg_optional_string, arg_optional_u64_in, path_segment, push_query};
use crate::{McpServer, ToolDefinition, ToolError};

const DEFAULT_WAIT_SECONDS: u64 = 300;
const DEFAULT_INTERVAL_SECONDS: u64 = 5;

pub(super) fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "workers_builds_list_builds",
            description: "List recent builds of a Worker, newest first.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "worker_id": { "type": "string", "description": "Worker (script) tag" },
                    "page": { "type": "integer", "minimum": 1 },
                    "per_page": { "type": "integer", "minimum": 1, "maximum": 100 }
                },
                "required": ["worker_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "workers_builds_get_build",
            description: "Get status, trigger and outcome of a single build.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "build_uuid": { "type": "string" }
                },
                "required": ["build_uuid"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "workers_builds_get_build_logs",
            description: "Fetch the log lines of a build. Pass the returned cursor to continue.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "build_uuid": { "type": "string" },
                    "cursor": { "type": "string" }
                },
                "required": ["build_uuid"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "workers_builds_wait_for_build",
            description: "Poll a build until it stops, then return it. Fails with 'timeout' if it is still running after timeout_seconds.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "build_uuid": { "type": "string" },
                    "timeout_seconds": { "type": "integer", "minimum": 1, "maximum": 600, "default": DEFAULT_WAIT_SECONDS },
                    "interval_seconds": { "type": "integer", "minimum": 1, "maximum": 60, "default": DEFAULT_INTERVAL_SECONDS }
                },
                "required": ["build_uuid"],
                "additionalProperties": false
            }),
        },
    ]
}

/// A build is finished once it has stopped or carries an outcome.
fn is_terminal(build: &Value) -> bool {
    build.get("status").and_then(Value::as_str) == Some("stopped")
        || build
            .get("build_outcome")
            .is_some_and(|outcome| !outcome.is_null())
}

impl McpServer {
    pub(crate) async fn tool_workers_builds_list_builds(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let worker_id = path_segment(args, "worker_id")?;
        let mut query = Vec::new();
        push_query(&mut query, "page", arg_optional_u64_in(args, "page", 1, u64::MAX)?);
        push_query(&mut query, "per_page", arg_optional_u64_in(args, "per_page", 1, 100)?);

        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .get(
                &format!("/accounts/{account_id}/builds/workers/{worker_id}/builds"),
                &query,
            )
            .await?;
        Ok(response.to_value())
    }

    pub(crate) async fn tool_workers_builds_get_build(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let build_uuid = path_segment(args, "build_uuid")?;
        let account_id = self.active_account_id().await?;
        let build = self.fetch_build(&account_id, &build_uuid).await?;
        Ok(json!({ "build": build, "finished": is_terminal(&build) }))
    }

    pub(crate) async fn tool_workers_builds_get_build_logs(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let build_uuid = path_segment(args, "build_uuid")?;
        let mut query = Vec::new();
        push_query(&mut query, "cursor", arg_optional_string(args, "cursor")?);

        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .get(
                &format!("/accounts/{account_id}/builds/builds/{build_uuid}/logs"),
                &query,
            )
            .await?;
        Ok(response.to_value())
    }

    pub(crate) async fn tool_workers_builds_wait_for_build(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let build_uuid = path_segment(args, "build_uuid")?;
        let timeout = arg_optional_u64_in(args, "timeout_seconds", 1, 600)?
            .unwrap_or(DEFAULT_WAIT_SECONDS);
        let interval = arg_optional_u64_in(args, "interval_seconds", 1, 60)?
            .unwrap_or(DEFAULT_INTERVAL_SECONDS);
        let account_id = self.active_account_id().await?;

        let last_error: Mutex<Option<ToolError>> = Mutex::new(None);
        let polled = poll_until_ready(
            PollConfig::new(Duration::from_secs(interval), Duration::from_secs(timeout)),
            || self.fetch_build(&account_id, &build_uuid),
            is_terminal,
            |err: &ToolError| {
                tracing::warn!(build_uuid = %build_uuid, error = %err.code, "build status check failed");
                *last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.clone());
            },
        )
        .await;

        match polled {
            Ok(build) => Ok(json!({ "build": build, "finished": true })),
            Err(PollError::Timeout { waited, attempts }) => {
                let mut details = json!({
                    "build_uuid": build_uuid,
                    "waited_seconds": waited.as_secs(),
                    "attempts": attempts,
                });
                if let Some(err) = last_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
                    details["last_error"] = err.to_value();
                }
                Err(ToolError::new(
                    codes::TIMEOUT,
                    format!("Build {build_uuid} did not finish within {timeout}s"),
                )
                .with_docs_hint("Call workers_builds_wait_for_build again or inspect workers_builds_get_build_logs.")
                .with_details(details))
            }
        }
    }

    async fn fetch_build(&self, account_id: &str, build_uuid: &str) -> Result<Value, ToolError> {
        let response = self
            .cloudflare
            .get(&format!("/accounts/{account_id}/builds/builds/{build_uuid}"), &[])
            .await?;
        Ok(response.result)
    }
}
