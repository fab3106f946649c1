use chrono::SecondsFormat;
use reqwest::Method;
use serde_json::{Map, Value, json};

use crate::cloudflare::unwrap_envelope;
use crate::util::{
    arg_optional_bool, arg_optional_datetime, arg_optional_enum, arg_optional_string,
    arg_optional_u64_in, path_segment, push_query,
};
use crate::{McpServer, ToolDefinition, ToolError};

const ORDER_FIELDS: [&str; 6] = ["created_at", "provider", "model", "model_type", "success", "cached"];

fn gateway_id_schema() -> Value {
    json!({ "type": "string", "description": "Gateway id as returned by list_gateways" })
}

fn log_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "gateway_id": gateway_id_schema(),
            "log_id": { "type": "string" }
        },
        "required": ["gateway_id", "log_id"],
        "additionalProperties": false
    })
}

pub(super) fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "list_gateways",
            description: "List AI Gateways in the active account.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "search": { "type": "string" },
                    "page": { "type": "integer", "minimum": 1 },
                    "per_page": { "type": "integer", "minimum": 1, "maximum": 50 }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "list_logs",
            description: "List request logs of a gateway, filtered by outcome, model, provider or time.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "gateway_id": gateway_id_schema(),
                    "page": { "type": "integer", "minimum": 1 },
                    "per_page": { "type": "integer", "minimum": 1, "maximum": 50 },
                    "order_by": { "type": "string", "enum": ORDER_FIELDS },
                    "order_by_direction": { "type": "string", "enum": ["asc", "desc"] },
                    "success": { "type": "boolean" },
                    "cached": { "type": "boolean" },
                    "model": { "type": "string" },
                    "provider": { "type": "string" },
                    "start_date": { "type": "string", "format": "date-time" },
                    "end_date": { "type": "string", "format": "date-time" }
                },
                "required": ["gateway_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_log_details",
            description: "Metadata of a single gateway log entry: model, provider, tokens, cost, status.",
            input_schema: log_schema(),
        },
        ToolDefinition {
            name: "get_log_request_body",
            description: "The request body that was sent through the gateway for a log entry.",
            input_schema: log_schema(),
        },
        ToolDefinition {
            name: "get_log_response_body",
            description: "The response body the provider returned for a log entry.",
            input_schema: log_schema(),
        },
    ]
}

impl McpServer {
    pub(crate) async fn tool_list_gateways(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let mut query = Vec::new();
        push_query(&mut query, "search", arg_optional_string(args, "search")?);
        push_query(&mut query, "page", arg_optional_u64_in(args, "page", 1, u64::MAX)?);
        push_query(&mut query, "per_page", arg_optional_u64_in(args, "per_page", 1, 50)?);

        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .get(&format!("/accounts/{account_id}/ai-gateway/gateways"), &query)
            .await?;
        Ok(response.to_value())
    }

    pub(crate) async fn tool_list_logs(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let gateway_id = path_segment(args, "gateway_id")?;
        let mut query = Vec::new();
        push_query(&mut query, "page", arg_optional_u64_in(args, "page", 1, u64::MAX)?);
        push_query(&mut query, "per_page", arg_optional_u64_in(args, "per_page", 1, 50)?);
        push_query(&mut query, "order_by", arg_optional_enum(args, "order_by", &ORDER_FIELDS)?);
        push_query(
            &mut query,
            "order_by_direction",
            arg_optional_enum(args, "order_by_direction", &["asc", "desc"])?,
        );
        push_query(&mut query, "success", arg_optional_bool(args, "success")?);
        push_query(&mut query, "cached", arg_optional_bool(args, "cached")?);
        push_query(&mut query, "model", arg_optional_string(args, "model")?);
        push_query(&mut query, "provider", arg_optional_string(args, "provider")?);
        for key in ["start_date", "end_date"] {
            push_query(
                &mut query,
                key,
                arg_optional_datetime(args, key)?
                    .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }

        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .get(
                &format!("/accounts/{account_id}/ai-gateway/gateways/{gateway_id}/logs"),
                &query,
            )
            .await?;
        Ok(response.to_value())
    }

    pub(crate) async fn tool_get_log_details(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let path = self.log_path(args).await?;
        let response = self.cloudflare.get(&path, &[]).await?;
        Ok(response.result)
    }

    /// `part` is `request` or `response`. Stored bodies are returned as-is,
    /// JSON or text.
    pub(crate) async fn tool_get_log_body(
        &self,
        args: &Map<String, Value>,
        part: &str,
    ) -> Result<Value, ToolError> {
        let path = format!("{}/{part}", self.log_path(args).await?);
        let response = self.cloudflare.send(Method::GET, &path, &[], None).await?;
        let body = unwrap_envelope(&path, &response)?;
        Ok(json!({
            "part": part,
            "content_type": response.content_type,
            "body": body.result,
        }))
    }

    async fn log_path(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let gateway_id = path_segment(args, "gateway_id")?;
        let log_id = path_segment(args, "log_id")?;
        let account_id = self.active_account_id().await?;
        Ok(format!(
            "/accounts/{account_id}/ai-gateway/gateways/{gateway_id}/logs/{log_id}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::App;
    use crate::tests::{MockCloudflare, MockReply, call_tool, test_server_for};

    #[tokio::test]
    async fn list_logs_forwards_filters() {
        let mock = MockCloudflare::start(|_, _, _| {
            json!({ "success": true, "errors": [], "result": [], "result_info": { "total_count": 0 } })
        })
        .await;
        let server = test_server_for(&mock.url, Some("acc-1"), App::AiGateway);

        let res = call_tool(
            &server,
            "list_logs",
            json!({ "gateway_id": "gw", "success": false, "order_by": "model", "per_page": 5 }),
        )
        .await;
        assert_eq!(res["structuredContent"]["data"]["result_info"]["total_count"], 0);
        assert_eq!(
            mock.requests()[0].uri,
            "/accounts/acc-1/ai-gateway/gateways/gw/logs?per_page=5&order_by=model&success=false"
        );
    }

    #[tokio::test]
    async fn unknown_order_field_is_rejected() {
        let server = test_server_for("http://127.0.0.1:9", Some("acc-1"), App::AiGateway);
        let res = call_tool(
            &server,
            "list_logs",
            json!({ "gateway_id": "gw", "order_by": "latency" }),
        )
        .await;
        assert_eq!(res["structuredContent"]["error"]["field"], "order_by");
    }

    #[tokio::test]
    async fn response_body_passes_plain_text_through() {
        let mock = MockCloudflare::start_raw(|_, _, _| MockReply {
            status: 200,
            content_type: "text/plain".to_string(),
            body: b"streamed tokens".to_vec(),
        })
        .await;
        let server = test_server_for(&mock.url, Some("acc-1"), App::AiGateway);

        let res = call_tool(
            &server,
            "get_log_response_body",
            json!({ "gateway_id": "gw", "log_id": "log-1" }),
        )
        .await;
        let data = &res["structuredContent"]["data"];
        assert_eq!(data["part"], "response");
        assert_eq!(data["body"], "streamed tokens");
        assert_eq!(
            mock.requests()[0].uri,
            "/accounts/acc-1/ai-gateway/gateways/gw/logs/log-1/response"
        );
    }

    #[tokio::test]
    async fn missing_log_maps_to_not_found() {
        let mock = MockCloudflare::start_raw(|_, _, _| {
            MockReply::json(
                404,
                json!({ "success": false, "errors": [{ "code": 7002, "message": "Log not found" }] }),
            )
        })
        .await;
        let server = test_server_for(&mock.url, Some("acc-1"), App::AiGateway);

        let res = call_tool(
            &server,
            "get_log_details",
            json!({ "gateway_id": "gw", "log_id": "nope" }),
        )
        .await;
        assert_eq!(res["structuredContent"]["error"]["error"], "cloudflare_not_found");
        assert_eq!(res["structuredContent"]["error"]["message"], "Log not found");
    }
}
