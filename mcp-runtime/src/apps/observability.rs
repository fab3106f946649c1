use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::util::{
    arg_optional_datetime, arg_optional_enum, arg_optional_object, arg_optional_string,
    arg_optional_u64_in, required_string,
};
use crate::{McpServer, ToolDefinition, ToolError};

const DEFAULT_WINDOW_MINUTES: i64 = 60;
const VIEWS: [&str; 3] = ["events", "calculations", "invocations"];
const VALUE_TYPES: [&str; 3] = ["string", "number", "boolean"];

fn timeframe_properties() -> Value {
    json!({
        "from": { "type": "string", "format": "date-time", "description": "Defaults to one hour before 'to'" },
        "to": { "type": "string", "format": "date-time", "description": "Defaults to now" }
    })
}

fn schema_with_timeframe(mut properties: Value, required: &[&str]) -> Value {
    if let (Some(target), Value::Object(timeframe)) =
        (properties.as_object_mut(), timeframe_properties())
    {
        target.extend(timeframe);
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

pub(super) fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "query_worker_observability",
            description: "Query Workers telemetry: list events, compute calculations or list invocations for a time window.",
            input_schema: schema_with_timeframe(
                json!({
                    "view": { "type": "string", "enum": VIEWS, "default": "events" },
                    "worker_name": { "type": "string", "description": "Restrict to one Worker" },
                    "needle": { "type": "string", "description": "Free-text search over event payloads" },
                    "parameters": {
                        "type": "object",
                        "description": "Raw query parameters (filters, calculations, groupBys) merged into the query"
                    },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 100, "default": 10 }
                }),
                &[],
            ),
        },
        ToolDefinition {
            name: "observability_keys",
            description: "List telemetry keys present in the time window, to build filters.",
            input_schema: schema_with_timeframe(
                json!({
                    "key_needle": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 1000, "default": 100 }
                }),
                &[],
            ),
        },
        ToolDefinition {
            name: "observability_values",
            description: "List values a telemetry key takes in the time window.",
            input_schema: schema_with_timeframe(
                json!({
                    "key": { "type": "string" },
                    "type": { "type": "string", "enum": VALUE_TYPES, "default": "string" },
                    "needle": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 1000, "default": 50 }
                }),
                &["key"],
            ),
        },
    ]
}

/// `{from, to}` in epoch milliseconds. `to` defaults to now and `from` to
/// one hour before `to`.
fn timeframe(args: &Map<String, Value>, now: DateTime<Utc>) -> Result<Value, ToolError> {
    let to = arg_optional_datetime(args, "to")?.unwrap_or(now);
    let from = arg_optional_datetime(args, "from")?
        .unwrap_or_else(|| to - Duration::minutes(DEFAULT_WINDOW_MINUTES));
    if from >= to {
        return Err(
            ToolError::new("validation_failed", "'from' must be earlier than 'to'")
                .with_field("from"),
        );
    }
    Ok(json!({
        "from": from.timestamp_millis(),
        "to": to.timestamp_millis(),
    }))
}

impl McpServer {
    pub(crate) async fn tool_query_worker_observability(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let timeframe = timeframe(args, Utc::now())?;
        let view = arg_optional_enum(args, "view", &VIEWS)?.unwrap_or_else(|| "events".to_string());
        let limit = arg_optional_u64_in(args, "limit", 1, 100)?.unwrap_or(10);

        let mut parameters = arg_optional_object(args, "parameters")?.unwrap_or_default();
        if let Some(needle) = arg_optional_string(args, "needle")? {
            parameters.insert("needle".to_string(), json!({ "value": needle }));
        }
        if let Some(worker) = arg_optional_string(args, "worker_name")? {
            let filter = json!({
                "key": "$metadata.service",
                "operation": "eq",
                "type": "string",
                "value": worker
            });
            match parameters.get_mut("filters").and_then(Value::as_array_mut) {
                Some(filters) => filters.push(filter),
                None => {
                    parameters.insert("filters".to_string(), json!([filter]));
                }
            }
        }

        let body = json!({
            "queryId": format!("mcp-{}", Uuid::now_v7()),
            "timeframe": timeframe,
            "view": view,
            "limit": limit,
            "dry": false,
            "parameters": parameters,
        });
        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .post(
                &format!("/accounts/{account_id}/workers/observability/telemetry/query"),
                &body,
            )
            .await?;
        Ok(json!({
            "view": view,
            "timeframe": timeframe,
            "result": response.result,
        }))
    }

    pub(crate) async fn tool_observability_keys(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let mut body = json!({
            "timeframe": timeframe(args, Utc::now())?,
            "limit": arg_optional_u64_in(args, "limit", 1, 1000)?.unwrap_or(100),
        });
        if let Some(needle) = arg_optional_string(args, "key_needle")? {
            body["keyNeedle"] = json!({ "value": needle });
        }

        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .post(
                &format!("/accounts/{account_id}/workers/observability/telemetry/keys"),
                &body,
            )
            .await?;
        Ok(response.result)
    }

    pub(crate) async fn tool_observability_values(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let mut body = json!({
            "timeframe": timeframe(args, Utc::now())?,
            "key": required_string(args, "key")?,
            "type": arg_optional_enum(args, "type", &VALUE_TYPES)?.unwrap_or_else(|| "string".to_string()),
            "datasets": [],
            "limit": arg_optional_u64_in(args, "limit", 1, 1000)?.unwrap_or(50),
        });
        if let Some(needle) = arg_optional_string(args, "needle")? {
            body["needle"] = json!({ "value": needle });
        }

        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .post(
                &format!("/accounts/{account_id}/workers/observability/telemetry/values"),
                &body,
            )
            .await?;
        Ok(response.result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};

    use super::timeframe;
    use crate::App;
    use crate::tests::{MockCloudflare, call_tool, test_server_for};

    fn args(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn timeframe_defaults_to_the_last_hour() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let window = timeframe(&args(json!({})), now).unwrap();
        assert_eq!(window["to"], now.timestamp_millis());
        assert_eq!(window["from"], now.timestamp_millis() - 3_600_000);
    }

    #[test]
    fn inverted_timeframe_is_rejected() {
        let now = Utc::now();
        let err = timeframe(
            &args(json!({ "from": "2025-05-02T00:00:00Z", "to": "2025-05-01T00:00:00Z" })),
            now,
        )
        .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("from"));
    }

    #[tokio::test]
    async fn worker_filter_is_added_to_raw_parameters() {
        let mock = MockCloudflare::start(|_, _, _| {
            json!({ "success": true, "errors": [], "result": { "events": { "count": 0 } } })
        })
        .await;
        let server = test_server_for(&mock.url, Some("acc-1"), App::Observability);

        let res = call_tool(
            &server,
            "query_worker_observability",
            json!({
                "worker_name": "api",
                "view": "calculations",
                "parameters": {
                    "filters": [{ "key": "$metadata.level", "operation": "eq", "type": "string", "value": "error" }],
                    "calculations": [{ "operator": "count" }]
                }
            }),
        )
        .await;
        assert_eq!(res["structuredContent"]["data"]["view"], "calculations");

        let request = &mock.requests()[0];
        assert_eq!(request.uri, "/accounts/acc-1/workers/observability/telemetry/query");
        let filters = request.body["parameters"]["filters"].as_array().unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[1]["value"], "api");
        assert_eq!(request.body["parameters"]["calculations"][0]["operator"], "count");
        assert!(request.body["queryId"].as_str().unwrap().starts_with("mcp-"));
    }

    #[tokio::test]
    async fn values_require_a_key() {
        let server = test_server_for("http://127.0.0.1:9", Some("acc-1"), App::Observability);
        let res = call_tool(&server, "observability_values", json!({})).await;
        assert_eq!(res["structuredContent"]["error"]["field"], "key");
    }
}
