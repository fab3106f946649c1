use chrono::{Duration, SecondsFormat, Utc};
use serde_json::{Map, Value, json};

use crate::util::{
    arg_optional_enum, arg_optional_string, arg_optional_string_array, arg_optional_u64_in,
    path_segment, push_query,
};
use crate::{McpServer, ToolDefinition, ToolError};

const DEFAULT_REPORT_DAYS: u64 = 7;
const DEFAULT_METRICS: &str = "queryCount,uncachedCount,staleCount,responseTimeAvg";
const DEFAULT_DIMENSIONS: &str = "queryName,responseCode";

pub(super) fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "zones_list",
            description: "List zones in the active account.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Exact domain name filter" },
                    "status": { "type": "string", "enum": ["initializing", "pending", "active", "moved"] },
                    "page": { "type": "integer", "minimum": 1 },
                    "per_page": { "type": "integer", "minimum": 5, "maximum": 50 },
                    "order": { "type": "string", "enum": ["name", "status", "account.id", "account.name"] },
                    "direction": { "type": "string", "enum": ["asc", "desc"] }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "dns_report",
            description: "DNS query analytics for a zone over the last N days.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "zone": { "type": "string", "description": "Zone id" },
                    "days": { "type": "integer", "minimum": 1, "maximum": 31, "default": DEFAULT_REPORT_DAYS },
                    "metrics": { "type": "array", "items": { "type": "string" } },
                    "dimensions": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["zone"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "show_account_dns_settings",
            description: "Show the DNS settings of the active account.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "show_zone_dns_settings",
            description: "Show the DNS settings of a zone.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "zone": { "type": "string", "description": "Zone id" }
                },
                "required": ["zone"],
                "additionalProperties": false
            }),
        },
    ]
}

fn comma_list(args: &Map<String, Value>, key: &str, default: &str) -> Result<String, ToolError> {
    Ok(match arg_optional_string_array(args, key)? {
        Some(items) if !items.is_empty() => items.join(","),
        _ => default.to_string(),
    })
}

impl McpServer {
    pub(crate) async fn tool_zones_list(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let account_id = self.active_account_id().await?;
        let mut query = vec![("account.id".to_string(), account_id)];
        push_query(&mut query, "name", arg_optional_string(args, "name")?);
        push_query(
            &mut query,
            "status",
            arg_optional_enum(args, "status", &["initializing", "pending", "active", "moved"])?,
        );
        push_query(&mut query, "page", arg_optional_u64_in(args, "page", 1, u64::MAX)?);
        push_query(&mut query, "per_page", arg_optional_u64_in(args, "per_page", 5, 50)?);
        push_query(
            &mut query,
            "order",
            arg_optional_enum(args, "order", &["name", "status", "account.id", "account.name"])?,
        );
        push_query(
            &mut query,
            "direction",
            arg_optional_enum(args, "direction", &["asc", "desc"])?,
        );

        let response = self.cloudflare.get("/zones", &query).await?;
        let zones: Vec<Value> = response
            .result
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|zone| {
                        json!({
                            "id": zone.get("id").cloned().unwrap_or(Value::Null),
                            "name": zone.get("name").cloned().unwrap_or(Value::Null),
                            "status": zone.get("status").cloned().unwrap_or(Value::Null),
                            "paused": zone.get("paused").cloned().unwrap_or(Value::Null),
                            "type": zone.get("type").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(json!({
            "zones": zones,
            "count": zones.len(),
            "result_info": response.result_info,
        }))
    }

    pub(crate) async fn tool_dns_report(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let zone = path_segment(args, "zone")?;
        let days = arg_optional_u64_in(args, "days", 1, 31)?.unwrap_or(DEFAULT_REPORT_DAYS);
        let metrics = comma_list(args, "metrics", DEFAULT_METRICS)?;
        let dimensions = comma_list(args, "dimensions", DEFAULT_DIMENSIONS)?;

        let until = Utc::now();
        // Bounded to 31 above.
        let since = until - Duration::days(days as i64);
        let query = vec![
            ("metrics".to_string(), metrics),
            ("dimensions".to_string(), dimensions),
            ("since".to_string(), since.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("until".to_string(), until.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];

        let response = self
            .cloudflare
            .get(&format!("/zones/{zone}/dns_analytics/report"), &query)
            .await?;
        Ok(json!({
            "zone": zone,
            "days": days,
            "report": response.result,
        }))
    }

    pub(crate) async fn tool_show_account_dns_settings(&self) -> Result<Value, ToolError> {
        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .get(&format!("/accounts/{account_id}/dns_settings"), &[])
            .await?;
        Ok(response.to_value())
    }

    pub(crate) async fn tool_show_zone_dns_settings(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let zone = path_segment(args, "zone")?;
        let response = self
            .cloudflare
            .get(&format!("/zones/{zone}/dns_settings"), &[])
            .await?;
        Ok(response.to_value())
    }
}
