use chrono::SecondsFormat;
use serde_json::{Map, Value, json};

use crate::util::{
    arg_optional_enum, arg_optional_string, arg_optional_string_array, arg_optional_u64_in,
    push_query, required_datetime,
};
use crate::{McpServer, ToolDefinition, ToolError};

/// Tool argument name paired with the audit log filter it maps to.
const FILTERS: [(&str, &str); 6] = [
    ("action_types", "action.type"),
    ("action_results", "action.result"),
    ("actor_emails", "actor.email"),
    ("actor_ip_addresses", "actor.ip_address"),
    ("resource_types", "resource.type"),
    ("zone_names", "zone.name"),
];

pub(super) fn definitions() -> Vec<ToolDefinition> {
    let string_list = json!({ "type": "array", "items": { "type": "string" } });
    let mut properties = json!({
        "since": {
            "type": "string",
            "format": "date-time",
            "description": "Start of the window, RFC 3339"
        },
        "before": {
            "type": "string",
            "format": "date-time",
            "description": "End of the window, RFC 3339"
        },
        "limit": { "type": "integer", "minimum": 1, "maximum": 1000, "default": 100 },
        "direction": { "type": "string", "enum": ["asc", "desc"], "default": "desc" },
        "cursor": { "type": "string" }
    });
    for (arg, _) in FILTERS {
        properties[arg] = string_list.clone();
    }

    vec![ToolDefinition {
        name: "auditlogs_by_account_id",
        description: "Fetch audit log entries of the active account between since and before, optionally filtered by action, actor, resource or zone.",
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": ["since", "before"],
            "additionalProperties": false
        }),
    }]
}

impl McpServer {
    pub(crate) async fn tool_auditlogs_by_account_id(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let since = required_datetime(args, "since")?;
        let before = required_datetime(args, "before")?;
        if since >= before {
            return Err(ToolError::new(
                "validation_failed",
                "'since' must be earlier than 'before'",
            )
            .with_field("since"));
        }

        let mut query = vec![
            ("since".to_string(), since.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("before".to_string(), before.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];
        push_query(&mut query, "limit", arg_optional_u64_in(args, "limit", 1, 1000)?);
        push_query(
            &mut query,
            "direction",
            arg_optional_enum(args, "direction", &["asc", "desc"])?,
        );
        push_query(&mut query, "cursor", arg_optional_string(args, "cursor")?);
        for (arg, filter) in FILTERS {
            for value in arg_optional_string_array(args, arg)?.unwrap_or_default() {
                query.push((filter.to_string(), value));
            }
        }

        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .get(&format!("/accounts/{account_id}/logs/audit"), &query)
            .await?;

        let count = response.result.as_array().map_or(0, Vec::len);
        let cursor = response
            .result_info
            .as_ref()
            .and_then(|info| info.get("cursor"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(json!({
            "entries": response.result,
            "count": count,
            "next_cursor": cursor,
        }))
    }
}
