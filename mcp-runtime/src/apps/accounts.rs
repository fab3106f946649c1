use serde_json::{Map, Value, json};

use crate::util::{arg_optional_u64_in, path_segment, push_query};
use crate::{McpServer, ToolDefinition, ToolError, state_error};

pub(super) fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "accounts_list",
            description: "List the Cloudflare accounts the API token can access.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page": { "type": "integer", "minimum": 1 },
                    "per_page": { "type": "integer", "minimum": 5, "maximum": 50 }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "set_active_account",
            description: "Select the account every other tool operates on. The choice is remembered for this user.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "active_account_id": {
                        "type": "string",
                        "description": "Account id as returned by accounts_list"
                    }
                },
                "required": ["active_account_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_active_account",
            description: "Show the currently selected account, if any.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
    ]
}

impl McpServer {
    pub(crate) async fn tool_accounts_list(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let mut query = Vec::new();
        push_query(&mut query, "page", arg_optional_u64_in(args, "page", 1, u64::MAX)?);
        push_query(&mut query, "per_page", arg_optional_u64_in(args, "per_page", 5, 50)?);

        let response = self.cloudflare.get("/accounts", &query).await?;
        // Only identifying fields; settings blobs are noise for agents.
        let accounts: Vec<Value> = response
            .result
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|account| {
                        json!({
                            "id": account.get("id").cloned().unwrap_or(Value::Null),
                            "name": account.get("name").cloned().unwrap_or(Value::Null),
                            "created_on": account.get("created_on").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(json!({
            "accounts": accounts,
            "count": accounts.len(),
            "result_info": response.result_info,
        }))
    }

    pub(crate) async fn tool_set_active_account(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let account_id = path_segment(args, "active_account_id")?;
        self.user_details()?
            .set_active_account_id(&account_id)
            .map_err(state_error)?;
        Ok(json!({ "active_account_id": account_id }))
    }

    pub(crate) async fn tool_get_active_account(&self) -> Result<Value, ToolError> {
        let stored = self
            .user_details()?
            .active_account_id()
            .await
            .map_err(state_error)?;
        let (account_id, source) = match stored {
            Some(id) => (Some(id), "user"),
            None => match &self.config.default_account_id {
                Some(id) => (Some(id.clone()), "config"),
                None => (None, "none"),
            },
        };
        Ok(json!({
            "active_account_id": account_id,
            "source": source,
        }))
    }
}
