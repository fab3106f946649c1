use serde_json::{Map, Value, json};

use crate::util::{
    arg_optional_bool, arg_optional_f64_in, arg_optional_u64_in, path_segment, push_query,
    required_string,
};
use crate::{McpServer, ToolDefinition, ToolError};

fn search_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "rag_id": { "type": "string", "description": "AutoRAG instance id" },
            "query": { "type": "string" },
            "rewrite_query": { "type": "boolean", "default": false },
            "max_num_results": { "type": "integer", "minimum": 1, "maximum": 50, "default": 10 },
            "score_threshold": { "type": "number", "minimum": 0, "maximum": 1 }
        },
        "required": ["rag_id", "query"],
        "additionalProperties": false
    })
}

pub(super) fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "list_rags",
            description: "List AutoRAG instances in the active account.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page": { "type": "integer", "minimum": 1 },
                    "per_page": { "type": "integer", "minimum": 1, "maximum": 50 }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "search",
            description: "Retrieve the indexed document chunks that best match a query.",
            input_schema: search_schema(),
        },
        ToolDefinition {
            name: "ai_search",
            description: "Answer a query with a generated response grounded in the indexed documents.",
            input_schema: search_schema(),
        },
    ]
}

impl McpServer {
    pub(crate) async fn tool_list_rags(
        &self,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let mut query = Vec::new();
        push_query(&mut query, "page", arg_optional_u64_in(args, "page", 1, u64::MAX)?);
        push_query(&mut query, "per_page", arg_optional_u64_in(args, "per_page", 1, 50)?);

        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .get(&format!("/accounts/{account_id}/autorag/rags"), &query)
            .await?;
        Ok(response.to_value())
    }

    /// `endpoint` is `search` or `ai-search`; both take the same body.
    pub(crate) async fn tool_autorag_search(
        &self,
        args: &Map<String, Value>,
        endpoint: &str,
    ) -> Result<Value, ToolError> {
        let rag_id = path_segment(args, "rag_id")?;
        let mut body = json!({ "query": required_string(args, "query")? });
        if let Some(rewrite) = arg_optional_bool(args, "rewrite_query")? {
            body["rewrite_query"] = json!(rewrite);
        }
        if let Some(max) = arg_optional_u64_in(args, "max_num_results", 1, 50)? {
            body["max_num_results"] = json!(max);
        }
        if let Some(threshold) = arg_optional_f64_in(args, "score_threshold", 0.0, 1.0)? {
            body["ranking_options"] = json!({ "score_threshold": threshold });
        }

        let account_id = self.active_account_id().await?;
        let response = self
            .cloudflare
            .post(
                &format!("/accounts/{account_id}/autorag/rags/{rag_id}/{endpoint}"),
                &body,
            )
            .await?;
        Ok(response.result)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::App;
    use crate::tests::{MockCloudflare, call_tool, test_server_for};

    #[tokio::test]
    async fn ai_search_posts_query_and_ranking_options() {
        let mock = MockCloudflare::start(|_, _, _| {
            json!({
                "success": true,
                "errors": [],
                "result": { "response": "42", "data": [{ "filename": "guide.md", "score": 0.8 }] }
            })
        })
        .await;
        let server = test_server_for(&mock.url, Some("acc-1"), App::Autorag);

        let res = call_tool(
            &server,
            "ai_search",
            json!({ "rag_id": "docs", "query": " answer? ", "score_threshold": 0.5 }),
        )
        .await;
        assert_eq!(res["structuredContent"]["data"]["response"], "42");

        let request = &mock.requests()[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "/accounts/acc-1/autorag/rags/docs/ai-search");
        assert_eq!(request.body["query"], "answer?");
        assert_eq!(request.body["ranking_options"]["score_threshold"], 0.5);
        assert!(request.body.get("rewrite_query").is_none());
    }

    #[tokio::test]
    async fn score_threshold_must_be_a_fraction() {
        let server = test_server_for("http://127.0.0.1:9", Some("acc-1"), App::Autorag);
        let res = call_tool(
            &server,
            "search",
            json!({ "rag_id": "docs", "query": "q", "score_threshold": 3 }),
        )
        .await;
        assert_eq!(res["structuredContent"]["error"]["field"], "score_threshold");
    }
}
