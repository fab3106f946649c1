//! Per-app tool surfaces. Every app carries the account tools plus its own.

use clap::ValueEnum;
use serde_json::{Map, Value};

use crate::{McpServer, ToolDefinition, ToolError, ToolOutput};

mod accounts;
mod ai_gateway;
mod auditlogs;
mod autorag;
mod browser;
mod dns_analytics;
mod observability;
mod workers_builds;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum App {
    WorkersBuilds,
    Auditlogs,
    DnsAnalytics,
    AiGateway,
    Autorag,
    Browser,
    Observability,
}

impl App {
    pub const ALL: [App; 7] = [
        App::WorkersBuilds,
        App::Auditlogs,
        App::DnsAnalytics,
        App::AiGateway,
        App::Autorag,
        App::Browser,
        App::Observability,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            App::WorkersBuilds => "workers-builds",
            App::Auditlogs => "auditlogs",
            App::DnsAnalytics => "dns-analytics",
            App::AiGateway => "ai-gateway",
            App::Autorag => "autorag",
            App::Browser => "browser",
            App::Observability => "observability",
        }
    }

    pub fn from_slug(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|app| app.slug() == raw)
    }

    pub fn server_name(self) -> &'static str {
        match self {
            App::WorkersBuilds => "cloudflare-workers-builds",
            App::Auditlogs => "cloudflare-auditlogs",
            App::DnsAnalytics => "cloudflare-dns-analytics",
            App::AiGateway => "cloudflare-ai-gateway",
            App::Autorag => "cloudflare-autorag",
            App::Browser => "cloudflare-browser",
            App::Observability => "cloudflare-observability",
        }
    }

    pub(crate) fn instructions(self) -> &'static str {
        match self {
            App::WorkersBuilds => {
                "Inspect Workers Builds: list builds for a Worker, read build details and logs, \
                 and wait for a running build to finish. Select an account with set_active_account first."
            }
            App::Auditlogs => {
                "Query the Cloudflare audit log of the active account for a time window, \
                 optionally filtered by actor, action, resource or zone."
            }
            App::DnsAnalytics => {
                "Report DNS query analytics per zone and show account or zone DNS settings. \
                 Use zones_list to find zone ids."
            }
            App::AiGateway => {
                "List AI Gateways and their request logs, and fetch the request or response body of a single log entry."
            }
            App::Autorag => {
                "List AutoRAG instances, search their indexed documents, or run an AI search that answers from them."
            }
            App::Browser => {
                "Render a public web page with Browser Rendering and return its HTML, Markdown or a PNG screenshot."
            }
            App::Observability => {
                "Query Workers Observability telemetry: run queries over events, and discover available keys and values."
            }
        }
    }

    pub(crate) fn tool_definitions(self) -> Vec<ToolDefinition> {
        let mut tools = accounts::definitions();
        tools.extend(match self {
            App::WorkersBuilds => workers_builds::definitions(),
            App::Auditlogs => auditlogs::definitions(),
            App::DnsAnalytics => dns_analytics::definitions(),
            App::AiGateway => ai_gateway::definitions(),
            App::Autorag => autorag::definitions(),
            App::Browser => browser::definitions(),
            App::Observability => observability::definitions(),
        });
        tools
    }

    pub(crate) fn has_tool(self, name: &str) -> bool {
        self.tool_definitions().iter().any(|tool| tool.name == name)
    }
}

impl std::fmt::Display for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

impl McpServer {
    pub(crate) async fn dispatch_tool(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        if !self.config.app.has_tool(name) {
            return Err(ToolError::new(
                "unknown_tool",
                format!("Unknown tool '{name}' for {}", self.config.app.server_name()),
            )
            .with_field("name")
            .with_docs_hint("Call tools/list for the tools this server provides."));
        }

        let output = match name {
            "accounts_list" => self.tool_accounts_list(args).await?,
            "set_active_account" => self.tool_set_active_account(args).await?,
            "get_active_account" => self.tool_get_active_account().await?,

            "workers_builds_list_builds" => self.tool_workers_builds_list_builds(args).await?,
            "workers_builds_get_build" => self.tool_workers_builds_get_build(args).await?,
            "workers_builds_get_build_logs" => self.tool_workers_builds_get_build_logs(args).await?,
            "workers_builds_wait_for_build" => self.tool_workers_builds_wait_for_build(args).await?,

            "auditlogs_by_account_id" => self.tool_auditlogs_by_account_id(args).await?,

            "zones_list" => self.tool_zones_list(args).await?,
            "dns_report" => self.tool_dns_report(args).await?,
            "show_account_dns_settings" => self.tool_show_account_dns_settings().await?,
            "show_zone_dns_settings" => self.tool_show_zone_dns_settings(args).await?,

            "list_gateways" => self.tool_list_gateways(args).await?,
            "list_logs" => self.tool_list_logs(args).await?,
            "get_log_details" => self.tool_get_log_details(args).await?,
            "get_log_request_body" => self.tool_get_log_body(args, "request").await?,
            "get_log_response_body" => self.tool_get_log_body(args, "response").await?,

            "list_rags" => self.tool_list_rags(args).await?,
            "search" => self.tool_autorag_search(args, "search").await?,
            "ai_search" => self.tool_autorag_search(args, "ai-search").await?,

            "get_url_html_content" => self.tool_browser_render(args, "content").await?,
            "get_url_markdown" => self.tool_browser_render(args, "markdown").await?,
            "get_url_screenshot" => return self.tool_get_url_screenshot(args).await,

            "query_worker_observability" => self.tool_query_worker_observability(args).await?,
            "observability_keys" => self.tool_observability_keys(args).await?,
            "observability_values" => self.tool_observability_values(args).await?,

            _ => {
                return Err(ToolError::new(
                    "unknown_tool",
                    format!("Tool '{name}' is registered but has no handler"),
                ));
            }
        };
        Ok(ToolOutput::Json(output))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn slugs_round_trip() {
        for app in App::ALL {
            assert_eq!(App::from_slug(app.slug()), Some(app));
            assert!(app.server_name().ends_with(app.slug()));
        }
        assert_eq!(App::from_slug("radar"), None);
    }

    #[test]
    fn every_app_exposes_account_tools_and_unique_names() {
        for app in App::ALL {
            let names: Vec<&str> = app.tool_definitions().iter().map(|t| t.name).collect();
            let unique: HashSet<&str> = names.iter().copied().collect();
            assert_eq!(names.len(), unique.len(), "duplicate tool in {app}");
            for shared in ["accounts_list", "set_active_account", "get_active_account"] {
                assert!(app.has_tool(shared), "{app} misses {shared}");
            }
        }
    }

    #[test]
    fn tools_are_not_shared_across_apps() {
        assert!(App::WorkersBuilds.has_tool("workers_builds_wait_for_build"));
        assert!(!App::Browser.has_tool("workers_builds_wait_for_build"));
        assert!(App::Browser.has_tool("get_url_screenshot"));
        assert!(!App::Autorag.has_tool("get_url_screenshot"));
    }

    #[test]
    fn input_schemas_are_objects() {
        for app in App::ALL {
            for tool in app.tool_definitions() {
                assert_eq!(
                    tool.input_schema["type"], "object",
                    "{} schema must be an object",
                    tool.name
                );
            }
        }
    }
}
