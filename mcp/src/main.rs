use clap::Parser;

use cloudflare_mcp_runtime::{App, DEFAULT_API_URL, McpCommands, McpRuntimeConfig, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "cloudflare-mcp",
    version,
    about = "Cloudflare MCP servers over stdio, one app per process"
)]
struct Cli {
    /// Which app's tool surface to serve
    #[arg(long, value_enum, env = "CLOUDFLARE_MCP_APP")]
    app: App,

    /// Cloudflare API base URL
    #[arg(long, env = "CLOUDFLARE_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Cloudflare API token
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Account used until one is selected with set_active_account
    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    account_id: Option<String>,

    #[command(subcommand)]
    command: McpCommands,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudflare_mcp_runtime=info,cloudflare_mcp_core=info,analytics=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = McpRuntimeConfig {
        app: cli.app,
        api_url: cli.api_url,
        token: cli.token.filter(|token| !token.trim().is_empty()),
        default_account_id: cli.account_id.filter(|id| !id.trim().is_empty()),
    };

    let code = run_mcp(config, cli.command).await;
    std::process::exit(code);
}
