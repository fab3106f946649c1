use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use clap::{Args, Subcommand};
use cloudflare_mcp_core::error::codes;
use cloudflare_mcp_core::metrics::{
    AnalyticsSink, LogSink, MetricsTracker, ServerInfo, SessionStart, ToolCall,
};
use cloudflare_mcp_core::storage::{
    FileStorageProvider, MemoryStorageProvider, StorageProvider, default_state_dir,
};
use cloudflare_mcp_core::{DeferredTasks, KvError, UserDetails};
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

mod apps;
mod cloudflare;
mod util;

pub use apps::App;
pub use cloudflare::DEFAULT_API_URL;

use cloudflare::CloudflareClient;
use util::{is_path_segment, to_pretty_json, user_id_for_token};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const LOCAL_USER_ID: &str = "local";

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the MCP server over stdio
    Serve(McpServeArgs),
    /// Print the tool surface of the selected app as JSON
    Tools,
}

#[derive(Args, Clone, Debug)]
pub struct McpServeArgs {
    /// User identity for persisted account selection (defaults to a fingerprint of the API token)
    #[arg(long, env = "CLOUDFLARE_MCP_USER_ID")]
    pub user_id: Option<String>,
    /// Directory holding persisted per-user state
    #[arg(long, env = "CLOUDFLARE_MCP_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
    /// Keep per-user state in memory only
    #[arg(long)]
    pub ephemeral: bool,
}

#[derive(Clone, Debug)]
pub struct McpRuntimeConfig {
    pub app: App,
    pub api_url: String,
    pub token: Option<String>,
    /// Used when the user has not selected an account (account-scoped tokens).
    pub default_account_id: Option<String>,
}

impl McpRuntimeConfig {
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::new(self.app.server_name(), env!("CARGO_PKG_VERSION"))
    }
}

/// Everything the runtime needs from its host, passed in explicitly.
#[derive(Clone)]
pub struct RuntimeServices {
    pub storage: Arc<dyn StorageProvider>,
    pub sink: Arc<dyn AnalyticsSink>,
}

impl RuntimeServices {
    pub fn in_memory() -> Self {
        Self {
            storage: Arc::new(MemoryStorageProvider::new()),
            sink: Arc::new(LogSink),
        }
    }
}

pub async fn run(config: McpRuntimeConfig, command: McpCommands) -> i32 {
    match command {
        McpCommands::Serve(args) => {
            let storage: Arc<dyn StorageProvider> = if args.ephemeral {
                Arc::new(MemoryStorageProvider::new())
            } else {
                Arc::new(FileStorageProvider::new(
                    args.state_dir.unwrap_or_else(default_state_dir),
                ))
            };
            let user_id = args
                .user_id
                .or_else(|| config.token.as_deref().map(user_id_for_token))
                .unwrap_or_else(|| LOCAL_USER_ID.to_string());

            let server = McpServer::new(
                config,
                RuntimeServices {
                    storage,
                    sink: Arc::new(LogSink),
                },
            );
            if let Err(err) = server.bind_user(&user_id) {
                eprintln!("{}", to_pretty_json(&err.to_value()));
                return 1;
            }
            tracing::info!(
                server = server.config.app.server_name(),
                version = env!("CARGO_PKG_VERSION"),
                "MCP server listening on stdio"
            );

            let reader = BufReader::new(io::stdin());
            let mut stdout = io::stdout();
            match server.serve(reader, &mut stdout).await {
                Ok(()) => 0,
                Err(err) => {
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err,
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    1
                }
            }
        }
        McpCommands::Tools => {
            let server = McpServer::new(config, RuntimeServices::in_memory());
            println!("{}", to_pretty_json(&server.tools_list_payload()));
            0
        }
    }
}

/// Handle one HTTP-delivered JSON-RPC payload for `user_id`. Deferred writes
/// are settled before the reply is returned. `None` means nothing to answer
/// (notifications only); a batch is always answered with an array.
pub async fn handle_http_jsonrpc(
    config: McpRuntimeConfig,
    services: RuntimeServices,
    user_id: &str,
    incoming: Value,
) -> Option<Value> {
    let server = McpServer::new(config, services);
    if let Err(err) = server.bind_user(user_id) {
        tracing::error!(error = %err.message, "failed to bind MCP user");
    }
    let batch = is_batch(&incoming);
    let responses = server.handle_incoming_message(incoming).await;
    server.finish().await;
    reply_payload(batch, responses)
}

pub fn user_id_for_bearer_token(token: &str) -> String {
    user_id_for_token(token)
}

struct McpServer {
    config: McpRuntimeConfig,
    cloudflare: CloudflareClient,
    storage: Arc<dyn StorageProvider>,
    metrics: MetricsTracker,
    deferred: DeferredTasks,
    session_id: String,
    user: OnceLock<UserDetails>,
    last_account_id: Mutex<Option<String>>,
}

#[derive(Debug)]
enum ToolOutput {
    Json(Value),
    Image {
        data: String,
        mime_type: String,
        meta: Value,
    },
}

impl McpServer {
    fn new(config: McpRuntimeConfig, services: RuntimeServices) -> Self {
        let metrics = MetricsTracker::new(services.sink, config.server_info());
        Self {
            cloudflare: CloudflareClient::new(&config.api_url, config.token.clone()),
            config,
            storage: services.storage,
            metrics,
            deferred: DeferredTasks::new(),
            session_id: format!("session-{}", Uuid::now_v7()),
            user: OnceLock::new(),
            last_account_id: Mutex::new(None),
        }
    }

    /// Second phase of construction: attach the user whose state this server
    /// reads and writes. May be called once.
    fn bind_user(&self, user_id: &str) -> Result<(), ToolError> {
        let details = UserDetails::open(self.storage.as_ref(), user_id, self.deferred.clone());
        self.user.set(details).map_err(|_| {
            ToolError::new(
                "server_already_initialized",
                "A user is already bound to this MCP server",
            )
        })
    }

    fn user_details(&self) -> Result<&UserDetails, ToolError> {
        self.user.get().ok_or_else(|| {
            ToolError::new(
                "server_not_initialized",
                "MCP server has no bound user; per-user state is unavailable",
            )
            .with_docs_hint("Bind a user identity before dispatching tool calls.")
        })
    }

    /// Resolve the account tools operate on: the user's selection first,
    /// then the configured default.
    async fn active_account_id(&self) -> Result<String, ToolError> {
        let stored = self
            .user_details()?
            .active_account_id()
            .await
            .map_err(state_error)?;
        let account_id = stored
            .or_else(|| self.config.default_account_id.clone())
            .ok_or_else(|| {
                ToolError::new("no_active_account", "No active account selected")
                    .with_docs_hint(
                        "Call accounts_list, then set_active_account with one of the returned ids.",
                    )
            })?;
        // Values stored before ids were validated, or a bad configured default.
        if !is_path_segment(&account_id) {
            return Err(ToolError::new(
                codes::VALIDATION_FAILED,
                "The active account id is not a valid Cloudflare account id",
            )
            .with_field("active_account_id")
            .with_docs_hint("Call set_active_account with an id returned by accounts_list."));
        }
        *self
            .last_account_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(account_id.clone());
        Ok(account_id)
    }

    async fn finish(&self) -> usize {
        self.deferred.settle().await
    }

    async fn serve<R, W>(&self, mut reader: R, writer: &mut W) -> Result<(), String>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let incoming = read_message(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let (reply, framing) = match incoming {
                Incoming::Message(value, framing) => {
                    let batch = is_batch(&value);
                    let responses = self.handle_incoming_message(value).await;
                    (reply_payload(batch, responses), framing)
                }
                Incoming::Malformed(message, framing) => (
                    Some(error_response(Value::Null, RpcError::parse_error(message))),
                    framing,
                ),
            };
            self.finish().await;

            if let Some(reply) = reply {
                write_message(writer, &reply, framing)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        self.finish().await;
        Ok(())
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // A client response; this server never issues requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            tracing::debug!(method, "ignoring MCP notification");
            None
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.handle_initialize(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn handle_initialize(&self, params: &Value) -> Value {
        let client_info = params.get("clientInfo");
        let client_field = |field: &str| {
            client_info
                .and_then(|info| info.get(field))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        self.metrics.track(&SessionStart {
            client_name: client_field("name"),
            client_version: client_field("version"),
            user_id: self.user.get().map(|user| user.user_id().to_string()),
        });
        tracing::info!(
            session_id = %self.session_id,
            client = ?client_field("name"),
            "MCP session initialized"
        );
        self.initialize_payload()
    }

    fn initialize_payload(&self) -> Value {
        let server = self.config.server_info();
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": server.name,
                "version": server.version
            },
            "instructions": self.config.app.instructions()
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = self
            .config
            .app
            .tool_definitions()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let started = Instant::now();
        let result = self.dispatch_tool(name, &args).await;
        self.track_tool_call(name, result.is_ok(), started);

        Ok(match result {
            Ok(ToolOutput::Json(payload)) => build_tool_call_response(
                json!({
                    "status": "ok",
                    "tool": name,
                    "data": payload
                }),
                false,
            ),
            Ok(ToolOutput::Image {
                data,
                mime_type,
                meta,
            }) => json!({
                "content": [{ "type": "image", "data": data, "mimeType": mime_type }],
                "structuredContent": {
                    "status": "ok",
                    "tool": name,
                    "data": meta
                }
            }),
            Err(err) => {
                tracing::warn!(tool = name, error = %err.code, message = %err.message, "tool call failed");
                build_tool_call_response(
                    json!({
                        "status": "error",
                        "tool": name,
                        "error": err.to_value()
                    }),
                    true,
                )
            }
        })
    }

    fn track_tool_call(&self, name: &str, ok: bool, started: Instant) {
        let account_id = self
            .last_account_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.metrics.track(&ToolCall {
            tool_name: name.to_string(),
            user_id: self.user.get().map(|user| user.user_id().to_string()),
            account_id,
            status: if ok { "ok" } else { "error" },
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        });
    }
}

fn state_error(err: KvError) -> ToolError {
    let code = match &err {
        KvError::UnknownKey(_) => codes::INTERNAL_ERROR,
        KvError::Validation { .. } | KvError::Decode { .. } => codes::STATE_CORRUPTED,
        KvError::Storage(_) => codes::STATE_UNAVAILABLE,
    };
    tracing::error!(error = %err, "user state access failed");
    ToolError::new(code, err.to_string())
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
            data: None,
        }
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
    docs_hint: Option<String>,
    details: Option<Value>,
}

impl ToolError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    // Agents mostly read the text block, so it carries the whole envelope.
    let text = to_pretty_json(&envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    /// `Content-Length` headers followed by the JSON body.
    ContentLength,
    /// One JSON document per line.
    LineDelimited,
}

#[derive(Debug)]
enum Incoming {
    Message(Value, Framing),
    Malformed(String, Framing),
}

/// An empty array is answered as a single invalid request, not as a batch.
fn is_batch(incoming: &Value) -> bool {
    incoming.as_array().is_some_and(|batch| !batch.is_empty())
}

fn reply_payload(batch: bool, mut responses: Vec<Value>) -> Option<Value> {
    if responses.is_empty() {
        return None;
    }
    if batch {
        return Some(Value::Array(responses));
    }
    responses.pop()
}

const MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

async fn read_message<R>(reader: &mut R) -> Result<Option<Incoming>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        let trimmed = line.trim();
        if content_length.is_none() && (trimmed.starts_with('{') || trimmed.starts_with('[')) {
            return Ok(Some(match serde_json::from_str(trimmed) {
                Ok(value) => Incoming::Message(value, Framing::LineDelimited),
                Err(e) => Incoming::Malformed(format!("Parse error: {e}"), Framing::LineDelimited),
            }));
        }

        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        if trimmed.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = trimmed
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            if parsed > MAX_CONTENT_LENGTH {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Content-Length {parsed} exceeds {MAX_CONTENT_LENGTH} bytes"),
                ));
            }
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.unwrap_or_default();
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    Ok(Some(match serde_json::from_slice(&payload) {
        Ok(value) => Incoming::Message(value, Framing::ContentLength),
        Err(e) => Incoming::Malformed(format!("Parse error: {e}"), Framing::ContentLength),
    }))
}

async fn write_message<W>(writer: &mut W, value: &Value, framing: Framing) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    match framing {
        Framing::ContentLength => {
            let header = format!(
                "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                body.len()
            );
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
        }
        Framing::LineDelimited => {
            writer.write_all(&body).await?;
            writer.write_all(b"\n").await?;
        }
    }
    writer.flush().await?;
    Ok(())
}
