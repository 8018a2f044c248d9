//! The proxy's own MCP surface: a `ServerHandler` exposing the built-in
//! management meta-tools plus every upstream tool under its qualified
//! `server:tool` name.

use std::{borrow::Cow, sync::Arc};

use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
    PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, Tool, ToolsCapability,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as RmcpError, RoleServer, ServerHandler};
use serde_json::{json, Map, Value};

use chrono::Utc;

use crate::catalogue::{QualifiedToolName, SearchIndex, ToolInventory};
use crate::config::{ConfigEvent, ConfigStore, IsolationConfig, OAuthConfig, ServerDescriptor, TransportKind};
use crate::dataflow::DataFlowEngine;
use crate::error::McpError;
use crate::router::{DispatchOutcome, DispatchRequest, ExecutionType, Intent, Router};
use crate::session::SessionStore;
use crate::supervisor::Supervisor;
use crate::tenant::SessionId;
use crate::truncate::Truncator;

fn rmcp_err(e: McpError) -> RmcpError {
    match e {
        McpError::InvalidRequest(m) => RmcpError::invalid_params(m, None),
        McpError::NotFound(m) | McpError::ServerNotFound(m) => RmcpError::invalid_params(m, None),
        other => RmcpError::internal_error(other.to_string(), None),
    }
}

fn text_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text.into())])
}

fn json_result(value: &Value) -> CallToolResult {
    text_result(serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()))
}

fn schema(properties: Value, required: &[&str]) -> Arc<Map<String, Value>> {
    let obj = json!({
        "type": "object",
        "properties": properties,
        "required": required,
    });
    match obj {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(Map::new()),
    }
}

const META_TOOLS: &[&str] = &[
    "retrieve_tools",
    "call_tool_read",
    "call_tool_write",
    "call_tool_destructive",
    "upstream_servers",
    "quarantine_security",
    "read_cache",
    "list_registries",
    "search_servers",
];

fn meta_tool_definitions() -> Vec<Tool> {
    vec![
        Tool {
            name: Cow::Borrowed("retrieve_tools"),
            title: Some("Retrieve tools".into()),
            description: Some(Cow::Borrowed(
                "Search the live tool catalogue by keyword (BM25-ranked) and return matching tool descriptors.",
            )),
            input_schema: schema(
                json!({
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 100},
                }),
                &["query"],
            ),
            output_schema: None,
            annotations: None,
            icons: None,
        },
        Tool {
            name: Cow::Borrowed("call_tool_read"),
            title: Some("Call tool (read)".into()),
            description: Some(Cow::Borrowed(
                "Invoke a qualified upstream tool ('server:tool') declared as a read-only operation.",
            )),
            input_schema: schema(
                json!({
                    "name": {"type": "string"},
                    "arguments": {"type": "object"},
                }),
                &["name"],
            ),
            output_schema: None,
            annotations: None,
            icons: None,
        },
        Tool {
            name: Cow::Borrowed("call_tool_write"),
            title: Some("Call tool (write)".into()),
            description: Some(Cow::Borrowed(
                "Invoke a qualified upstream tool ('server:tool') declared as a state-mutating operation.",
            )),
            input_schema: schema(
                json!({
                    "name": {"type": "string"},
                    "arguments": {"type": "object"},
                }),
                &["name"],
            ),
            output_schema: None,
            annotations: None,
            icons: None,
        },
        Tool {
            name: Cow::Borrowed("call_tool_destructive"),
            title: Some("Call tool (destructive)".into()),
            description: Some(Cow::Borrowed(
                "Invoke a qualified upstream tool ('server:tool') declared as a destructive operation.",
            )),
            input_schema: schema(
                json!({
                    "name": {"type": "string"},
                    "arguments": {"type": "object"},
                }),
                &["name"],
            ),
            output_schema: None,
            annotations: None,
            icons: None,
        },
        Tool {
            name: Cow::Borrowed("upstream_servers"),
            title: Some("Upstream servers".into()),
            description: Some(Cow::Borrowed(
                "List configured upstream servers, their connection state, and tool counts. Also \
                 supports add/remove, full-replacement 'update', and field-merging 'patch' via 'operation'.",
            )),
            input_schema: schema(
                json!({
                    "operation": {"type": "string", "enum": ["list", "add", "update", "patch", "remove"]},
                    "name": {"type": "string"},
                    "protocol": {"type": "string", "enum": ["stdio", "http", "sse", "streamable-http"]},
                    "command": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "env": {"type": "object"},
                    "working_dir": {"type": "string"},
                    "url": {"type": "string"},
                    "headers": {"type": "object"},
                    "enabled": {"type": "boolean"},
                    "class": {"type": "string"},
                    "oauth": {"type": "object"},
                    "isolation": {"type": "object"},
                }),
                &[],
            ),
            output_schema: None,
            annotations: None,
            icons: None,
        },
        Tool {
            name: Cow::Borrowed("quarantine_security"),
            title: Some("Quarantine & security".into()),
            description: Some(Cow::Borrowed(
                "Inspect, quarantine, or release upstream servers under security review.",
            )),
            input_schema: schema(
                json!({
                    "operation": {"type": "string", "enum": ["list_quarantined", "inspect_quarantined", "quarantine", "release"]},
                    "name": {"type": "string"},
                }),
                &["operation"],
            ),
            output_schema: None,
            annotations: None,
            icons: None,
        },
        Tool {
            name: Cow::Borrowed("read_cache"),
            title: Some("Read cache".into()),
            description: Some(Cow::Borrowed(
                "Page through a previously truncated tool response by its cache key.",
            )),
            input_schema: schema(
                json!({
                    "key": {"type": "string"},
                    "offset": {"type": "integer", "minimum": 0},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 1000},
                }),
                &["key"],
            ),
            output_schema: None,
            annotations: None,
            icons: None,
        },
        Tool {
            name: Cow::Borrowed("list_registries"),
            title: Some("List registries".into()),
            description: Some(Cow::Borrowed("List configured upstream registry sources.")),
            input_schema: schema(json!({}), &[]),
            output_schema: None,
            annotations: None,
            icons: None,
        },
        Tool {
            name: Cow::Borrowed("search_servers"),
            title: Some("Search servers".into()),
            description: Some(Cow::Borrowed(
                "Search configured upstream servers by name or class.",
            )),
            input_schema: schema(json!({"query": {"type": "string"}}), &["query"]),
            output_schema: None,
            annotations: None,
            icons: None,
        },
    ]
}

fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn strmap(v: Option<&Value>) -> std::collections::HashMap<String, String> {
    v.and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn strvec(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|e| e.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Builds a fresh descriptor for `upstream_servers(operation="add")`. Timestamps
/// are stamped here rather than trusted from the caller.
fn new_server_from_args(name: String, args: &Map<String, Value>) -> Result<ServerDescriptor, McpError> {
    let protocol = match arg_str(args, "protocol").unwrap_or("stdio") {
        "stdio" => TransportKind::Stdio,
        "http" => TransportKind::Http,
        "sse" => TransportKind::Sse,
        "streamable-http" => TransportKind::StreamableHttp,
        other => return Err(McpError::InvalidRequest(format!("unknown protocol '{other}'"))),
    };
    let oauth = args.get("oauth").and_then(|v| serde_json::from_value::<OAuthConfig>(v.clone()).ok());
    let isolation = args
        .get("isolation")
        .and_then(|v| serde_json::from_value::<IsolationConfig>(v.clone()).ok());
    let now = Utc::now();
    Ok(ServerDescriptor {
        name,
        protocol,
        command: arg_str(args, "command").map(str::to_string),
        args: strvec(args.get("args")),
        env: strmap(args.get("env")),
        working_dir: arg_str(args, "working_dir").map(str::to_string),
        url: arg_str(args, "url").map(str::to_string),
        headers: strmap(args.get("headers")),
        enabled: args.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        quarantined: args.get("quarantined").and_then(Value::as_bool).unwrap_or(false),
        oauth,
        isolation,
        class: arg_str(args, "class").map(str::to_string),
        created_at: now,
        updated_at: now,
    })
}

/// Applies a partial patch to an existing descriptor for `operation="patch"`.
/// `env`/`headers` are deep-merged key by key; everything else is a plain
/// overwrite when present in `args`. Fields absent from `args` — including
/// `isolation`, `oauth`, `command`, `args`, and `enabled` — are left untouched.
fn apply_server_patch(existing: &mut ServerDescriptor, args: &Map<String, Value>) {
    if let Some(command) = arg_str(args, "command") {
        existing.command = Some(command.to_string());
    }
    if let Some(url) = arg_str(args, "url") {
        existing.url = Some(url.to_string());
    }
    if let Some(arr) = args.get("args") {
        existing.args = strvec(Some(arr));
    }
    for (k, v) in strmap(args.get("env")) {
        existing.env.insert(k, v);
    }
    for (k, v) in strmap(args.get("headers")) {
        existing.headers.insert(k, v);
    }
    if let Some(working_dir) = arg_str(args, "working_dir") {
        existing.working_dir = Some(working_dir.to_string());
    }
    if let Some(enabled) = args.get("enabled").and_then(Value::as_bool) {
        existing.enabled = enabled;
    }
    if let Some(class) = arg_str(args, "class") {
        existing.class = Some(class.to_string());
    }
    if let Some(oauth) = args.get("oauth").and_then(|v| serde_json::from_value::<OAuthConfig>(v.clone()).ok()) {
        existing.oauth = Some(oauth);
    }
    if let Some(isolation) = args
        .get("isolation")
        .and_then(|v| serde_json::from_value::<IsolationConfig>(v.clone()).ok())
    {
        existing.isolation = Some(isolation);
    }
}

/// Implements the proxy's own MCP surface. Wraps the router/supervisor/
/// catalogue/session machinery behind `ServerHandler`. Cheap to clone — every
/// field is an `Arc` — so one instance per streamable-HTTP session is fine.
#[derive(Clone)]
pub struct ProxyHandler {
    router: Arc<Router>,
    supervisor: Arc<Supervisor>,
    catalogue: Arc<ToolInventory>,
    config: Arc<ConfigStore>,
    sessions: Arc<SessionStore>,
    dataflow: Arc<DataFlowEngine>,
    truncator: Arc<Truncator>,
}

impl ProxyHandler {
    pub fn new(
        router: Arc<Router>,
        supervisor: Arc<Supervisor>,
        catalogue: Arc<ToolInventory>,
        config: Arc<ConfigStore>,
        sessions: Arc<SessionStore>,
        dataflow: Arc<DataFlowEngine>,
        truncator: Arc<Truncator>,
    ) -> Self {
        Self {
            router,
            supervisor,
            catalogue,
            config,
            sessions,
            dataflow,
            truncator,
        }
    }

    fn session_id(&self, context: &RequestContext<RoleServer>) -> SessionId {
        SessionId::new(context.id.to_string())
    }

    async fn dispatch_qualified(
        &self,
        name_arg: &str,
        arguments: Option<Map<String, Value>>,
        intent: Intent,
        session_id: SessionId,
        request_id: Option<String>,
    ) -> Result<CallToolResult, RmcpError> {
        let qualified = Router::parse_name(name_arg).map_err(rmcp_err)?;
        let client = self.sessions.get(&session_id);
        let outcome = self
            .router
            .dispatch(DispatchRequest {
                qualified_name: qualified,
                args: arguments,
                intent,
                session_id,
                client_name: client.as_ref().map(|r| r.client_name.clone()),
                client_version: client.as_ref().map(|r| r.client_version.clone()),
                request_id,
                execution_type: ExecutionType::Direct,
            })
            .await
            .map_err(rmcp_err)?;

        Ok(match outcome {
            DispatchOutcome::Result(v) => json_result(&v),
            DispatchOutcome::QuarantineBlock { message, tool_description } => {
                let mut text = message;
                if let Some(desc) = tool_description {
                    text.push_str(&format!("\n\n(last known description: {desc})"));
                }
                text_result(text)
            }
            DispatchOutcome::FlowWarning { response, warning } => {
                let mut result = json_result(&response);
                result.content.push(Content::text(format!("warning: {warning}")));
                result
            }
        })
    }

    async fn handle_retrieve_tools(&self, args: &Map<String, Value>) -> CallToolResult {
        let query = arg_str(args, "query").unwrap_or_default();
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
        let index = SearchIndex::build(&self.catalogue);
        let hits = index.search(query, limit);
        let body: Vec<Value> = hits
            .into_iter()
            .filter_map(|hit| {
                self.catalogue
                    .get_tool_qualified(&hit.tool.server_key, &hit.tool.tool_name)
                    .map(|tool| {
                        json!({
                            "name": hit.tool.to_string(),
                            "score": hit.score,
                            "description": tool.description,
                        })
                    })
            })
            .collect();
        json_result(&json!({ "tools": body }))
    }

    fn handle_upstream_servers(&self, args: &Map<String, Value>) -> CallToolResult {
        let operation = arg_str(args, "operation").unwrap_or("list");
        let snapshot = self.config.snapshot();
        match operation {
            "list" => {
                let servers: Vec<Value> = snapshot
                    .servers
                    .iter()
                    .map(|d| {
                        json!({
                            "name": d.name,
                            "protocol": d.protocol,
                            "enabled": d.enabled,
                            "quarantined": d.quarantined,
                            "class": d.class,
                        })
                    })
                    .collect();
                json_result(&json!({ "servers": servers }))
            }
            "add" => {
                if snapshot.features.disable_management {
                    return text_result("management tools are disabled by config");
                }
                if !snapshot.features.allow_server_add {
                    return text_result("adding servers is disabled by config (allow_server_add = false)");
                }
                let Some(name) = arg_str(args, "name").map(str::to_string) else {
                    return text_result("'name' is required for add");
                };
                if snapshot.servers.iter().any(|d| d.name == name) {
                    return text_result(format!("server '{name}' already exists; use operation 'update'"));
                }
                let descriptor = match new_server_from_args(name.clone(), args) {
                    Ok(d) => d,
                    Err(e) => return text_result(e.to_string()),
                };
                if let Err(e) = descriptor.validate() {
                    return text_result(e.to_string());
                }
                match self.config.mutate(ConfigEvent::ServerAdded(name.clone()), |cfg| {
                    cfg.servers.push(descriptor.clone());
                    Ok(())
                }) {
                    Ok(()) => text_result(format!(
                        "added '{name}'; reconciliation will attempt a connection within the next cycle"
                    )),
                    Err(e) => text_result(e.to_string()),
                }
            }
            "update" => {
                if snapshot.features.disable_management {
                    return text_result("management tools are disabled by config");
                }
                let Some(name) = arg_str(args, "name").map(str::to_string) else {
                    return text_result("'name' is required for update");
                };
                if !snapshot.servers.iter().any(|d| d.name == name) {
                    return text_result(format!("no such server '{name}'"));
                }
                let mut replacement = match new_server_from_args(name.clone(), args) {
                    Ok(d) => d,
                    Err(e) => return text_result(e.to_string()),
                };
                if let Err(e) = replacement.validate() {
                    return text_result(e.to_string());
                }
                match self.config.mutate(ConfigEvent::ServerChanged(name.clone()), |cfg| {
                    let existing = cfg
                        .servers
                        .iter_mut()
                        .find(|d| d.name == name)
                        .ok_or_else(|| McpError::ServerNotFound(name.clone()))?;
                    replacement.created_at = existing.created_at;
                    replacement.updated_at = Utc::now();
                    *existing = replacement.clone();
                    Ok(())
                }) {
                    Ok(()) => text_result(format!("replaced '{name}'")),
                    Err(e) => text_result(e.to_string()),
                }
            }
            "patch" => {
                if snapshot.features.disable_management {
                    return text_result("management tools are disabled by config");
                }
                let Some(name) = arg_str(args, "name").map(str::to_string) else {
                    return text_result("'name' is required for patch");
                };
                if !snapshot.servers.iter().any(|d| d.name == name) {
                    return text_result(format!("no such server '{name}'"));
                }
                match self.config.mutate(ConfigEvent::ServerChanged(name.clone()), |cfg| {
                    let existing = cfg
                        .servers
                        .iter_mut()
                        .find(|d| d.name == name)
                        .ok_or_else(|| McpError::ServerNotFound(name.clone()))?;
                    apply_server_patch(existing, args);
                    existing.updated_at = Utc::now();
                    existing.validate()
                }) {
                    Ok(()) => text_result(format!("patched '{name}'")),
                    Err(e) => text_result(e.to_string()),
                }
            }
            "remove" => {
                if snapshot.features.disable_management {
                    return text_result("management tools are disabled by config");
                }
                if !snapshot.features.allow_server_remove {
                    return text_result("removing servers is disabled by config (allow_server_remove = false)");
                }
                let Some(name) = arg_str(args, "name").map(str::to_string) else {
                    return text_result("'name' is required for remove");
                };
                match self.config.mutate(ConfigEvent::ServerRemoved(name.clone()), |cfg| {
                    let before = cfg.servers.len();
                    cfg.servers.retain(|d| d.name != name);
                    if cfg.servers.len() == before {
                        return Err(McpError::ServerNotFound(name.clone()));
                    }
                    Ok(())
                }) {
                    Ok(()) => text_result(format!(
                        "removed '{name}' from desired state; the live connection will be torn down on the next reconciliation pass"
                    )),
                    Err(e) => text_result(e.to_string()),
                }
            }
            other => text_result(format!("unknown operation '{other}'")),
        }
    }

    fn handle_quarantine_security(&self, args: &Map<String, Value>) -> CallToolResult {
        let operation = arg_str(args, "operation").unwrap_or("list_quarantined");
        let name = arg_str(args, "name");
        let snapshot = self.config.snapshot();
        match operation {
            "list_quarantined" => {
                let names: Vec<&str> = snapshot
                    .servers
                    .iter()
                    .filter(|d| d.quarantined)
                    .map(|d| d.name.as_str())
                    .collect();
                json_result(&json!({ "quarantined": names }))
            }
            "inspect_quarantined" => {
                let Some(name) = name else {
                    return text_result("'name' is required for inspect_quarantined");
                };
                match self.supervisor.request_inspection_exemption(name) {
                    Ok(()) => text_result(format!(
                        "granted a temporary inspection exemption for '{name}'; its tools will appear in the catalogue shortly"
                    )),
                    Err(e) => text_result(e.to_string()),
                }
            }
            "quarantine" | "release" => {
                if snapshot.features.disable_management {
                    return text_result("management tools are disabled by config");
                }
                let Some(name) = name.map(str::to_string) else {
                    return text_result("'name' is required");
                };
                let quarantined = operation == "quarantine";
                match self.config.mutate(ConfigEvent::ServerChanged(name.clone()), |cfg| {
                    let existing = cfg
                        .servers
                        .iter_mut()
                        .find(|d| d.name == name)
                        .ok_or_else(|| McpError::ServerNotFound(name.clone()))?;
                    existing.quarantined = quarantined;
                    existing.updated_at = Utc::now();
                    Ok(())
                }) {
                    Ok(()) => {
                        let verb = if quarantined { "quarantined" } else { "released" };
                        text_result(format!("{verb} '{name}'"))
                    }
                    Err(e) => text_result(e.to_string()),
                }
            }
            other => text_result(format!("unknown operation '{other}'")),
        }
    }

    fn handle_read_cache(&self, args: &Map<String, Value>) -> CallToolResult {
        let Some(key) = arg_str(args, "key") else {
            return text_result("'key' is required");
        };
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;
        match self.truncator.read_cache(key, offset, limit) {
            Ok(records) => json_result(&json!({ "records": records })),
            Err(e) => text_result(e.to_string()),
        }
    }

    fn handle_list_registries(&self) -> CallToolResult {
        json_result(&json!({ "registries": [] }))
    }

    fn handle_search_servers(&self, args: &Map<String, Value>) -> CallToolResult {
        let query = arg_str(args, "query").unwrap_or_default().to_lowercase();
        let config = self.config.snapshot();
        let matches: Vec<&str> = config
            .servers
            .iter()
            .filter(|d| {
                d.name.to_lowercase().contains(&query)
                    || d.class.as_deref().unwrap_or_default().to_lowercase().contains(&query)
            })
            .map(|d| d.name.as_str())
            .collect();
        json_result(&json!({ "servers": matches }))
    }
}

impl ServerHandler for ProxyHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: Some(true) }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "mcp-aggregator".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: Some("MCP Aggregating Proxy".into()),
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Federates multiple MCP upstream servers behind one endpoint. Use retrieve_tools \
                 to search the catalogue, then call_tool_read/write/destructive with the \
                 matching intent."
                    .into(),
            ),
        }
    }

    async fn initialize(
        &self,
        request: rmcp::model::InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::InitializeResult, RmcpError> {
        let session_id = self.session_id(&context);
        self.sessions
            .register(session_id, &request.client_info.name, &request.client_info.version);
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, RmcpError> {
        let mut tools = meta_tool_definitions();
        let config = self.config.snapshot();
        for (qualified, tool) in self.catalogue.list_tools_qualified() {
            if config
                .get_server(&qualified.server_key)
                .map(|d| d.quarantined)
                .unwrap_or(false)
                && !self.supervisor.has_inspection_exemption(&qualified.server_key)
            {
                continue;
            }
            let mut renamed = tool;
            renamed.name = Cow::Owned(qualified.to_string());
            tools.push(renamed);
        }
        Ok(ListToolsResult { tools, next_cursor: None })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, RmcpError> {
        let name = request.name.to_string();
        let args = request.arguments.clone();
        let session_id = self.session_id(&context);
        self.sessions.touch(&session_id);

        match name.as_str() {
            "retrieve_tools" => Ok(self
                .handle_retrieve_tools(args.as_ref().unwrap_or(&Map::new()))
                .await),
            "upstream_servers" => Ok(self.handle_upstream_servers(args.as_ref().unwrap_or(&Map::new()))),
            "quarantine_security" => {
                Ok(self.handle_quarantine_security(args.as_ref().unwrap_or(&Map::new())))
            }
            "read_cache" => Ok(self.handle_read_cache(args.as_ref().unwrap_or(&Map::new()))),
            "list_registries" => Ok(self.handle_list_registries()),
            "search_servers" => Ok(self.handle_search_servers(args.as_ref().unwrap_or(&Map::new()))),
            "call_tool_read" | "call_tool_write" | "call_tool_destructive" => {
                let args = args.unwrap_or_default();
                let Some(target) = arg_str(&args, "name") else {
                    return Err(RmcpError::invalid_params("'name' is required", None));
                };
                let intent = match name.as_str() {
                    "call_tool_read" => Intent::Read,
                    "call_tool_write" => Intent::Write,
                    _ => Intent::Destructive,
                };
                let forwarded_args = args
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned();
                self.dispatch_qualified(target, forwarded_args, intent, session_id, None)
                    .await
            }
            qualified if QualifiedToolName::parse(qualified).is_some() => {
                self.dispatch_qualified(qualified, args, Intent::Read, session_id, None)
                    .await
            }
            other => Err(RmcpError::invalid_params(format!("unknown tool '{other}'"), None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::Store;
    use tempfile::tempdir;

    #[test]
    fn test_meta_tool_definitions_cover_all_names() {
        let names: Vec<String> = meta_tool_definitions().into_iter().map(|t| t.name.to_string()).collect();
        for expected in META_TOOLS {
            assert!(names.contains(&expected.to_string()), "missing meta tool {expected}");
        }
    }

    #[test]
    fn test_arg_str_extracts_string() {
        let mut map = Map::new();
        map.insert("query".to_string(), Value::String("hello".to_string()));
        assert_eq!(arg_str(&map, "query"), Some("hello"));
        assert_eq!(arg_str(&map, "missing"), None);
    }

    fn test_handler() -> ProxyHandler {
        let dir = tempdir().unwrap();
        let mut cfg = crate::config::McpConfig::default();
        cfg.data_dir = dir.path().to_path_buf();
        let config = ConfigStore::new(cfg, None);

        let catalogue = Arc::new(ToolInventory::new());
        let events = EventBus::new();
        let store = Store::open(dir.path()).unwrap();
        let dataflow = Arc::new(DataFlowEngine::new(Default::default(), Vec::new(), Vec::new()));
        let truncator = Arc::new(Truncator::new(Arc::clone(&store), 4096));
        let supervisor = Supervisor::new(Arc::clone(&config), Arc::clone(&catalogue), events.clone(), Some(Arc::clone(&store)));
        let sessions = Arc::new(SessionStore::new());
        let router = Arc::new(Router::new(
            Arc::clone(&supervisor),
            Arc::clone(&catalogue),
            Arc::clone(&dataflow),
            Arc::clone(&truncator),
            Arc::clone(&config),
            events,
            store,
        ));

        ProxyHandler::new(router, supervisor, catalogue, config, sessions, dataflow, truncator)
    }

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_upstream_servers_add_then_list() {
        let handler = test_handler();
        let added = handler.handle_upstream_servers(&args(&[
            ("operation", json!("add")),
            ("name", json!("brave")),
            ("protocol", json!("streamable-http")),
            ("url", json!("http://127.0.0.1:9000")),
        ]));
        assert!(added.content.iter().any(|c| c.as_text().map(|t| t.text.contains("added")).unwrap_or(false)));

        let listed = handler.handle_upstream_servers(&args(&[("operation", json!("list"))]));
        let text = listed.content[0].as_text().unwrap().text.clone();
        assert!(text.contains("brave"));
    }

    #[test]
    fn test_upstream_servers_add_rejects_duplicate() {
        let handler = test_handler();
        let add = || {
            handler.handle_upstream_servers(&args(&[
                ("operation", json!("add")),
                ("name", json!("brave")),
                ("protocol", json!("streamable-http")),
                ("url", json!("http://127.0.0.1:9000")),
            ]))
        };
        add();
        let second = add();
        let text = second.content[0].as_text().unwrap().text.clone();
        assert!(text.contains("already exists"));
    }

    #[test]
    fn test_upstream_servers_remove_missing_reports_not_found() {
        let handler = test_handler();
        let result = handler.handle_upstream_servers(&args(&[
            ("operation", json!("remove")),
            ("name", json!("ghost")),
        ]));
        let text = result.content[0].as_text().unwrap().text.clone();
        assert!(text.contains("server not found") || text.contains("not found"));
    }

    #[test]
    fn test_upstream_servers_patch_leaves_other_fields_untouched() {
        let handler = test_handler();
        handler.handle_upstream_servers(&args(&[
            ("operation", json!("add")),
            ("name", json!("brave")),
            ("protocol", json!("streamable-http")),
            ("url", json!("http://127.0.0.1:9000")),
            ("headers", json!({"x-api-key": "secret"})),
            ("enabled", json!(true)),
        ]));

        let patched = handler.handle_upstream_servers(&args(&[
            ("operation", json!("patch")),
            ("name", json!("brave")),
            ("enabled", json!(false)),
        ]));
        assert!(patched.content[0].as_text().unwrap().text.contains("patched"));

        let snapshot = handler.config.snapshot();
        let server = snapshot.servers.iter().find(|d| d.name == "brave").unwrap();
        assert!(!server.enabled);
        assert_eq!(server.url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(server.headers.get("x-api-key").map(String::as_str), Some("secret"));
    }

    #[test]
    fn test_upstream_servers_update_replaces_full_descriptor() {
        let handler = test_handler();
        handler.handle_upstream_servers(&args(&[
            ("operation", json!("add")),
            ("name", json!("brave")),
            ("protocol", json!("streamable-http")),
            ("url", json!("http://127.0.0.1:9000")),
            ("headers", json!({"x-api-key": "secret"})),
        ]));

        let updated = handler.handle_upstream_servers(&args(&[
            ("operation", json!("update")),
            ("name", json!("brave")),
            ("protocol", json!("streamable-http")),
            ("url", json!("http://127.0.0.1:9001")),
        ]));
        assert!(updated.content[0].as_text().unwrap().text.contains("replaced"));

        let snapshot = handler.config.snapshot();
        let server = snapshot.servers.iter().find(|d| d.name == "brave").unwrap();
        assert_eq!(server.url.as_deref(), Some("http://127.0.0.1:9001"));
        // full replacement: the headers set on `add` were not carried over.
        assert!(server.headers.is_empty());
    }

    #[test]
    fn test_quarantine_then_release_round_trips() {
        let handler = test_handler();
        handler.handle_upstream_servers(&args(&[
            ("operation", json!("add")),
            ("name", json!("brave")),
            ("protocol", json!("streamable-http")),
            ("url", json!("http://127.0.0.1:9000")),
        ]));

        let quarantined = handler.handle_quarantine_security(&args(&[
            ("operation", json!("quarantine")),
            ("name", json!("brave")),
        ]));
        assert!(quarantined.content[0].as_text().unwrap().text.contains("quarantined"));

        let listed = handler.handle_quarantine_security(&args(&[("operation", json!("list_quarantined"))]));
        assert!(listed.content[0].as_text().unwrap().text.contains("brave"));

        let released = handler.handle_quarantine_security(&args(&[
            ("operation", json!("release")),
            ("name", json!("brave")),
        ]));
        assert!(released.content[0].as_text().unwrap().text.contains("released"));
    }

    #[test]
    fn test_upstream_servers_add_disabled_by_flag() {
        let handler = test_handler();
        handler
            .config
            .mutate(crate::config::ConfigEvent::Reloaded, |cfg| {
                cfg.features.allow_server_add = false;
                Ok(())
            })
            .unwrap();
        let result = handler.handle_upstream_servers(&args(&[
            ("operation", json!("add")),
            ("name", json!("brave")),
            ("protocol", json!("streamable-http")),
            ("url", json!("http://127.0.0.1:9000")),
        ]));
        let text = result.content[0].as_text().unwrap().text.clone();
        assert!(text.contains("disabled"));
    }
}
