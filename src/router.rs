//! Request router (C4): the dispatch path for every `call_tool_*`
//! invocation arriving on the proxy's MCP surface.

use std::{sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalogue::{QualifiedToolName, ToolInventory};
use crate::config::ConfigStore;
use crate::dataflow::{DataFlowEngine, FlowDecision};
use crate::error::{McpError, McpResult};
use crate::events::{EventBus, ProxyEvent};
use crate::store::{Store, BUCKET_TOOL_CALLS};
use crate::supervisor::Supervisor;
use crate::tenant::SessionId;
use crate::truncate::Truncator;

/// The caller's declared operation class. The variant used (read / write /
/// destructive) always wins over any client-supplied `operation_type` —
/// §4.4's intent-declaration rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Read,
    Write,
    Destructive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Direct,
    Orchestrated,
    Replayed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub duration_ns: u128,
    pub timestamp_unix_ns: u128,
    pub session_id: String,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub request_id: Option<String>,
    pub operation_type: Intent,
    pub token_metrics: TokenMetrics,
    pub execution_type: ExecutionType,
}

/// Per-call context the handler assembles before invoking the router.
pub struct DispatchRequest {
    pub qualified_name: QualifiedToolName,
    pub args: Option<Map<String, Value>>,
    pub intent: Intent,
    pub session_id: SessionId,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub request_id: Option<String>,
    pub execution_type: ExecutionType,
}

/// Either a dispatched result or a non-error "block" result (quarantine),
/// matching §4.4 step 2's "produce a security-block result, not an error".
pub enum DispatchOutcome {
    Result(Value),
    QuarantineBlock { message: String, tool_description: Option<String> },
    FlowWarning { response: Value, warning: String },
}

fn troubleshooting_advice(status: u16, body: &str) -> String {
    let lower = body.to_lowercase();
    if lower.contains("api key") {
        return "Check that the upstream API key is valid and not expired.".to_string();
    }
    if lower.contains("timeout") {
        return "The upstream took too long to respond; it may be overloaded or unreachable.".to_string();
    }
    if lower.contains("connection") {
        return "Could not reach the upstream; verify it is running and network-accessible.".to_string();
    }
    match status {
        400 => "The request was malformed; check argument names and types.".to_string(),
        401 => "Authentication failed; the upstream rejected the credentials.".to_string(),
        403 => "The upstream refused the request (forbidden).".to_string(),
        404 => "The upstream reports this resource does not exist.".to_string(),
        429 => "Rate limited by the upstream; retry after a backoff.".to_string(),
        500 => "The upstream reported an internal error.".to_string(),
        502 | 503 | 504 => "The upstream is temporarily unavailable.".to_string(),
        _ => "Unclassified upstream error.".to_string(),
    }
}

fn next_call_id(tool_name: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos}-{tool_name}")
}

/// Ties together the supervisor, catalogue, data-flow engine, and
/// truncator to implement the dispatch algorithm of §4.4.
pub struct Router {
    supervisor: Arc<Supervisor>,
    catalogue: Arc<ToolInventory>,
    dataflow: Arc<DataFlowEngine>,
    truncator: Arc<Truncator>,
    config: Arc<ConfigStore>,
    events: EventBus,
    store: Arc<Store>,
}

impl Router {
    pub fn new(
        supervisor: Arc<Supervisor>,
        catalogue: Arc<ToolInventory>,
        dataflow: Arc<DataFlowEngine>,
        truncator: Arc<Truncator>,
        config: Arc<ConfigStore>,
        events: EventBus,
        store: Arc<Store>,
    ) -> Self {
        Self {
            supervisor,
            catalogue,
            dataflow,
            truncator,
            config,
            events,
            store,
        }
    }

    /// Full dispatch algorithm, steps 1-8 of §4.4. Step 1 (name parsing)
    /// is the caller's job — `request.qualified_name` is already parsed.
    pub async fn dispatch(&self, request: DispatchRequest) -> McpResult<DispatchOutcome> {
        let server_name = request.qualified_name.server_key.clone();
        let tool_name = request.qualified_name.tool_name.clone();

        let config = self.config.snapshot();
        if config.features.read_only_mode && request.intent != Intent::Read {
            return Err(McpError::InvalidRequest(
                "read-only mode: only read operations are permitted".to_string(),
            ));
        }

        let descriptor = config
            .get_server(&server_name)
            .ok_or_else(|| McpError::ServerNotFound(server_name.clone()))?;

        if descriptor.quarantined {
            return Ok(DispatchOutcome::QuarantineBlock {
                message: format!(
                    "server '{server_name}' is quarantined; call quarantine_security operation=inspect_quarantined to review"
                ),
                tool_description: self
                    .catalogue
                    .get_tool_qualified(&server_name, &tool_name)
                    .and_then(|t| t.description.map(|d| d.to_string())),
            });
        }

        let client = self
            .supervisor
            .get_client(&server_name)
            .await
            .ok_or_else(|| McpError::NotConnected(format!("{server_name} (no client)")))?;
        if !client.is_connected() {
            return Err(McpError::NotConnected(format!(
                "{server_name} (state={:?})",
                client.state()
            )));
        }

        let args_value = request
            .args
            .clone()
            .map(Value::Object)
            .unwrap_or(Value::Null);

        if matches!(request.intent, Intent::Write | Intent::Destructive) {
            let (decision, warning) = self.dataflow.evaluate(
                &request.session_id,
                &server_name,
                descriptor.class.as_deref(),
                &args_value,
            );
            match decision {
                FlowDecision::Deny => {
                    return Err(McpError::FlowPolicyDenied(
                        warning.unwrap_or_else(|| "data flow security: blocked".to_string()),
                    ));
                }
                FlowDecision::Warn => {
                    if let Some(w) = warning {
                        tracing::warn!(server = server_name, tool = tool_name, "{w}");
                    }
                }
                FlowDecision::Allow => {}
            }
        }

        let started = Instant::now();
        let call_result = client.call_tool(&tool_name, request.args.clone()).await;
        let duration_ns = started.elapsed().as_nanos();

        let record_id = next_call_id(&tool_name);
        let timestamp_unix_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let outcome = match call_result {
            Ok(result) => {
                let response_value = serde_json::to_value(&result).unwrap_or(Value::Null);

                self.dataflow.record_origin(
                    &request.session_id,
                    &server_name,
                    descriptor.class.as_deref(),
                    &tool_name,
                    &response_value,
                );

                let truncated = self
                    .truncator
                    .maybe_truncate(&tool_name, &args_value, &response_value)
                    .ok()
                    .flatten();

                let (final_response, was_truncated) = match truncated {
                    Some(view) => (Value::String(view.preview), true),
                    None => (response_value.clone(), false),
                };

                self.persist_record(ToolCallRecord {
                    id: record_id,
                    server_name: server_name.clone(),
                    tool_name: tool_name.clone(),
                    arguments: args_value,
                    response: Some(response_value),
                    error: None,
                    duration_ns,
                    timestamp_unix_ns,
                    session_id: request.session_id.to_string(),
                    client_name: request.client_name,
                    client_version: request.client_version,
                    request_id: request.request_id,
                    operation_type: request.intent,
                    token_metrics: TokenMetrics {
                        input_tokens: 0,
                        output_tokens: 0,
                        truncated: was_truncated,
                    },
                    execution_type: request.execution_type,
                });

                self.events.publish(ProxyEvent::CallCompleted {
                    tool: format!("{server_name}:{tool_name}"),
                    success: true,
                    duration_ms: (duration_ns / 1_000_000) as u64,
                });

                DispatchOutcome::Result(final_response)
            }
            Err(e) => {
                let (status, body) = match &e {
                    McpError::UpstreamError { status, body } => (*status, body.clone()),
                    other => (502, other.to_string()),
                };
                let advice = troubleshooting_advice(status, &body);
                let message = format!("{body}\n\nTroubleshooting: {advice}");

                self.persist_record(ToolCallRecord {
                    id: record_id,
                    server_name: server_name.clone(),
                    tool_name: tool_name.clone(),
                    arguments: args_value,
                    response: None,
                    error: Some(message.clone()),
                    duration_ns,
                    timestamp_unix_ns,
                    session_id: request.session_id.to_string(),
                    client_name: request.client_name,
                    client_version: request.client_version,
                    request_id: request.request_id,
                    operation_type: request.intent,
                    token_metrics: TokenMetrics {
                        input_tokens: 0,
                        output_tokens: 0,
                        truncated: false,
                    },
                    execution_type: request.execution_type,
                });

                self.events.publish(ProxyEvent::CallCompleted {
                    tool: format!("{server_name}:{tool_name}"),
                    success: false,
                    duration_ms: (duration_ns / 1_000_000) as u64,
                });

                return Err(McpError::UpstreamError { status, body: message });
            }
        };

        Ok(outcome)
    }

    fn persist_record(&self, record: ToolCallRecord) {
        let key = Store::be_key(record.timestamp_unix_ns as u64);
        if let Err(e) = self.store.put_json(BUCKET_TOOL_CALLS, &key, &record) {
            tracing::warn!(error = %e, "failed to persist tool-call record");
        }
    }

    /// Parses `"server:tool"` into a qualified name; upstream tools always
    /// contain `:`, built-in meta-tools never do.
    pub fn parse_name(name: &str) -> McpResult<QualifiedToolName> {
        QualifiedToolName::parse(name)
            .ok_or_else(|| McpError::InvalidRequest(format!("'{name}' is not a prefixed tool name")))
    }
}
