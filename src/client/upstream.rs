//! The upstream client (C1): owns one server's transport, connection
//! state, cached tool list, and token-store handle.

use std::{
    borrow::Cow,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use rmcp::model::{CallToolRequestParam, CallToolResult, Tool};
use tokio::sync::Mutex as AsyncMutex;

use super::backoff;
use super::state::{ClientState, ConnectionInfo};
use super::transport::{McpClient, Transport};
use crate::error::{McpError, McpResult};
use crate::store::Store;

const TOOL_COUNT_CACHE_TTL: Duration = Duration::from_secs(2 * 60);
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);

struct ToolCountCache {
    count: usize,
    cached_at: Instant,
}

/// Owns everything the supervisor and router need for a single upstream:
/// the running service once connected, connection bookkeeping, and a
/// short-lived tool-count cache so `upstream_servers` listings don't
/// re-list on every poll.
pub struct UpstreamClient {
    pub server_name: String,
    transport: Transport,
    client: AsyncMutex<Option<McpClient>>,
    info: RwLock<ConnectionInfo>,
    tool_count_cache: RwLock<Option<ToolCountCache>>,
    store: Option<Arc<Store>>,
}

impl UpstreamClient {
    pub fn new(server_name: impl Into<String>, transport: Transport, store: Option<Arc<Store>>) -> Self {
        Self {
            server_name: server_name.into(),
            transport,
            client: AsyncMutex::new(None),
            info: RwLock::new(ConnectionInfo::default()),
            tool_count_cache: RwLock::new(None),
            store,
        }
    }

    pub fn state(&self) -> ClientState {
        self.info.read().state.clone()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.info.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_usable()
    }

    fn set_state(&self, next: ClientState, error: Option<String>) {
        self.info.write().transition(next, error);
    }

    /// Connects with retry governed by `client::backoff`. On repeated
    /// failure the state settles on `Error` and the caller (supervisor)
    /// decides whether to try again on the next reconciliation tick.
    pub async fn connect(&self) -> McpResult<()> {
        if matches!(self.state(), ClientState::Disabled) {
            return Err(McpError::NotConnected(format!(
                "{} is disabled",
                self.server_name
            )));
        }
        self.set_state(ClientState::Connecting, None);

        let transport = self.transport.clone();
        let server_name = self.server_name.clone();
        let result = backoff::reconnect_with_backoff(&server_name, 5, move || {
            let transport = transport.clone();
            let server_name = server_name.clone();
            async move { transport.connect(&server_name).await }
        })
        .await;

        match result {
            Ok(running) => {
                *self.client.lock().await = Some(running);
                self.set_state(ClientState::Ready, None);
                self.invalidate_tool_count_cache();
                Ok(())
            }
            Err(e) => {
                self.set_state(ClientState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) {
        let mut guard = self.client.lock().await;
        if let Some(running) = guard.take() {
            let _ = running.cancel().await;
        }
        self.set_state(ClientState::Disconnected, None);
    }

    pub fn disable(&self) {
        self.set_state(ClientState::Disabled, None);
    }

    fn invalidate_tool_count_cache(&self) {
        *self.tool_count_cache.write() = None;
    }

    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        if !self.is_connected() {
            return Err(McpError::NotConnected(self.server_name.clone()));
        }
        let guard = self.client.lock().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| McpError::NotConnected(self.server_name.clone()))?;

        let tools = tokio::time::timeout(LIST_TOOLS_TIMEOUT, client.peer().list_all_tools())
            .await
            .map_err(|_| McpError::Timeout(format!("list_tools on {}", self.server_name)))?
            .map_err(|e| McpError::UpstreamError {
                status: 502,
                body: e.to_string(),
            })?;

        *self.tool_count_cache.write() = Some(ToolCountCache {
            count: tools.len(),
            cached_at: Instant::now(),
        });
        Ok(tools)
    }

    /// Returns the cached tool count if still within TTL, else `None` —
    /// callers fall back to `list_tools` for a fresh count.
    pub fn cached_tool_count(&self) -> Option<usize> {
        let cache = self.tool_count_cache.read();
        cache.as_ref().and_then(|c| {
            if c.cached_at.elapsed() < TOOL_COUNT_CACHE_TTL {
                Some(c.count)
            } else {
                None
            }
        })
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> McpResult<CallToolResult> {
        if !self.is_connected() {
            return Err(McpError::NotConnected(self.server_name.clone()));
        }
        let guard = self.client.lock().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| McpError::NotConnected(self.server_name.clone()))?;

        let request = CallToolRequestParam {
            name: Cow::Owned(tool_name.to_string()),
            arguments: args,
        };

        client.call_tool(request).await.map_err(|e| McpError::UpstreamError {
            status: 502,
            body: e.to_string(),
        })
    }

    pub fn store(&self) -> Option<&Arc<Store>> {
        self.store.as_ref()
    }
}
