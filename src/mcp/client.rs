//! Multi-server MCP client: manages a set of named server connections,
//! drives the handshake, keeps each connection's tool/resource inventory
//! current, and registers/unregisters dynamic `mcp__<server>__<tool>`
//! entries in the shared `ToolRegistry`. Generalized from the teacher's
//! single-connection `McpClient` sketch to the multi-server manager
//! `spec.md` §4.3 describes.

use super::tool_adapter::McpDynamicTool;
use super::transport::{HttpTransport, McpTransport, StdioTransport};
use super::types::*;
use crate::registry::ToolRegistry;
use crate::retry::RetryConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerTransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub transport: ServerTransportConfig,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Failed,
    NeedsAuth,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ServerStatusSnapshot {
    pub name: String,
    pub status: ConnectionStatus,
    pub server_info: Option<ServerInfo>,
    pub tools: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct SetServersResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub errors: HashMap<String, String>,
}

struct ConnectionMeta {
    config: ServerConfig,
    status: ConnectionStatus,
    server_info: Option<ServerInfo>,
    capabilities: Option<ServerCapabilities>,
    tools: Vec<McpToolInfo>,
    resources: Vec<McpResourceInfo>,
    last_error: Option<String>,
}

/// One named server's live state. The transport slot and the metadata each
/// have their own lock so a reconnect can swap the transport without
/// blocking a concurrent status snapshot, and vice versa; neither lock is
/// ever held across an `.await`.
struct ServerConnection {
    name: String,
    transport: StdRwLock<Option<Arc<dyn McpTransport>>>,
    next_id: AtomicU64,
    meta: StdMutex<ConnectionMeta>,
}

impl ServerConnection {
    fn status(&self) -> ConnectionStatus {
        self.meta.lock().unwrap().status
    }

    fn transport(&self) -> Result<Arc<dyn McpTransport>, McpError> {
        self.transport.read().unwrap().clone().ok_or(McpError::ConnectionClosed)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct McpClient {
    connections: RwLock<HashMap<String, Arc<ServerConnection>>>,
    registry: Arc<ToolRegistry>,
    retry: RetryConfig,
}

impl McpClient {
    pub fn new(registry: Arc<ToolRegistry>) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            registry,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry_config(registry: Arc<ToolRegistry>, retry: RetryConfig) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            registry,
            retry,
        })
    }

    fn full_tool_name(server: &str, tool: &str) -> String {
        format!("mcp__{server}__{tool}")
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    async fn build_transport(config: &ServerConfig) -> Result<Arc<dyn McpTransport>, McpError> {
        match &config.transport {
            ServerTransportConfig::Stdio { command, args, env } => {
                let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
                let transport = StdioTransport::new(command, &args_ref, Some(env.clone())).await?;
                Ok(Arc::new(transport))
            }
            ServerTransportConfig::Http { url, headers: _ } => Ok(Arc::new(HttpTransport::new(url)?)),
        }
    }

    async fn send(&self, connection: &ServerConnection, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value, McpError> {
        let id = connection.allocate_id();
        let request = JsonRpcRequest::with_id(id, method, params);
        let transport = connection.transport()?;
        let response = transport.send_request(request).await?;
        if let Some(error) = response.error {
            return Err(McpError::JsonRpc { code: error.code, message: error.message });
        }
        response.result.ok_or_else(|| McpError::Protocol("response has neither result nor error".into()))
    }

    async fn notify(&self, connection: &ServerConnection, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let transport = connection.transport()?;
        transport.send_notification(JsonRpcNotification::new(method, params)).await
    }

    /// Runs the handshake (4.3.1) against an already-built transport and, on
    /// success, registers every discovered tool in the shared registry.
    async fn handshake(self: &Arc<Self>, connection: &Arc<ServerConnection>) -> Result<(), McpError> {
        let params = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": ClientInfo::default(),
        });
        let response = self.send(connection, "initialize", Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(response)?;

        let _ = self.notify(connection, "notifications/initialized", None).await;

        let mut tools = Vec::new();
        if result.capabilities.tools.is_some() {
            let tools_response = self.send(connection, "tools/list", Some(serde_json::json!({}))).await?;
            tools = serde_json::from_value::<ToolsListResult>(tools_response)?.tools;
        }

        let mut resources = Vec::new();
        if result.capabilities.resources.is_some() {
            match self.send(connection, "resources/list", Some(serde_json::json!({}))).await {
                Ok(value) => {
                    if let Ok(parsed) = serde_json::from_value::<ResourcesListResult>(value) {
                        resources = parsed.resources;
                    }
                }
                Err(e) => warn!(server = %connection.name, error = %e, "resources/list failed, continuing without resources"),
            }
        }

        let weak_client = Arc::downgrade(self);
        let conn_name = connection.name.clone();
        let transport = connection.transport()?;
        transport.set_notification_handler(Arc::new(move |notification: JsonRpcNotification| {
            if notification.method == "notifications/tools/list_changed" {
                if let Some(client) = weak_client.upgrade() {
                    let conn_name = conn_name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.refresh_tools(&conn_name).await {
                            warn!(server = %conn_name, error = %e, "tool list refresh failed");
                        }
                    });
                }
            }
        }));

        {
            let mut meta = connection.meta.lock().unwrap();
            meta.server_info = Some(result.server_info);
            meta.capabilities = Some(result.capabilities);
            meta.tools = tools.clone();
            meta.resources = resources;
            meta.status = ConnectionStatus::Connected;
            meta.last_error = None;
        }

        for tool in &tools {
            self.registry.upsert(Arc::new(McpDynamicTool::new(self.clone(), connection.name.clone(), tool.clone())));
        }

        Ok(())
    }

    /// Creates the transport, drives the handshake, and on failure places
    /// the connection in *failed* with the error recorded rather than
    /// removing it — a caller can inspect `server_status` to see why.
    pub async fn connect(self: &Arc<Self>, name: impl Into<String>, config: ServerConfig) -> Result<(), McpError> {
        let name = name.into();
        let transport = Self::build_transport(&config).await?;

        let connection = Arc::new(ServerConnection {
            name: name.clone(),
            transport: StdRwLock::new(Some(transport)),
            next_id: AtomicU64::new(1),
            meta: StdMutex::new(ConnectionMeta {
                config,
                status: ConnectionStatus::Pending,
                server_info: None,
                capabilities: None,
                tools: Vec::new(),
                resources: Vec::new(),
                last_error: None,
            }),
        });

        self.connections.write().await.insert(name.clone(), connection.clone());

        if let Err(e) = self.handshake(&connection).await {
            let mut meta = connection.meta.lock().unwrap();
            meta.status = ConnectionStatus::Failed;
            meta.last_error = Some(e.to_string());
            return Err(e);
        }

        Ok(())
    }

    /// Closes the transport, unregisters the connection's dynamic tools, and
    /// drops it back to *pending* (the caller decides whether to remove it
    /// entirely or reconnect).
    pub async fn disconnect(&self, name: &str) -> Result<(), McpError> {
        let connection = {
            let connections = self.connections.read().await;
            connections.get(name).cloned().ok_or_else(|| McpError::ServerNotFound(name.to_string()))?
        };

        if let Ok(transport) = connection.transport() {
            let _ = transport.close().await;
        }
        *connection.transport.write().unwrap() = None;
        self.registry.unregister_by_prefix(&format!("mcp__{name}__"));
        connection.meta.lock().unwrap().status = ConnectionStatus::Pending;
        Ok(())
    }

    /// Re-issues `tools/list` under a 30-second deadline and atomically
    /// swaps the registry entries for this server's prefix. On any error the
    /// previously registered inventory is left untouched.
    pub async fn refresh_tools(self: &Arc<Self>, name: &str) -> Result<(), McpError> {
        let connection = {
            let connections = self.connections.read().await;
            connections.get(name).cloned().ok_or_else(|| McpError::ServerNotFound(name.to_string()))?
        };

        let fresh = tokio::time::timeout(std::time::Duration::from_secs(30), self.send(&connection, "tools/list", Some(serde_json::json!({}))))
            .await
            .map_err(|_| McpError::Timeout)??;
        let tools: Vec<McpToolInfo> = serde_json::from_value::<ToolsListResult>(fresh)?.tools;

        self.registry.unregister_by_prefix(&format!("mcp__{name}__"));
        for tool in &tools {
            self.registry.upsert(Arc::new(McpDynamicTool::new(self.clone(), name.to_string(), tool.clone())));
        }
        connection.meta.lock().unwrap().tools = tools;
        Ok(())
    }

    /// Reconciles live connections against a desired server set (4.3.5).
    /// Never atomic across servers: one server's error never stops the rest
    /// from being processed.
    pub async fn set_servers(self: &Arc<Self>, desired: HashMap<String, ServerConfig>) -> SetServersResult {
        let mut result = SetServersResult::default();

        let existing: HashMap<String, ServerConfig> = {
            let connections = self.connections.read().await;
            connections.iter().map(|(name, conn)| (name.clone(), conn.meta.lock().unwrap().config.clone())).collect()
        };

        for name in existing.keys() {
            if !desired.contains_key(name) {
                if let Err(e) = self.disconnect(name).await {
                    result.errors.insert(name.clone(), e.to_string());
                    continue;
                }
                self.connections.write().await.remove(name);
                result.removed.push(name.clone());
            }
        }

        for (name, config) in desired {
            match existing.get(&name) {
                None => match self.connect(name.clone(), config).await {
                    Ok(()) => result.added.push(name),
                    Err(e) => {
                        result.errors.insert(name, e.to_string());
                    }
                },
                Some(current) if *current != config => {
                    if let Err(e) = self.disconnect(&name).await {
                        result.errors.insert(name.clone(), e.to_string());
                        continue;
                    }
                    match self.connect(name.clone(), config).await {
                        Ok(()) => result.updated.push(name),
                        Err(e) => {
                            result.errors.insert(name, e.to_string());
                        }
                    }
                }
                Some(_) => {}
            }
        }

        result
    }

    /// `enabled=false` unregisters the server's dynamic tools and marks it
    /// *disabled* without tearing down the transport; `enabled=true`
    /// re-registers the previously known tool list without re-running the
    /// handshake.
    pub async fn toggle(self: &Arc<Self>, name: &str, enabled: bool) -> Result<(), McpError> {
        let connection = {
            let connections = self.connections.read().await;
            connections.get(name).cloned().ok_or_else(|| McpError::ServerNotFound(name.to_string()))?
        };

        if enabled {
            let tools = {
                let mut meta = connection.meta.lock().unwrap();
                meta.status = ConnectionStatus::Connected;
                meta.tools.clone()
            };
            for tool in &tools {
                self.registry.upsert(Arc::new(McpDynamicTool::new(self.clone(), name.to_string(), tool.clone())));
            }
        } else {
            self.registry.unregister_by_prefix(&format!("mcp__{name}__"));
            connection.meta.lock().unwrap().status = ConnectionStatus::Disabled;
        }
        Ok(())
    }

    pub async fn status(&self) -> Vec<ServerStatusSnapshot> {
        let connections = self.connections.read().await;
        connections
            .values()
            .map(|conn| {
                let meta = conn.meta.lock().unwrap();
                ServerStatusSnapshot {
                    name: conn.name.clone(),
                    status: meta.status,
                    server_info: meta.server_info.clone(),
                    tools: meta.tools.iter().map(|t| t.name.clone()).collect(),
                    last_error: meta.last_error.clone(),
                }
            })
            .collect()
    }

    pub async fn server_status(&self, name: &str) -> Result<ServerStatusSnapshot, McpError> {
        let connections = self.connections.read().await;
        let conn = connections.get(name).ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        let meta = conn.meta.lock().unwrap();
        Ok(ServerStatusSnapshot {
            name: conn.name.clone(),
            status: meta.status,
            server_info: meta.server_info.clone(),
            tools: meta.tools.iter().map(|t| t.name.clone()).collect(),
            last_error: meta.last_error.clone(),
        })
    }

    pub async fn list_resources(&self, name: &str) -> Result<Vec<McpResourceInfo>, McpError> {
        let connection = {
            let connections = self.connections.read().await;
            connections.get(name).cloned().ok_or_else(|| McpError::ServerNotFound(name.to_string()))?
        };
        let value = self.send(&connection, "resources/list", Some(serde_json::json!({}))).await?;
        Ok(serde_json::from_value::<ResourcesListResult>(value)?.resources)
    }

    pub async fn read_resource(&self, name: &str, uri: &str) -> Result<serde_json::Value, McpError> {
        let connection = {
            let connections = self.connections.read().await;
            connections.get(name).cloned().ok_or_else(|| McpError::ServerNotFound(name.to_string()))?
        };
        self.send(&connection, "resources/read", Some(serde_json::json!({"uri": uri}))).await
    }

    /// Calls a tool on a server, triggering auto-reconnect (4.3.6) if the
    /// failure was transport-level.
    pub async fn call_tool(self: &Arc<Self>, server: &str, tool: &str, arguments: serde_json::Value) -> Result<McpToolCallResult, McpError> {
        let connection = {
            let connections = self.connections.read().await;
            connections.get(server).cloned().ok_or_else(|| McpError::ServerNotFound(server.to_string()))?
        };

        if connection.status() == ConnectionStatus::Disabled {
            return Err(McpError::ServerDisabled(server.to_string()));
        }

        let params = serde_json::json!({"name": tool, "arguments": arguments});
        match self.send(&connection, "tools/call", Some(params.clone())).await {
            Ok(value) => Ok(serde_json::from_value::<McpToolCallResult>(value)?),
            Err(e) if e.is_reconnectable() => {
                self.reconnect_with_backoff(&connection).await?;
                let value = self.send(&connection, "tools/call", Some(params)).await?;
                Ok(serde_json::from_value::<McpToolCallResult>(value)?)
            }
            Err(e) => Err(e),
        }
    }

    async fn reconnect_with_backoff(self: &Arc<Self>, connection: &Arc<ServerConnection>) -> Result<(), McpError> {
        let config = connection.meta.lock().unwrap().config.clone();
        let mut last_error = None;

        for attempt in 1..=self.retry.max_retries {
            let delay = self.retry.delay_for_attempt(attempt);
            tokio::time::sleep(delay).await;

            match Self::build_transport(&config).await {
                Ok(transport) => {
                    *connection.transport.write().unwrap() = Some(transport);
                    match self.handshake(connection).await {
                        Ok(()) => return Ok(()),
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        let error = last_error.unwrap_or(McpError::ConnectionClosed);
        connection.meta.lock().unwrap().last_error = Some(error.to_string());
        Err(error)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMut;

    /// A mock transport scripted with a fixed response queue, shared by
    /// `client.rs` and `tool_adapter.rs` tests.
    pub(crate) struct MockTransport {
        pub(crate) responses: StdMut<Vec<JsonRpcResponse>>,
    }

    impl MockTransport {
        pub(crate) fn new(responses: Vec<JsonRpcResponse>) -> Self {
            Self { responses: StdMut::new(responses) }
        }
    }

    #[async_trait]
    impl McpTransport for MockTransport {
        async fn send_request(&self, _request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(McpError::ConnectionClosed)
            } else {
                Ok(responses.remove(0))
            }
        }

        async fn send_notification(&self, _notification: JsonRpcNotification) -> Result<(), McpError> {
            Ok(())
        }

        fn set_notification_handler(&self, _handler: super::super::transport::NotificationHandler) {}

        async fn close(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn ok_response(id: u64, result: serde_json::Value) -> JsonRpcResponse {
        JsonRpcResponse { jsonrpc: "2.0".into(), id: Some(id), result: Some(result), error: None }
    }

    fn init_result() -> serde_json::Value {
        serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "test-server", "version": "1.0"},
        })
    }

    pub(crate) async fn connect_with_mock(client: &Arc<McpClient>, name: &str, responses: Vec<JsonRpcResponse>) {
        let connection = Arc::new(ServerConnection {
            name: name.to_string(),
            transport: StdRwLock::new(Some(Arc::new(MockTransport::new(responses)))),
            next_id: AtomicU64::new(1),
            meta: StdMutex::new(ConnectionMeta {
                config: ServerConfig {
                    transport: ServerTransportConfig::Stdio { command: "mock".into(), args: vec![], env: HashMap::new() },
                    enabled: true,
                },
                status: ConnectionStatus::Pending,
                server_info: None,
                capabilities: None,
                tools: Vec::new(),
                resources: Vec::new(),
                last_error: None,
            }),
        });
        client.connections.write().await.insert(name.to_string(), connection.clone());
        client.handshake(&connection).await.unwrap();
    }

    #[tokio::test]
    async fn handshake_registers_discovered_tools() {
        let registry = Arc::new(ToolRegistry::new());
        let client = McpClient::new(registry.clone());

        connect_with_mock(
            &client,
            "fs",
            vec![
                ok_response(1, init_result()),
                ok_response(
                    2,
                    serde_json::json!({"tools": [{"name": "read_file", "description": "reads a file", "inputSchema": {"type": "object"}}]}),
                ),
            ],
        )
        .await;

        assert!(registry.has("mcp__fs__read_file"));
        let status = client.server_status("fs").await.unwrap();
        assert_eq!(status.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn fatal_tools_list_failure_marks_connection_failed() {
        let registry = Arc::new(ToolRegistry::new());
        let client = McpClient::new(registry.clone());

        let connection = Arc::new(ServerConnection {
            name: "fs".into(),
            transport: StdRwLock::new(Some(Arc::new(MockTransport::new(vec![ok_response(1, init_result())])))),
            next_id: AtomicU64::new(1),
            meta: StdMutex::new(ConnectionMeta {
                config: ServerConfig { transport: ServerTransportConfig::Stdio { command: "mock".into(), args: vec![], env: HashMap::new() }, enabled: true },
                status: ConnectionStatus::Pending,
                server_info: None,
                capabilities: None,
                tools: Vec::new(),
                resources: Vec::new(),
                last_error: None,
            }),
        });
        client.connections.write().await.insert("fs".into(), connection.clone());

        let result = client.handshake(&connection).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn toggle_off_unregisters_and_toggle_on_restores_without_handshake() {
        let registry = Arc::new(ToolRegistry::new());
        let client = McpClient::new(registry.clone());

        connect_with_mock(
            &client,
            "fs",
            vec![
                ok_response(1, init_result()),
                ok_response(2, serde_json::json!({"tools": [{"name": "read_file", "description": null, "inputSchema": {"type": "object"}}]})),
            ],
        )
        .await;
        assert!(registry.has("mcp__fs__read_file"));

        client.toggle("fs", false).await.unwrap();
        assert!(!registry.has("mcp__fs__read_file"));
        assert_eq!(client.server_status("fs").await.unwrap().status, ConnectionStatus::Disabled);

        client.toggle("fs", true).await.unwrap();
        assert!(registry.has("mcp__fs__read_file"));
    }
}
