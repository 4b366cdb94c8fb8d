//! MCP (Model Context Protocol) client support: a multi-server manager that
//! drives the handshake, keeps tool inventories current, and registers
//! dynamic `mcp__<server>__<tool>` entries in the shared tool registry.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentcore::mcp::{McpClient, ServerConfig, ServerTransportConfig};
//! use agentcore::registry::ToolRegistry;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), agentcore::mcp::McpError> {
//! let registry = Arc::new(ToolRegistry::new());
//! let client = McpClient::new(registry);
//! client.connect("fs", ServerConfig {
//!     transport: ServerTransportConfig::Stdio {
//!         command: "npx".into(),
//!         args: vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into(), "/tmp".into()],
//!         env: HashMap::new(),
//!     },
//!     enabled: true,
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod tool_adapter;
pub mod transport;
pub mod types;

pub use client::{ConnectionStatus, McpClient, ServerConfig, ServerStatusSnapshot, ServerTransportConfig, SetServersResult};
pub use tool_adapter::McpDynamicTool;
pub use transport::{HttpTransport, McpTransport, NotificationHandler, StdioTransport};
pub use types::{McpContent, McpError, McpResourceInfo, McpToolCallResult, McpToolInfo, ServerInfo};
