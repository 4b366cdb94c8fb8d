//! Adapts a single MCP server tool into the crate's `Tool` contract so it
//! can sit in the same registry as any built-in tool. Dynamic naming and
//! the required-field pre-validator come from `spec.md` §4.3.8; the shape
//! of wrapping a remote call as a `Tool` impl is carried over from the
//! teacher's `McpToolAdapter`.

use super::client::McpClient;
use super::types::{McpContent, McpToolInfo};
use crate::tool::{SideEffect, Tool, ToolContext, ToolError, ToolOutcome};
use async_trait::async_trait;
use std::sync::Arc;

pub struct McpDynamicTool {
    client: Arc<McpClient>,
    server: String,
    tool_name: String,
    full_name: String,
    description: String,
    input_schema: serde_json::Value,
}

impl McpDynamicTool {
    pub fn new(client: Arc<McpClient>, server: impl Into<String>, tool: McpToolInfo) -> Self {
        let server = server.into();
        let full_name = format!("mcp__{server}__{}", tool.name);
        Self {
            client,
            description: tool.description.clone().unwrap_or_else(|| "MCP tool (no description)".into()),
            input_schema: tool.input_schema.clone(),
            tool_name: tool.name,
            server,
            full_name,
        }
    }
}

/// Extracts `required` as a list of field names, tolerant of both a
/// homogeneous `["a", "b"]` array and a heterogeneous one where some
/// elements aren't strings (those are simply skipped).
fn required_fields(schema: &serde_json::Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn missing_fields(schema: &serde_json::Value, input: &serde_json::Value) -> Vec<String> {
    required_fields(schema)
        .into_iter()
        .filter(|field| input.get(field).map(serde_json::Value::is_null).unwrap_or(true))
        .collect()
}

#[async_trait]
impl Tool for McpDynamicTool {
    fn name(&self) -> &str {
        &self.full_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.input_schema.clone()
    }

    fn side_effect(&self) -> SideEffect {
        SideEffect::Network
    }

    async fn execute(&self, _ctx: &ToolContext, input: serde_json::Value) -> Result<ToolOutcome, ToolError> {
        let missing = missing_fields(&self.input_schema, &input);
        if !missing.is_empty() {
            return Ok(ToolOutcome::error(format!("missing required field(s): {}", missing.join(", "))));
        }

        let result = self
            .client
            .call_tool(&self.server, &self.tool_name, input)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        // Text blocks are joined for the string form; image/resource blocks
        // are dropped here but preserved when callers consume the
        // structured `McpToolCallResult` directly via `McpClient::call_tool`.
        let content = result
            .content
            .iter()
            .filter_map(|c| match c {
                McpContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutcome { content, is_error: result.is_error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::*;
    use crate::registry::ToolRegistry;

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

    async fn connected_client(tool: McpToolInfo, call_response: JsonRpcResponse) -> Arc<McpClient> {
        let registry = Arc::new(ToolRegistry::new());
        let client = McpClient::new(registry);

        let responses = vec![
            ok_response(1, init_result()),
            ok_response(2, serde_json::json!({"tools": [serde_json::to_value(&tool).unwrap()]})),
            call_response,
        ];

        // Build the connection directly against a mock transport, bypassing
        // the real stdio/HTTP spawn path, the same way client.rs's own
        // handshake tests do.
        crate::mcp::client::tests::connect_with_mock(&client, "srv", responses).await;
        client
    }

    fn read_file_tool() -> McpToolInfo {
        McpToolInfo {
            name: "read_file".into(),
            description: Some("Read a file from disk".into()),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        }
    }

    #[tokio::test]
    async fn missing_required_field_short_circuits_without_calling_server() {
        let client = connected_client(read_file_tool(), ok_response(3, serde_json::json!({"content": [], "isError": false}))).await;

        let tool = client.registry().get("mcp__srv__read_file").expect("tool registered");
        let ctx = ToolContext { tool_use_id: "t1".into(), cwd: ".".into(), cancel: tokio_util::sync::CancellationToken::new() };
        let outcome = tool.execute(&ctx, serde_json::json!({})).await.unwrap();
        assert!(outcome.is_error);
        assert!(outcome.content.contains("path"));
    }

    #[tokio::test]
    async fn successful_call_joins_text_blocks() {
        let client = connected_client(
            read_file_tool(),
            ok_response(
                3,
                serde_json::json!({"content": [{"type": "text", "text": "line one"}, {"type": "text", "text": "line two"}], "isError": false}),
            ),
        )
        .await;

        let tool = client.registry().get("mcp__srv__read_file").expect("tool registered");
        let ctx = ToolContext { tool_use_id: "t1".into(), cwd: ".".into(), cancel: tokio_util::sync::CancellationToken::new() };
        let outcome = tool.execute(&ctx, serde_json::json!({"path": "/tmp/x"})).await.unwrap();
        assert!(!outcome.is_error);
        assert_eq!(outcome.content, "line one\nline two");
    }
}
