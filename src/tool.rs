//! The tool contract: every callable (built-in, MCP-backed, or otherwise)
//! implements [`Tool`] and is registered with a [`crate::registry::ToolRegistry`].

use serde::{Deserialize, Serialize};

/// Coarse classification of what a tool does to the outside world. The
/// permission layer and UI risk badge are both derived from this, not from
/// a separate per-tool flag — see `spec.md` §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    /// Pure computation or in-memory inspection; nothing observable changes.
    None,
    /// Reads external state (filesystem, network) without mutating it.
    ReadOnly,
    /// Mutates filesystem or process state.
    Mutating,
    /// Talks to the network.
    Network,
    /// Runs synchronously for a potentially long time (e.g. a shell command),
    /// holding up the turn it's dispatched in.
    Blocking,
    /// Starts another process or another agent loop (background tasks,
    /// subagents) rather than running inline.
    Spawns,
}

impl SideEffect {
    /// Default risk tier used when no explicit permission policy overrides it.
    pub fn default_risk(self) -> RiskTier {
        match self {
            SideEffect::None | SideEffect::ReadOnly => RiskTier::Low,
            SideEffect::Network => RiskTier::Medium,
            SideEffect::Mutating | SideEffect::Blocking | SideEffect::Spawns => RiskTier::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// The shape an LLM transport adapter serializes into its tool-definitions
/// payload. Intentionally wire-format agnostic: adapters translate this into
/// whatever shape their provider expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Per-call context handed to a tool's `execute`.
#[derive(Clone)]
pub struct ToolContext {
    pub tool_use_id: String,
    pub cwd: String,
    pub cancel: tokio_util::sync::CancellationToken,
}

/// A tool's result: `spec.md` calls for `(content: string, is_error: bool)`.
/// Kept minimal on purpose — richer structured content (images, resources)
/// belongs in the assistant/user message content blocks, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: true }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("cancelled")]
    Cancelled,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Every callable the agent loop may dispatch implements this. The registry
/// holds trait objects, so all state lives behind `&self` (interior
/// mutability if a tool genuinely needs it).
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    fn side_effect(&self) -> SideEffect;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, input: serde_json::Value) -> Result<ToolOutcome, ToolError>;
}
