use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Content blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        content: String,
        #[serde(default, rename = "isError")]
        is_error: bool,
    },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "resource")]
    Resource {
        uri: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        blob: Option<String>,
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages — tagged union over {system_init, assistant, user, tool_result, result}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    MaxTurns,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultInfo {
    pub num_turns: usize,
    pub total_cost_usd: f64,
    pub is_error: bool,
    pub errors: Vec<String>,
    pub subtype: ResultSubtype,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system_init")]
    SystemInit {
        session_id: String,
        index: u64,
        cwd: String,
        model: String,
        tools: Vec<String>,
        mcp_servers: Vec<String>,
        timestamp: u64,
    },
    #[serde(rename = "assistant")]
    Assistant {
        session_id: String,
        index: u64,
        content: Vec<Content>,
        #[serde(rename = "stopReason")]
        stop_reason: StopReason,
        model: String,
        usage: Usage,
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    #[serde(rename = "user")]
    User {
        session_id: String,
        index: u64,
        content: Vec<Content>,
        timestamp: u64,
    },
    /// A single tool's outcome. Callers that need one message per turn fold
    /// these into the content blocks of the following `User` message rather
    /// than emitting them individually — see `agent_loop::gather_tool_results`.
    #[serde(rename = "tool_result")]
    ToolResult {
        session_id: String,
        index: u64,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        content: String,
        #[serde(rename = "isError")]
        is_error: bool,
        timestamp: u64,
    },
    #[serde(rename = "result")]
    Result {
        session_id: String,
        index: u64,
        #[serde(flatten)]
        info: ResultInfo,
        timestamp: u64,
    },
}

impl Message {
    pub fn session_id(&self) -> &str {
        match self {
            Self::SystemInit { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id, .. }
            | Self::ToolResult { session_id, .. }
            | Self::Result { session_id, .. } => session_id,
        }
    }

    pub fn index(&self) -> u64 {
        match self {
            Self::SystemInit { index, .. }
            | Self::Assistant { index, .. }
            | Self::User { index, .. }
            | Self::ToolResult { index, .. }
            | Self::Result { index, .. } => *index,
        }
    }

    pub fn role(&self) -> &str {
        match self {
            Self::SystemInit { .. } => "system_init",
            Self::Assistant { .. } => "assistant",
            Self::User { .. } => "user",
            Self::ToolResult { .. } => "tool_result",
            Self::Result { .. } => "result",
        }
    }

    /// Tool-use blocks carried by an assistant message, in appearance order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        match self {
            Self::Assistant { content, .. } => content
                .iter()
                .filter_map(|c| match c {
                    Content::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentMessage — LLM messages + extensible custom types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentMessage {
    /// Standard session message.
    Llm(Message),
    /// App-specific message (UI-only, notifications, etc.)
    Extension {
        role: String,
        #[serde(flatten)]
        data: serde_json::Value,
    },
}

impl AgentMessage {
    pub fn role(&self) -> &str {
        match self {
            Self::Llm(m) => m.role(),
            Self::Extension { role, .. } => role,
        }
    }

    pub fn as_llm(&self) -> Option<&Message> {
        match self {
            Self::Llm(m) => Some(m),
            _ => None,
        }
    }
}

impl From<Message> for AgentMessage {
    fn from(m: Message) -> Self {
        Self::Llm(m)
    }
}

// ---------------------------------------------------------------------------
// Stop reasons & usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    ToolUse,
    Error,
    Aborted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }

    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }

    /// Fraction of input tokens served from cache (0.0-1.0).
    pub fn cache_hit_rate(&self) -> f64 {
        let total_input = self.input + self.cache_read + self.cache_write;
        if total_input == 0 {
            return 0.0;
        }
        self.cache_read as f64 / total_input as f64
    }
}

/// Per-million-token pricing, applied to a turn's `Usage` to get a USD
/// figure. Rates default to zero (no cost tracked) until a caller fills in
/// the model's actual rates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CostConfig {
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cache_read_per_million: f64,
    #[serde(default)]
    pub cache_write_per_million: f64,
}

impl CostConfig {
    pub fn cost_usd(&self, usage: &Usage) -> f64 {
        (usage.input as f64 * self.input_per_million
            + usage.output as f64 * self.output_per_million
            + usage.cache_read as f64 * self.cache_read_per_million
            + usage.cache_write as f64 * self.cache_write_per_million)
            / 1_000_000.0
    }
}

// ---------------------------------------------------------------------------
// Cache configuration
// ---------------------------------------------------------------------------

/// Controls prompt-cache hints threaded into the LLM transport adapter.
/// By default caching is enabled with automatic breakpoint placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub strategy: CacheStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CacheStrategy::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    #[default]
    Auto,
    Disabled,
}

// ---------------------------------------------------------------------------
// Thinking level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::Error => write!(f, "error"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_accessors_match_variant() {
        let m = Message::User {
            session_id: "s1".into(),
            index: 3,
            content: vec![Content::text("hi")],
            timestamp: 0,
        };
        assert_eq!(m.role(), "user");
        assert_eq!(m.session_id(), "s1");
        assert_eq!(m.index(), 3);
    }

    #[test]
    fn tool_uses_extracts_in_order() {
        let m = Message::Assistant {
            session_id: "s1".into(),
            index: 0,
            content: vec![
                Content::text("thinking out loud"),
                Content::ToolUse {
                    id: "t1".into(),
                    name: "read_file".into(),
                    input: serde_json::json!({"path": "a"}),
                },
                Content::ToolUse {
                    id: "t2".into(),
                    name: "bash".into(),
                    input: serde_json::json!({"cmd": "ls"}),
                },
            ],
            stop_reason: StopReason::ToolUse,
            model: "m".into(),
            usage: Usage::default(),
            timestamp: 0,
            error_message: None,
        };
        let uses = m.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].0, "t1");
        assert_eq!(uses[1].0, "t2");
    }

    #[test]
    fn usage_add_accumulates() {
        let mut u = Usage { input: 10, output: 5, cache_read: 0, cache_write: 0 };
        u.add(&Usage { input: 2, output: 1, cache_read: 3, cache_write: 0 });
        assert_eq!(u.total(), 18);
        assert_eq!(u.cache_read, 3);
    }

    #[test]
    fn cost_config_computes_usd_from_usage() {
        let cost = CostConfig { input_per_million: 3.0, output_per_million: 15.0, cache_read_per_million: 0.3, cache_write_per_million: 3.75 };
        let usage = Usage { input: 1_000_000, output: 1_000_000, cache_read: 1_000_000, cache_write: 1_000_000 };
        assert_eq!(cost.cost_usd(&usage), 3.0 + 15.0 + 0.3 + 3.75);
    }

    #[test]
    fn default_cost_config_is_zero() {
        let cost = CostConfig::default();
        let usage = Usage { input: 1_000_000, output: 1_000_000, cache_read: 0, cache_write: 0 };
        assert_eq!(cost.cost_usd(&usage), 0.0);
    }
}
