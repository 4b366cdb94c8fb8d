//! Before/after-tool hooks. Hook errors are logged and never abort the turn —
//! grounded in `agent.rs`'s `before_turn`/`after_turn`/`on_error` callback
//! seam, narrowed to the tool-call boundary `spec.md` §4.1.3 calls for.

use crate::tool::ToolOutcome;
use std::sync::Arc;

pub type BeforeToolFn = Arc<dyn Fn(&str, &serde_json::Value) -> Result<(), String> + Send + Sync>;
pub type AfterToolFn = Arc<dyn Fn(&str, &ToolOutcome) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub before_tool: Option<BeforeToolFn>,
    pub after_tool: Option<AfterToolFn>,
}

impl Hooks {
    pub fn run_before(&self, tool_name: &str, input: &serde_json::Value) {
        if let Some(f) = &self.before_tool {
            if let Err(e) = f(tool_name, input) {
                tracing::warn!(tool = tool_name, error = %e, "before_tool hook failed");
            }
        }
    }

    pub fn run_after(&self, tool_name: &str, outcome: &ToolOutcome) {
        if let Some(f) = &self.after_tool {
            if let Err(e) = f(tool_name, outcome) {
                tracing::warn!(tool = tool_name, error = %e, "after_tool hook failed");
            }
        }
    }
}
