//! Context window management and execution bounds. The truncation algorithm
//! (keep-first-N + keep-last-M, "[Context truncated...]" marker, fallback
//! walk-backward-from-end) is kept verbatim from the teacher's
//! `truncate_messages`, generalized from `AgentMessage` to the session
//! `Message` type and wrapped behind the `Compactor` seam `spec.md` §4.1
//! calls for.

use crate::types::*;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Rough token estimate: ~4 chars per token. Good enough for budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

pub fn message_tokens(msg: &Message) -> usize {
    match msg {
        Message::SystemInit { tools, mcp_servers, cwd, .. } => {
            tools.iter().map(|t| estimate_tokens(t)).sum::<usize>()
                + mcp_servers.iter().map(|s| estimate_tokens(s)).sum::<usize>()
                + estimate_tokens(cwd)
                + 8
        }
        Message::Assistant { content, .. } | Message::User { content, .. } => {
            content_tokens(content) + 4
        }
        Message::ToolResult { content, .. } => estimate_tokens(content) + 8,
        Message::Result { info, .. } => {
            info.errors.iter().map(|e| estimate_tokens(e)).sum::<usize>() + 8
        }
    }
}

fn content_tokens(content: &[Content]) -> usize {
    content
        .iter()
        .map(|c| match c {
            Content::Text { text } => estimate_tokens(text),
            Content::Thinking { thinking, .. } => estimate_tokens(thinking),
            Content::Image { .. } => 1000,
            Content::ToolUse { name, input, .. } => estimate_tokens(name) + estimate_tokens(&input.to_string()) + 8,
            Content::ToolResult { content, .. } => estimate_tokens(content) + 8,
            Content::Resource { uri, text, .. } => {
                estimate_tokens(uri) + text.as_deref().map(estimate_tokens).unwrap_or(0)
            }
        })
        .sum()
}

pub fn total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(message_tokens).sum()
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_context_tokens: usize,
    pub system_prompt_tokens: usize,
    pub keep_recent: usize,
    pub keep_first: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 100_000,
            system_prompt_tokens: 4_000,
            keep_recent: 10,
            keep_first: 2,
        }
    }
}

/// Seam for context compaction. The loop calls this before every LLM
/// request; a host may supply a summarizing compactor instead of the
/// default truncation.
pub trait Compactor: Send + Sync {
    fn compact(&self, messages: Vec<Message>) -> Vec<Message>;
}

pub struct DefaultCompaction {
    pub config: ContextConfig,
}

impl DefaultCompaction {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }
}

impl Compactor for DefaultCompaction {
    fn compact(&self, messages: Vec<Message>) -> Vec<Message> {
        truncate_messages(messages, &self.config)
    }
}

fn truncation_marker(session_id: &str, index: u64, removed: usize) -> Message {
    Message::User {
        session_id: session_id.to_string(),
        index,
        content: vec![Content::text(format!(
            "[Context truncated: {} messages removed to fit context window]",
            removed
        ))],
        timestamp: now_ms(),
    }
}

/// Keep first N + last M messages, drop the middle; fall back to a
/// walk-backward-from-the-end fit if even first+recent overflow the budget.
pub fn truncate_messages(messages: Vec<Message>, config: &ContextConfig) -> Vec<Message> {
    let available = config.max_context_tokens.saturating_sub(config.system_prompt_tokens);
    let current = total_tokens(&messages);

    if current <= available {
        return messages;
    }

    let len = messages.len();
    if len <= config.keep_first + config.keep_recent {
        return messages;
    }

    let first_end = config.keep_first.min(len);
    let recent_start = len.saturating_sub(config.keep_recent);

    if first_end >= recent_start {
        return messages;
    }

    let session_id = messages[0].session_id().to_string();
    let marker_index = messages[recent_start].index();

    let first_msgs = &messages[..first_end];
    let recent_msgs = &messages[recent_start..];

    let first_tokens: usize = first_msgs.iter().map(message_tokens).sum();
    let recent_tokens: usize = recent_msgs.iter().map(message_tokens).sum();
    let marker_tokens = 20;

    if first_tokens + recent_tokens + marker_tokens <= available {
        let mut result = first_msgs.to_vec();
        let removed = recent_start - first_end;
        result.push(truncation_marker(&session_id, marker_index, removed));
        result.extend_from_slice(recent_msgs);
        return result;
    }

    let mut result = Vec::new();
    let mut budget = available;

    for msg in messages.iter().rev() {
        let tokens = message_tokens(msg);
        if tokens > budget {
            break;
        }
        budget -= tokens;
        result.push(msg.clone());
    }

    result.reverse();

    if result.len() < messages.len() {
        let removed = messages.len() - result.len();
        let idx = result.first().map(|m| m.index()).unwrap_or(0);
        result.insert(0, truncation_marker(&session_id, idx, removed));
    }

    result
}

// ---------------------------------------------------------------------------
// Execution bounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub max_turns: usize,
    pub max_total_tokens: usize,
    pub max_duration: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_total_tokens: 1_000_000,
            max_duration: Duration::from_secs(600),
        }
    }
}

pub struct ExecutionTracker {
    pub limits: ExecutionLimits,
    pub turns: usize,
    pub tokens_used: usize,
    pub started_at: Instant,
}

impl ExecutionTracker {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            turns: 0,
            tokens_used: 0,
            started_at: Instant::now(),
        }
    }

    pub fn record_turn(&mut self, tokens: usize) {
        self.turns += 1;
        self.tokens_used += tokens;
    }

    /// Returns the reason the first exceeded limit, if any.
    pub fn check_limits(&self) -> Option<String> {
        if self.turns >= self.limits.max_turns {
            return Some(format!("max turns reached ({}/{})", self.turns, self.limits.max_turns));
        }
        if self.tokens_used >= self.limits.max_total_tokens {
            return Some(format!(
                "max tokens reached ({}/{})",
                self.tokens_used, self.limits.max_total_tokens
            ));
        }
        let elapsed = self.started_at.elapsed();
        if elapsed >= self.limits.max_duration {
            return Some(format!(
                "max duration reached ({:.0}s/{:.0}s)",
                elapsed.as_secs_f64(),
                self.limits.max_duration.as_secs_f64()
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_msg(session: &str, index: u64, text: &str) -> Message {
        Message::User {
            session_id: session.to_string(),
            index,
            content: vec![Content::text(text)],
            timestamp: 0,
        }
    }

    #[test]
    fn estimate_tokens_nonzero_for_nonempty() {
        assert!(estimate_tokens("hello world") > 0);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn truncate_within_budget_is_noop() {
        let messages = vec![user_msg("s", 0, "Hello"), user_msg("s", 1, "World")];
        let config = ContextConfig::default();
        let result = truncate_messages(messages.clone(), &config);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn truncate_drops_middle_and_inserts_marker() {
        let mut messages = Vec::new();
        for i in 0..100u64 {
            messages.push(user_msg("s", i, &format!("Message {i} {}", "x".repeat(200))));
        }
        let config = ContextConfig {
            max_context_tokens: 500,
            system_prompt_tokens: 100,
            keep_recent: 5,
            keep_first: 2,
        };
        let result = truncate_messages(messages, &config);
        assert!(result.len() < 100);
        assert!(result.len() >= 2);
    }

    #[test]
    fn execution_limits_trip_on_turns() {
        let limits = ExecutionLimits {
            max_turns: 3,
            max_total_tokens: 1000,
            max_duration: Duration::from_secs(60),
        };
        let mut tracker = ExecutionTracker::new(limits);
        assert!(tracker.check_limits().is_none());
        tracker.record_turn(100);
        tracker.record_turn(100);
        assert!(tracker.check_limits().is_none());
        tracker.record_turn(100);
        assert!(tracker.check_limits().is_some());
    }

    #[test]
    fn default_compaction_delegates_to_truncate() {
        let compactor = DefaultCompaction::new(ContextConfig {
            max_context_tokens: 50,
            system_prompt_tokens: 0,
            keep_recent: 1,
            keep_first: 1,
        });
        let mut messages = Vec::new();
        for i in 0..20u64 {
            messages.push(user_msg("s", i, &"x".repeat(100)));
        }
        let result = compactor.compact(messages);
        assert!(result.len() < 20);
    }
}
