//! The core agent loop: a bounded tool-dispatch state machine cycling
//! `AwaitingModel -> Assistant -> Dispatching -> Gathering -> AwaitingModel`
//! until the model stops requesting tools, a limit trips, or the run is
//! cancelled. Turn-sequencing and event-emission shape are kept from the
//! teacher's `run_loop`/`execute_tool_calls`; tool dispatch is generalized
//! from sequential to parallel (`spec.md` §4.1 step 3), and results are
//! folded into a single aggregate `user` message instead of one message per
//! tool (§4.1 step 4, §8 tool-result correspondence).

use crate::context::{Compactor, ExecutionLimits, ExecutionTracker};
use crate::hooks::Hooks;
use crate::ids;
use crate::llm::{LlmClient, LlmError, LlmRequest};
use crate::permissions::{PermissionDecision, Permissions};
use crate::prompter::Prompter;
use crate::query::{LoopStats, Query};
use crate::registry::ToolRegistry;
use crate::tool::{ToolContext, ToolOutcome};
use crate::types::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Supplies queued messages that should be folded in before the next model
/// call — mid-run steering interruptions or post-completion follow-ups.
/// Out of scope: how those messages get queued (mailbox, CLI, etc.); only
/// the pull side lives here.
pub type MessageSource = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

pub struct RunLoopConfig {
    pub llm: Arc<dyn LlmClient>,
    pub model: String,
    pub cwd: String,
    pub os: String,
    pub current_date: String,
    pub tool_registry: Arc<ToolRegistry>,
    pub permissions: Arc<dyn Permissions>,
    pub hooks: Hooks,
    pub compactor: Option<Arc<dyn Compactor>>,
    pub prompter: Arc<dyn Prompter>,
    pub thinking_level: ThinkingLevel,
    pub cache_config: CacheConfig,
    pub cost_config: CostConfig,
    pub max_tokens: Option<u32>,
    pub max_turns: usize,
    pub execution_limits: Option<ExecutionLimits>,
    pub get_steering_messages: Option<MessageSource>,
    pub get_follow_up_messages: Option<MessageSource>,
    pub mcp_servers: Vec<String>,
}

impl RunLoopConfig {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            llm,
            model: model.into(),
            cwd: ".".into(),
            os: std::env::consts::OS.into(),
            current_date: String::new(),
            tool_registry,
            permissions: Arc::new(crate::permissions::AllowAll),
            hooks: Hooks::default(),
            compactor: None,
            prompter: Arc::new(crate::prompter::StaticPrompter(String::new())),
            thinking_level: ThinkingLevel::Off,
            cache_config: CacheConfig::default(),
            cost_config: CostConfig::default(),
            max_tokens: None,
            max_turns: 50,
            execution_limits: None,
            get_steering_messages: None,
            get_follow_up_messages: None,
            mcp_servers: Vec::new(),
        }
    }
}

/// Start a new run. Returns immediately with a `Query` handle; the loop
/// itself runs on a spawned task.
pub fn run_loop(prompt: impl Into<String>, config: RunLoopConfig, cancel: CancellationToken) -> Query {
    let session_id = ids::session_id();
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(LoopStats::default());
    let prompt_text = prompt.into();

    let join_stats = stats.clone();
    let join_session = session_id.clone();
    let handle = tokio::spawn(async move {
        drive(join_session, prompt_text, config, tx, cancel, join_stats).await;
    });

    Query {
        session_id,
        rx: std::sync::Mutex::new(Some(rx)),
        join: std::sync::Mutex::new(Some(handle)),
        stats,
    }
}

fn next(index: &mut u64) -> u64 {
    let i = *index;
    *index += 1;
    i
}

async fn drive(
    session_id: String,
    prompt: String,
    config: RunLoopConfig,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    stats: Arc<LoopStats>,
) {
    let mut index: u64 = 0;

    let system_prompt = config.prompter.system_prompt(&config.cwd, &config.os, &config.current_date);
    let tool_names = config.tool_registry.names();

    let _ = tx.send(Message::SystemInit {
        session_id: session_id.clone(),
        index: next(&mut index),
        cwd: config.cwd.clone(),
        model: config.model.clone(),
        tools: tool_names,
        mcp_servers: config.mcp_servers.clone(),
        timestamp: now_ms(),
    });

    let mut messages: Vec<Message> = vec![Message::User {
        session_id: session_id.clone(),
        index: next(&mut index),
        content: vec![Content::text(prompt)],
        timestamp: now_ms(),
    }];
    if tx.send(messages[0].clone()).is_err() {
        return;
    }

    let mut tracker = ExecutionTracker::new(ExecutionLimits {
        max_turns: config.max_turns,
        ..config.execution_limits.clone().unwrap_or_default()
    });

    loop {
        if let Some(steering) = config.get_steering_messages.as_ref().map(|f| f()) {
            for text in steering {
                let msg = Message::User {
                    session_id: session_id.clone(),
                    index: next(&mut index),
                    content: vec![Content::text(text)],
                    timestamp: now_ms(),
                };
                messages.push(msg.clone());
                if tx.send(msg).is_err() {
                    return;
                }
            }
        }

        if cancel.is_cancelled() {
            emit_result(&tx, &session_id, &mut index, &stats, ResultSubtype::Cancelled, true, vec![]);
            return;
        }

        if let Some(reason) = tracker.check_limits() {
            warn!(%reason, "execution limit reached");
            emit_result(&tx, &session_id, &mut index, &stats, ResultSubtype::MaxTurns, false, vec![reason]);
            return;
        }

        if let Some(compactor) = &config.compactor {
            messages = compactor.compact(std::mem::take(&mut messages));
        }

        // --- Assistant ---
        let request = LlmRequest {
            model: config.model.clone(),
            system_prompt: system_prompt.clone(),
            messages: messages.clone(),
            tools: config.tool_registry.export_for_llm(),
            thinking_level: config.thinking_level,
            cache_config: config.cache_config.clone(),
            max_tokens: config.max_tokens,
        };

        let response = match config.llm.complete(request, cancel.clone()).await {
            Ok(r) => r,
            Err(LlmError::Cancelled) => {
                emit_result(&tx, &session_id, &mut index, &stats, ResultSubtype::Cancelled, true, vec![]);
                return;
            }
            Err(e) => {
                let assistant = Message::Assistant {
                    session_id: session_id.clone(),
                    index: next(&mut index),
                    content: vec![],
                    stop_reason: StopReason::Error,
                    model: config.model.clone(),
                    usage: Usage::default(),
                    timestamp: now_ms(),
                    error_message: Some(e.to_string()),
                };
                let _ = tx.send(assistant);
                emit_result(&tx, &session_id, &mut index, &stats, ResultSubtype::Error, true, vec![e.to_string()]);
                return;
            }
        };

        let assistant = Message::Assistant {
            session_id: session_id.clone(),
            index: next(&mut index),
            content: response.content.clone(),
            stop_reason: response.stop_reason,
            model: response.model.clone(),
            usage: response.usage,
            timestamp: now_ms(),
            error_message: None,
        };
        messages.push(assistant.clone());
        stats.turn_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        stats.total_usage.lock().unwrap().add(&response.usage);
        *stats.total_cost_usd.lock().unwrap() += config.cost_config.cost_usd(&response.usage);
        tracker.record_turn(response.usage.total() as usize);
        if tx.send(assistant.clone()).is_err() {
            return;
        }

        if matches!(response.stop_reason, StopReason::Error | StopReason::Aborted) {
            let subtype = if response.stop_reason == StopReason::Aborted {
                ResultSubtype::Cancelled
            } else {
                ResultSubtype::Error
            };
            emit_result(&tx, &session_id, &mut index, &stats, subtype, true, vec![]);
            return;
        }

        let tool_uses: Vec<(String, String, serde_json::Value)> = assistant
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();

        if tool_uses.is_empty() {
            if let Some(follow_ups) = config.get_follow_up_messages.as_ref().map(|f| f()) {
                if !follow_ups.is_empty() {
                    for text in follow_ups {
                        let msg = Message::User {
                            session_id: session_id.clone(),
                            index: next(&mut index),
                            content: vec![Content::text(text)],
                            timestamp: now_ms(),
                        };
                        messages.push(msg.clone());
                        if tx.send(msg).is_err() {
                            return;
                        }
                    }
                    continue;
                }
            }
            emit_result(&tx, &session_id, &mut index, &stats, ResultSubtype::Success, false, vec![]);
            return;
        }

        // --- Dispatching & Gathering ---
        // Poll steering once more here: messages that arrived while the model
        // call above was in flight still need to preempt the tool calls it
        // just returned. Polled exactly once (drain/pop semantics mean a
        // second call would silently lose whatever the first one returned),
        // injected as a user message immediately, then passed into
        // `dispatch_tools` as the skip decision.
        let mid_turn_steering = config.get_steering_messages.as_ref().map(|f| f()).unwrap_or_default();
        let preempted = !mid_turn_steering.is_empty();
        for text in mid_turn_steering {
            let msg = Message::User {
                session_id: session_id.clone(),
                index: next(&mut index),
                content: vec![Content::text(text)],
                timestamp: now_ms(),
            };
            messages.push(msg.clone());
            if tx.send(msg).is_err() {
                return;
            }
        }

        let outcome = dispatch_tools(&config, &tool_uses, &cancel, preempted).await;
        let result_content: Vec<Content> = tool_uses
            .iter()
            .zip(outcome.iter())
            .map(|((id, _, _), outcome)| Content::ToolResult {
                tool_use_id: id.clone(),
                content: outcome.content.clone(),
                is_error: outcome.is_error,
            })
            .collect();

        let result_msg = Message::User {
            session_id: session_id.clone(),
            index: next(&mut index),
            content: result_content,
            timestamp: now_ms(),
        };
        messages.push(result_msg.clone());
        if tx.send(result_msg).is_err() {
            return;
        }
    }
}

/// Runs every tool call in the turn concurrently, preserving the input
/// ordering in the returned vector regardless of completion order — each
/// call's outcome lands at its own index because every spawned task is
/// joined positionally, not in completion order.
///
/// `preempted` is decided by the caller from a single poll of
/// `get_steering_messages` (see `drive`) — this function never calls it
/// itself, since the source has drain/pop semantics and a second call would
/// throw away whatever it returned.
async fn dispatch_tools(
    config: &RunLoopConfig,
    tool_uses: &[(String, String, serde_json::Value)],
    cancel: &CancellationToken,
    preempted: bool,
) -> Vec<ToolOutcome> {
    // A steering message mid-turn preempts the rest of this batch: every
    // call in the batch is skipped rather than half-executed, matching the
    // "human messages preempt tool calls" rule this crate borrows from
    // priority-queue agent loops.
    if preempted {
        return tool_uses
            .iter()
            .map(|_| ToolOutcome::error("skipped: a new message preempted this turn"))
            .collect();
    }

    let futures = tool_uses.iter().map(|(tool_use_id, name, input)| {
        let tool_use_id = tool_use_id.clone();
        let name = name.clone();
        let input = input.clone();
        let cwd = config.cwd.clone();
        let cancel = cancel.child_token();
        let registry = config.tool_registry.clone();
        let permissions = config.permissions.clone();
        let hooks = config.hooks.clone();
        async move { run_one_tool(registry, permissions, hooks, tool_use_id, name, input, cwd, cancel).await }
    });

    futures::future::join_all(futures).await
}

async fn run_one_tool(
    registry: Arc<ToolRegistry>,
    permissions: Arc<dyn Permissions>,
    hooks: Hooks,
    tool_use_id: String,
    name: String,
    input: serde_json::Value,
    cwd: String,
    cancel: CancellationToken,
) -> ToolOutcome {
    hooks.run_before(&name, &input);

    let Some(tool) = registry.get(&name) else {
        let outcome = ToolOutcome::error(format!("tool not found: {name}"));
        hooks.run_after(&name, &outcome);
        return outcome;
    };

    match permissions.check(&name, &input).await {
        PermissionDecision::Deny(reason) => {
            let outcome = ToolOutcome::error(format!("permission denied: {reason}"));
            hooks.run_after(&name, &outcome);
            return outcome;
        }
        PermissionDecision::Ask => {
            let outcome = ToolOutcome::error("permission required but no prompter is wired");
            hooks.run_after(&name, &outcome);
            return outcome;
        }
        PermissionDecision::Allow => {}
    }

    let ctx = ToolContext { tool_use_id, cwd, cancel };
    let outcome = match tool.execute(&ctx, input).await {
        Ok(outcome) => outcome,
        Err(e) => ToolOutcome::error(e.to_string()),
    };
    hooks.run_after(&name, &outcome);
    outcome
}

fn emit_result(
    tx: &mpsc::UnboundedSender<Message>,
    session_id: &str,
    index: &mut u64,
    stats: &Arc<LoopStats>,
    subtype: ResultSubtype,
    is_error: bool,
    errors: Vec<String>,
) {
    let i = *index;
    *index += 1;
    let total_cost_usd = *stats.total_cost_usd.lock().unwrap();
    let _ = tx.send(Message::Result {
        session_id: session_id.to_string(),
        index: i,
        info: ResultInfo {
            num_turns: stats.turn_count.load(std::sync::atomic::Ordering::Acquire),
            total_cost_usd,
            is_error,
            errors,
            subtype,
        },
        timestamp: now_ms(),
    });
}
