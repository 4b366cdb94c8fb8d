//! Subagent flavor of a background task's `fn`: a nested `run_loop` whose
//! events are drained into the task's output buffer instead of forwarded
//! live, with the final assistant text extracted as the terminal output.
//! Grounded in the teacher's `SubAgentTool` (`sub_agent.rs`): fresh context,
//! its own tool set, the parent's cancellation forwarded in.

use super::TaskRunError;
use crate::agent_loop::{run_loop, RunLoopConfig};
use crate::types::{Content, Message, ResultSubtype};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

/// Builds the closure `TaskManager::launch` expects: run `prompt` through a
/// fresh agent loop configured by `config`, collecting its transcript and
/// returning the last non-empty assistant text as the task's output.
pub fn subagent_task(prompt: String, config: RunLoopConfig) -> impl FnOnce(CancellationToken) -> super::TaskFuture {
    move |cancel: CancellationToken| {
        Box::pin(async move {
            let query = run_loop(prompt, config, cancel);
            let mut stream = query.messages();
            let mut final_text = String::new();
            let mut subtype = None;
            let mut errors: Vec<String> = Vec::new();

            while let Some(message) = stream.next().await {
                match message {
                    Message::Assistant { content, .. } => {
                        let text: Vec<String> = content
                            .iter()
                            .filter_map(|c| match c {
                                Content::Text { text } => Some(text.clone()),
                                _ => None,
                            })
                            .collect();
                        if !text.is_empty() {
                            final_text = text.join("\n");
                        }
                    }
                    Message::Result { info, .. } => {
                        subtype = Some(info.subtype);
                        errors = info.errors;
                    }
                    _ => {}
                }
            }
            query.wait().await;

            match subtype {
                Some(ResultSubtype::Cancelled) => (final_text, Some(TaskRunError::Cancelled)),
                Some(ResultSubtype::Success) => (final_text, None),
                Some(ResultSubtype::Error) | Some(ResultSubtype::MaxTurns) => {
                    let message = if errors.is_empty() {
                        "subagent did not complete successfully".to_string()
                    } else {
                        errors.join("; ")
                    };
                    (final_text, Some(TaskRunError::Other(message)))
                }
                None => (final_text, Some(TaskRunError::Other("subagent produced no result".into()))),
            }
        })
    }
}
