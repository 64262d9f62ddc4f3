pub mod http;
pub mod registry;

use std::collections::BTreeMap;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;

/// Attached project files, path → content.
pub type FileMap = BTreeMap<String, String>;

/// Root of the client's virtual project; stripped from paths shown back to it.
pub const WORK_DIR: &str = "/home/project";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Token counts as reported by one provider response. Any field may be
/// missing; consumers treat missing as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// Why a single invocation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    /// Truncated by the max-token limit. The only reason that triggers continuation.
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
    Unknown,
}

impl FinishReason {
    /// Map an OpenAI-style `finish_reason` string.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "tool_calls" | "function_call" | "tool_use" => Self::ToolCalls,
            "error" => Self::Error,
            "" => Self::Unknown,
            _ => Self::Other,
        }
    }
}

/// One item of a completion source.
#[derive(Debug)]
pub enum CompletionEvent {
    TextDelta(String),
    ReasoningDelta(String),
    Usage(Usage),
    Finish(FinishReason),
    Error(GatewayError),
}

/// One model invocation's output: lazy, single-pass, not restartable.
/// Dropping it cancels the underlying request.
pub type CompletionSource = BoxStream<'static, CompletionEvent>;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub provider: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    /// Conversation summary from the context reducer.
    pub summary: Option<String>,
    /// Reduced file context from the context reducer.
    pub context_files: Option<FileMap>,
    /// With a summary present, only `messages[message_slice_id..]` are sent.
    pub message_slice_id: usize,
    pub cancellation_token: CancellationToken,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>, model: &str, provider: &str, max_tokens: u32) -> Self {
        Self {
            messages,
            model: model.to_string(),
            provider: provider.to_string(),
            max_tokens,
            system_prompt: None,
            summary: None,
            context_files: None,
            message_slice_id: 0,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Messages as they go over the wire: a leading system message folding in
    /// the system prompt, summary and file context, then the conversation
    /// tail.
    pub fn wire_messages(&self) -> Vec<Message> {
        let mut system = self.system_prompt.clone().unwrap_or_default();

        if let Some(ref summary) = self.summary {
            system.push_str("\n\nCHAT SUMMARY (previous conversation):\n---\n");
            system.push_str(summary);
            system.push_str("\n---");
        }
        if let Some(ref files) = self.context_files {
            system.push_str("\n\nCONTEXT BUFFER (files relevant to the request):\n---\n");
            for (path, content) in files {
                system.push_str(&format!("<file path=\"{path}\">\n{content}\n</file>\n"));
            }
            system.push_str("---");
        }

        let tail = if self.summary.is_some() {
            let start = self.message_slice_id.min(self.messages.len());
            &self.messages[start..]
        } else {
            &self.messages[..]
        };

        let mut out = Vec::with_capacity(tail.len() + 1);
        let system = system.trim();
        if !system.is_empty() {
            out.push(Message {
                id: None,
                role: Role::System,
                content: system.to_string(),
            });
        }
        out.extend(tail.iter().cloned());
        out
    }
}

/// Opens completion sources. Implemented by the provider registry and by
/// test doubles.
pub trait CompletionBackend: Send + Sync {
    fn open(&self, req: CompletionRequest) -> BoxFuture<'_, Result<CompletionSource, GatewayError>>;

    /// Fast pre-flight check that `provider` has usable credentials, so
    /// credential problems surface as a status code instead of mid-stream.
    fn ensure_credentials(&self, _provider: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// Drain a source into its full text and last usage report.
/// Used where nothing needs to be streamed (summaries, file selection).
pub async fn collect_text(mut source: CompletionSource) -> Result<(String, Usage), GatewayError> {
    let mut text = String::new();
    let mut usage = Usage::default();
    while let Some(event) = source.next().await {
        match event {
            CompletionEvent::TextDelta(delta) => text.push_str(&delta),
            CompletionEvent::Usage(u) => usage = u,
            CompletionEvent::Error(e) => return Err(e),
            CompletionEvent::ReasoningDelta(_) | CompletionEvent::Finish(_) => {}
        }
    }
    Ok((text, usage))
}

/// Drop the virtual work-dir prefix from a path shown to the client.
pub fn display_path(path: &str) -> &str {
    path.strip_prefix(WORK_DIR).unwrap_or(path)
}
