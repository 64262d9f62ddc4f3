//! Context reduction: a conversation summary plus the subset of attached
//! files worth sending with the request.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::completion::{
    self, CompletionBackend, CompletionRequest, FileMap, Message, Role, Usage, display_path,
};
use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileSelection {
    pub files: FileMap,
    pub usage: Usage,
}

/// `model` and `provider` name the credentials to spend on the reduction.
pub trait ContextReducer: Send + Sync {
    fn summarize<'a>(
        &'a self,
        conversation: &'a [Message],
        model: &'a str,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<Summary, GatewayError>>;

    fn select_files<'a>(
        &'a self,
        conversation: &'a [Message],
        files: &'a FileMap,
        summary: Option<&'a str>,
        model: &'a str,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<FileSelection, GatewayError>>;
}

/// Clamp a selection to keys that exist in `available`, taking values from
/// `available` so contents are never altered.
pub fn restrict_to(selected: &FileMap, available: &FileMap) -> FileMap {
    selected
        .keys()
        .filter_map(|path| {
            available
                .get_key_value(path)
                .map(|(k, v)| (k.clone(), v.clone()))
        })
        .collect()
}

const SUMMARY_PROMPT: &str = "You are a software engineer. Summarize the conversation below so \
another engineer can continue the work: the user's goal, decisions made, the current state of \
the code and what remains. Reply with the summary only.";

const SELECT_PROMPT: &str = "You are a software engineer. From the file list below, pick the \
files needed to answer the user's latest request. Reply with the chosen paths only, one per \
line, copied exactly from the list. Reply with nothing if no file is needed.";

/// Reducer that asks a model through any [`CompletionBackend`].
pub struct CompletionReducer {
    backend: Arc<dyn CompletionBackend>,
    max_tokens: u32,
}

impl CompletionReducer {
    pub fn new(backend: Arc<dyn CompletionBackend>, max_tokens: u32) -> Self {
        Self {
            backend,
            max_tokens,
        }
    }

    async fn ask(
        &self,
        system: &str,
        user: String,
        model: &str,
        provider: &str,
    ) -> Result<(String, Usage), GatewayError> {
        let mut req =
            CompletionRequest::new(vec![Message::user(user)], model, provider, self.max_tokens);
        req.system_prompt = Some(system.to_string());
        let source = self.backend.open(req).await?;
        completion::collect_text(source).await
    }
}

fn transcript(conversation: &[Message]) -> String {
    conversation
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let who = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            format!("[{who}]\n{}\n", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Match model-chosen lines back to real paths. Lines may come back with
/// list markers, quotes, or without the work-dir prefix.
fn parse_selection(reply: &str, files: &FileMap) -> FileMap {
    let mut chosen = FileMap::new();
    for line in reply.lines() {
        let line = line
            .trim()
            .trim_start_matches(['-', '*', ' '])
            .trim_matches(['`', '"', '\''])
            .trim();
        if line.is_empty() {
            continue;
        }
        if let Some((path, content)) = files
            .iter()
            .find(|(path, _)| path.as_str() == line || display_path(path) == line)
        {
            chosen.insert(path.clone(), content.clone());
        }
    }
    chosen
}

impl ContextReducer for CompletionReducer {
    fn summarize<'a>(
        &'a self,
        conversation: &'a [Message],
        model: &'a str,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<Summary, GatewayError>> {
        Box::pin(async move {
            let (text, usage) = self
                .ask(SUMMARY_PROMPT, transcript(conversation), model, provider)
                .await?;
            Ok(Summary { text, usage })
        })
    }

    fn select_files<'a>(
        &'a self,
        conversation: &'a [Message],
        files: &'a FileMap,
        summary: Option<&'a str>,
        model: &'a str,
        provider: &'a str,
    ) -> BoxFuture<'a, Result<FileSelection, GatewayError>> {
        Box::pin(async move {
            let listing = files
                .keys()
                .map(|p| display_path(p.as_str()))
                .collect::<Vec<_>>()
                .join("\n");
            let request = conversation
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            let user = format!(
                "FILES:\n{listing}\n\nSUMMARY:\n{}\n\nLATEST REQUEST:\n{request}",
                summary.unwrap_or("(none)")
            );

            let (reply, usage) = self.ask(SELECT_PROMPT, user, model, provider).await?;
            Ok(FileSelection {
                files: parse_selection(&reply, files),
                usage,
            })
        })
    }
}
