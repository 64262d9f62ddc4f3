//! Per-request streaming session: drives completion sources into one
//! outward frame sequence and continues truncated responses.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::completion::{
    CompletionBackend, CompletionRequest, FileMap, FinishReason, Message, Role, display_path,
};
use crate::error::GatewayError;
use crate::reducer::{self, ContextReducer};
use crate::stream::{
    Annotation, Frame, ProgressEvent, ProgressStatus, SegmentOutcome, SwitchableStream,
};
use crate::usage::UsageAccumulator;

pub const CONTINUE_PROMPT: &str = "Continue your prior response. IMPORTANT: Immediately begin from where you left off without any interruptions.\nDo not repeat any content, including artifact and action tags.";

pub const DEFAULT_MAX_RESPONSE_SEGMENTS: u32 = 2;
pub const DEFAULT_MAX_TOKENS: u32 = 8000;

/// Frames buffered between the session task and the response body.
const FRAME_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Continuations allowed after the first invocation.
    pub max_response_segments: u32,
    /// Per-invocation output token limit.
    pub max_tokens: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_response_segments: DEFAULT_MAX_RESPONSE_SEGMENTS,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// One chat request as the session sees it.
#[derive(Debug, Clone, Default)]
pub struct ChatTurn {
    pub messages: Vec<Message>,
    pub files: FileMap,
    pub context_optimization: bool,
    pub model: String,
    pub provider: String,
    pub system_prompt: Option<String>,
}

/// Pull `[Model: …]` and `[Provider: …]` markers out of a message.
pub fn extract_properties(message: &Message) -> (Option<String>, Option<String>) {
    (
        marker(&message.content, "[Model: "),
        marker(&message.content, "[Provider: "),
    )
}

fn marker(content: &str, open: &str) -> Option<String> {
    let start = content.find(open)? + open.len();
    let len = content[start..].find(']')?;
    let value = content[start..start + len].trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[derive(Debug)]
pub enum SessionState {
    Generating,
    Continuing { partial: String },
    Done { finish: FinishReason },
    Failed(GatewayError),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed(_))
    }
}

#[derive(Debug)]
pub struct SessionReport {
    /// Always `Done` or `Failed`.
    pub state: SessionState,
    pub usage: UsageAccumulator,
    pub switches: u32,
}

pub struct StreamSession {
    messages: Vec<Message>,
    files: FileMap,
    context_optimization: bool,
    model: String,
    provider: String,
    system_prompt: Option<String>,
    config: SessionConfig,
    backend: Arc<dyn CompletionBackend>,
    reducer: Option<Arc<dyn ContextReducer>>,
    stream: SwitchableStream,
    usage: UsageAccumulator,
    progress: u32,
    cancel: CancellationToken,
    message_id: String,
    summary: Option<String>,
    context_files: Option<FileMap>,
    message_slice_id: usize,
}

impl StreamSession {
    pub fn new(
        turn: ChatTurn,
        config: SessionConfig,
        backend: Arc<dyn CompletionBackend>,
        stream: SwitchableStream,
        cancel: CancellationToken,
    ) -> Self {
        let message_slice_id = turn.messages.len().saturating_sub(3);
        Self {
            messages: turn.messages,
            files: turn.files,
            context_optimization: turn.context_optimization,
            model: turn.model,
            provider: turn.provider,
            system_prompt: turn.system_prompt,
            config,
            backend,
            reducer: None,
            stream,
            usage: UsageAccumulator::default(),
            progress: 1,
            cancel,
            message_id: uuid::Uuid::new_v4().to_string(),
            summary: None,
            context_files: None,
            message_slice_id,
        }
    }

    /// Session plus the frame receiver the transport drains.
    pub fn channel(
        turn: ChatTurn,
        config: SessionConfig,
        backend: Arc<dyn CompletionBackend>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (stream, rx) = SwitchableStream::channel(FRAME_BUFFER, cancel.clone());
        (Self::new(turn, config, backend, stream, cancel), rx)
    }

    pub fn with_reducer(mut self, reducer: Arc<dyn ContextReducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    /// Drive the session to a terminal state, then close the outward stream.
    pub async fn run(mut self) -> SessionReport {
        let mut state = match self.start().await {
            Ok(()) => SessionState::Generating,
            Err(e) => SessionState::Failed(e),
        };

        while !state.is_terminal() {
            state = match state {
                SessionState::Generating => self.generate().await,
                SessionState::Continuing { partial } => match self.continue_with(partial).await {
                    Ok(()) => SessionState::Generating,
                    Err(e) => SessionState::Failed(e),
                },
                terminal => terminal,
            };
        }

        if let SessionState::Done { finish } = state
            && let Err(e) = self.complete(finish).await
        {
            state = SessionState::Failed(e);
        }
        if let SessionState::Failed(ref e) = state {
            self.report_failure(e).await;
        }
        self.stream.close();

        tracing::info!(
            model = %self.model,
            provider = %self.provider,
            switches = self.stream.switches(),
            total_tokens = self.usage.total_tokens,
            "chat session finished"
        );

        SessionReport {
            state,
            usage: self.usage,
            switches: self.stream.switches(),
        }
    }

    async fn start(&mut self) -> Result<(), GatewayError> {
        self.stream
            .send(Frame::MessageStart {
                message_id: self.message_id.clone(),
            })
            .await?;

        if self.context_optimization
            && !self.files.is_empty()
            && let Some(reducer) = self.reducer.clone()
        {
            self.reduce(reducer.as_ref()).await?;
        }

        self.emit_progress("response", ProgressStatus::InProgress, "Generating Response")
            .await
    }

    /// Summary and file selection. Each phase is closed with a complete
    /// progress event even when it fails; reducer failures are logged and
    /// the session proceeds without that phase's output. Only cancellation
    /// and sink failures propagate.
    async fn reduce(&mut self, reducer: &dyn ContextReducer) -> Result<(), GatewayError> {
        self.emit_progress("summary", ProgressStatus::InProgress, "Analysing Request")
            .await?;
        let summarized = cancellable(
            &self.cancel,
            reducer.summarize(&self.messages, &self.model, &self.provider),
        )
        .await;
        match summarized {
            Ok(summary) => {
                self.usage.add(&summary.usage);
                self.emit_progress("summary", ProgressStatus::Complete, "Analysis Complete")
                    .await?;
                let chat_id = self.messages.last().and_then(|m| m.id.clone());
                self.stream
                    .send(Frame::Annotation(Annotation::ChatSummary {
                        summary: summary.text.clone(),
                        chat_id,
                    }))
                    .await?;
                self.summary = Some(summary.text);
            }
            Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "conversation summary failed, continuing without it");
                self.emit_progress("summary", ProgressStatus::Complete, "Analysis Skipped")
                    .await?;
            }
        }

        self.emit_progress(
            "context",
            ProgressStatus::InProgress,
            "Determining Files to Read",
        )
        .await?;
        let selected = cancellable(
            &self.cancel,
            reducer.select_files(
                &self.messages,
                &self.files,
                self.summary.as_deref(),
                &self.model,
                &self.provider,
            ),
        )
        .await;
        let selection = match selected {
            Ok(selection) => selection,
            Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "file selection failed, sending full context");
                return self
                    .emit_progress("context", ProgressStatus::Complete, "Using All Files")
                    .await;
            }
        };
        self.usage.add(&selection.usage);

        let files = reducer::restrict_to(&selection.files, &self.files);
        tracing::debug!(selected = files.len(), offered = self.files.len(), "code files selected");
        self.stream
            .send(Frame::Annotation(Annotation::CodeContext {
                files: files.keys().map(|p| display_path(p).to_string()).collect(),
            }))
            .await?;
        self.context_files = Some(files);
        self.emit_progress("context", ProgressStatus::Complete, "Code Files Selected")
            .await
    }

    async fn generate(&mut self) -> SessionState {
        let outcome = match self.invoke().await {
            Ok(outcome) => outcome,
            Err(e) => return SessionState::Failed(e),
        };
        self.usage.add(&outcome.usage);

        if outcome.finish != FinishReason::Length {
            return SessionState::Done {
                finish: outcome.finish,
            };
        }

        let switches = self.stream.switches();
        if switches >= self.config.max_response_segments {
            return SessionState::Failed(GatewayError::SegmentLimitExceeded {
                max: self.config.max_response_segments,
            });
        }

        tracing::info!(
            switches,
            max = self.config.max_response_segments,
            "reached max token limit, continuing message"
        );
        SessionState::Continuing {
            partial: outcome.text,
        }
    }

    async fn invoke(&mut self) -> Result<SegmentOutcome, GatewayError> {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let request = self.request();
        let source = cancellable(&self.cancel, self.backend.open(request)).await?;
        self.stream.bind(source);
        self.stream.forward().await
    }

    async fn continue_with(&mut self, partial: String) -> Result<(), GatewayError> {
        let (model, provider) = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(extract_properties)
            .unwrap_or_default();
        let model = model.unwrap_or_else(|| self.model.clone());
        let provider = provider.unwrap_or_else(|| self.provider.clone());

        self.messages.push(Message::assistant(partial));
        self.messages.push(Message::user(format!(
            "[Model: {model}]\n\n[Provider: {provider}]\n\n{CONTINUE_PROMPT}"
        )));

        self.emit_usage().await?;
        self.emit_progress("response", ProgressStatus::InProgress, "Continuing Response")
            .await
    }

    async fn complete(&mut self, finish: FinishReason) -> Result<(), GatewayError> {
        self.emit_usage().await?;
        self.emit_progress("response", ProgressStatus::Complete, "Response Generated")
            .await?;
        let usage = self.usage;
        self.stream
            .send(Frame::Finish {
                finish_reason: finish,
                usage,
            })
            .await
    }

    async fn report_failure(&mut self, error: &GatewayError) {
        match error {
            GatewayError::SegmentLimitExceeded { max } => {
                tracing::warn!(max, "segment limit reached, ending response");
                if self.stream.send(Frame::Error(error.user_message())).await.is_err() {
                    tracing::debug!("client gone before segment limit error was sent");
                }
            }
            GatewayError::Cancelled => {
                tracing::debug!("client disconnected, tearing down session");
            }
            other => {
                tracing::error!(
                    error = %other,
                    provider = other.provider().unwrap_or(self.provider.as_str()),
                    model = %self.model,
                    "chat generation failed"
                );
            }
        }
    }

    fn request(&self) -> CompletionRequest {
        let mut req = CompletionRequest::new(
            self.messages.clone(),
            &self.model,
            &self.provider,
            self.config.max_tokens,
        );
        req.system_prompt = self.system_prompt.clone();
        req.summary = self.summary.clone();
        req.context_files = self.context_files.clone();
        req.message_slice_id = self.message_slice_id;
        req.cancellation_token = self.cancel.clone();
        req
    }

    async fn emit_usage(&mut self) -> Result<(), GatewayError> {
        let value = self.usage;
        self.stream
            .send(Frame::Annotation(Annotation::Usage { value }))
            .await
    }

    async fn emit_progress(
        &mut self,
        label: &str,
        status: ProgressStatus,
        message: &str,
    ) -> Result<(), GatewayError> {
        let order = self.progress;
        self.progress += 1;
        self.stream
            .send(Frame::Progress(ProgressEvent {
                label: label.to_string(),
                status,
                order,
                message: message.to_string(),
            }))
            .await
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        result = fut => result,
    }
}
