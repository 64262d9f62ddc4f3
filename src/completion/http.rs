use std::collections::VecDeque;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::completion::{CompletionEvent, CompletionRequest, CompletionSource, FinishReason, Usage};
use crate::error::GatewayError;

/// Cap on error bodies read from a failed response.
pub const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Max wait for response headers after sending the request.
pub const HEADERS_TIMEOUT: Duration = Duration::from_secs(30);

/// Max silence between two SSE events once the stream is open.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Streaming client for OpenAI-compatible `chat/completions` endpoints.
pub struct HttpDispatch {
    client: Client,
    stall_timeout: Duration,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<Usage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
    /// xAI / DeepSeek spelling.
    reasoning_content: Option<String>,
    /// OpenRouter spelling.
    reasoning: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    message: String,
}

impl HttpDispatch {
    pub fn new() -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            client,
            stall_timeout: STALL_TIMEOUT,
        })
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Send the request and hand back the event stream once headers arrive.
    ///
    /// Status errors (auth, rate limit, 5xx) are returned here, before any
    /// event is produced. Failures after that point arrive as
    /// [`CompletionEvent::Error`] inside the stream.
    pub async fn open_stream(
        &self,
        req: &CompletionRequest,
        provider: &str,
        base_url: &str,
        api_key: &str,
    ) -> Result<CompletionSource, GatewayError> {
        let messages: Vec<serde_json::Value> = req
            .wire_messages()
            .into_iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();
        let body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        let send = self
            .client
            .post(base_url)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = req.cancellation_token.cancelled() => return Err(GatewayError::Cancelled),
            sent = tokio::time::timeout(HEADERS_TIMEOUT, send) => sent
                .map_err(|_| GatewayError::Timeout(HEADERS_TIMEOUT.as_millis() as u64))??,
        };

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::RateLimited {
                provider: provider.to_string(),
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(GatewayError::AuthFailed {
                provider: provider.to_string(),
                message: format!("{status}"),
            });
        }

        if !status.is_success() {
            let error_bytes = read_capped(response, MAX_ERROR_BODY_BYTES).await;
            let text = String::from_utf8_lossy(&error_bytes);
            return Err(GatewayError::Upstream {
                provider: provider.to_string(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        let events = response
            .bytes_stream()
            .eventsource()
            .map(|r| r.map(|event| event.data).map_err(|e| e.to_string()))
            .boxed();

        Ok(sse_events(
            events,
            provider.to_string(),
            req.cancellation_token.clone(),
            self.stall_timeout,
        ))
    }
}

struct SseState {
    events: BoxStream<'static, Result<String, String>>,
    provider: String,
    cancel: CancellationToken,
    stall_timeout: Duration,
    pending: VecDeque<CompletionEvent>,
    finish: Option<FinishReason>,
    done: bool,
}

impl SseState {
    fn fail(&mut self, err: GatewayError) {
        self.done = true;
        self.pending.push_back(CompletionEvent::Error(err));
    }

    fn handle_data(&mut self, data: &str) {
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.done = true;
            let reason = self.finish.take().unwrap_or(FinishReason::Unknown);
            self.pending.push_back(CompletionEvent::Finish(reason));
            return;
        }

        let chunk: ChatChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(provider = %self.provider, "skipping unparseable SSE chunk: {e}");
                return;
            }
        };

        if let Some(err) = chunk.error {
            self.fail(GatewayError::Upstream {
                provider: self.provider.clone(),
                message: err.message,
                status: None,
            });
            return;
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning)
                    && !reasoning.is_empty()
                {
                    self.pending.push_back(CompletionEvent::ReasoningDelta(reasoning));
                }
                if let Some(content) = delta.content
                    && !content.is_empty()
                {
                    self.pending.push_back(CompletionEvent::TextDelta(content));
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish = Some(FinishReason::from_wire(&reason));
            }
        }

        if let Some(usage) = chunk.usage {
            self.pending.push_back(CompletionEvent::Usage(usage));
        }
    }
}

/// Turn raw SSE data payloads into completion events.
///
/// The finish reason is held back until `[DONE]` (or end of body) because
/// usage arrives in a trailing chunk after it. A body that ends without a
/// finish reason is an error, not a clean stop.
fn sse_events(
    events: BoxStream<'static, Result<String, String>>,
    provider: String,
    cancel: CancellationToken,
    stall_timeout: Duration,
) -> CompletionSource {
    let state = SseState {
        events,
        provider,
        cancel,
        stall_timeout,
        pending: VecDeque::new(),
        finish: None,
        done: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            if st.done {
                return None;
            }

            let next = tokio::select! {
                _ = st.cancel.cancelled() => None,
                next = tokio::time::timeout(st.stall_timeout, st.events.next()) => Some(next),
            };

            match next {
                None => st.fail(GatewayError::Cancelled),
                Some(Err(_)) => {
                    let ms = st.stall_timeout.as_millis() as u64;
                    st.fail(GatewayError::Timeout(ms));
                }
                Some(Ok(None)) => match st.finish.take() {
                    Some(reason) => {
                        st.done = true;
                        st.pending.push_back(CompletionEvent::Finish(reason));
                    }
                    None => {
                        let provider = st.provider.clone();
                        st.fail(GatewayError::Upstream {
                            provider,
                            message: "stream ended before a finish reason".to_string(),
                            status: None,
                        });
                    }
                },
                Some(Ok(Some(Err(e)))) => {
                    let provider = st.provider.clone();
                    st.fail(GatewayError::Upstream {
                        provider,
                        message: format!("stream read failed: {e}"),
                        status: None,
                    });
                }
                Some(Ok(Some(Ok(data)))) => st.handle_data(&data),
            }
        }
    })
    .boxed()
}

/// Read at most `cap` bytes of a body, stopping the transfer once the cap
/// is reached. Read errors end the body early.
async fn read_capped(response: reqwest::Response, cap: usize) -> Vec<u8> {
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(Ok(chunk)) = chunks.next().await {
        let room = cap - body.len();
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if body.len() >= cap {
            break;
        }
    }
    body
}
