use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::completion::{CompletionEvent, CompletionSource, FinishReason, Usage};
use crate::error::GatewayError;
use crate::stream::frame::Frame;

/// What one drained source produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentOutcome {
    /// Text deltas concatenated (reasoning excluded).
    pub text: String,
    pub usage: Usage,
    pub finish: FinishReason,
}

/// One continuous outward frame sequence fed by a series of sources.
///
/// Only one source is bound at a time. Rebinding never ends the outward
/// sequence; the receiver sees end-of-stream only after [`close`].
///
/// [`close`]: SwitchableStream::close
pub struct SwitchableStream {
    sink: Option<mpsc::Sender<Frame>>,
    source: Option<CompletionSource>,
    binds: u32,
    cancel: CancellationToken,
}

impl SwitchableStream {
    pub fn new(sink: mpsc::Sender<Frame>, cancel: CancellationToken) -> Self {
        Self {
            sink: Some(sink),
            source: None,
            binds: 0,
            cancel,
        }
    }

    /// Stream plus the receiving end the transport reads from.
    pub fn channel(buffer: usize, cancel: CancellationToken) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx, cancel), rx)
    }

    /// Make `source` the bound source. An undrained previous source is
    /// superseded: it is dropped here, which cancels it.
    pub fn bind(&mut self, source: CompletionSource) {
        if self.source.replace(source).is_some() {
            tracing::debug!("superseding undrained completion source");
        }
        self.binds += 1;
    }

    /// Number of binds after the first.
    pub fn switches(&self) -> u32 {
        self.binds.saturating_sub(1)
    }

    pub fn is_bound(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    /// Push one frame outward. Fails with `Cancelled` once the receiver is
    /// gone or the stream was closed.
    pub async fn send(&mut self, frame: Frame) -> Result<(), GatewayError> {
        let sink = self.sink.as_ref().ok_or(GatewayError::Cancelled)?;
        sink.send(frame).await.map_err(|_| GatewayError::Cancelled)
    }

    /// Drain the bound source to its end.
    ///
    /// Text and reasoning deltas go out as they arrive. Usage, finish and
    /// error events are observed in the same pass; there is no second reader
    /// of the source. An error event stops forwarding and is returned; frames
    /// already sent stay sent.
    pub async fn forward(&mut self) -> Result<SegmentOutcome, GatewayError> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| GatewayError::Other("no completion source bound".to_string()))?;

        let mut text = String::new();
        let mut usage = Usage::default();
        let mut finish = None;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(GatewayError::Cancelled),
                event = source.next() => event,
            };
            let Some(event) = event else { break };

            match event {
                CompletionEvent::TextDelta(delta) => {
                    text.push_str(&delta);
                    self.send(Frame::Text(delta)).await?;
                }
                CompletionEvent::ReasoningDelta(delta) => {
                    self.send(Frame::Reasoning(delta)).await?;
                }
                CompletionEvent::Usage(u) => usage = u,
                CompletionEvent::Finish(reason) => finish = Some(reason),
                CompletionEvent::Error(e) => return Err(e),
            }
        }

        Ok(SegmentOutcome {
            text,
            usage,
            finish: finish.unwrap_or(FinishReason::Unknown),
        })
    }

    /// End the outward sequence. Returns false if it was already closed.
    pub fn close(&mut self) -> bool {
        self.source = None;
        self.sink.take().is_some()
    }
}
