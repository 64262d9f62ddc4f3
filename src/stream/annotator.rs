use axum::body::Bytes;
use futures_util::{Stream, StreamExt, stream};

use crate::stream::frame::Frame;

pub const REASONING_OPEN: &str = "<div class=\"__boltThought__\">";
pub const REASONING_CLOSE: &str = "</div>\n";

/// Wraps runs of reasoning frames in delimiter text frames.
///
/// The only state is whether the previous frame was reasoning. Reasoning
/// frames come out as plain text frames with the same content; every other
/// frame passes through untouched.
#[derive(Debug, Default)]
pub struct ChunkAnnotator {
    in_reasoning: bool,
}

impl ChunkAnnotator {
    pub fn annotate(&mut self, frame: Frame) -> Vec<Frame> {
        let reasoning = frame.is_reasoning();
        let mut out = Vec::with_capacity(2);

        if reasoning && !self.in_reasoning {
            out.push(Frame::Text(REASONING_OPEN.to_string()));
        }
        if !reasoning && self.in_reasoning {
            out.push(Frame::Text(REASONING_CLOSE.to_string()));
        }
        self.in_reasoning = reasoning;

        out.push(match frame {
            Frame::Reasoning(text) => Frame::Text(text),
            other => other,
        });
        out
    }

    /// Close a reasoning run left open at end of stream.
    pub fn finish(&mut self) -> Option<Frame> {
        std::mem::take(&mut self.in_reasoning).then(|| Frame::Text(REASONING_CLOSE.to_string()))
    }
}

/// Annotate and encode a frame sequence into wire bytes.
pub fn annotate_stream<S>(frames: S) -> impl Stream<Item = Bytes> + Send + 'static
where
    S: Stream<Item = Frame> + Send + Unpin + 'static,
{
    let state = (frames, ChunkAnnotator::default(), false);
    stream::unfold(state, |(mut frames, mut annotator, ended)| async move {
        if ended {
            return None;
        }
        match frames.next().await {
            Some(frame) => Some((annotator.annotate(frame), (frames, annotator, false))),
            None => {
                let tail: Vec<Frame> = annotator.finish().into_iter().collect();
                Some((tail, (frames, annotator, true)))
            }
        }
    })
    .flat_map(stream::iter)
    .map(|frame| frame.encode())
}
