pub mod annotator;
pub mod frame;
pub mod switchable;

pub use annotator::{ChunkAnnotator, annotate_stream};
pub use frame::{Annotation, Frame, ProgressEvent, ProgressStatus};
pub use switchable::{SegmentOutcome, SwitchableStream};
