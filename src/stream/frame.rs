//! Outward frames and their line encoding.
//!
//! Each frame is one line `<code>:<json>\n`. The code tells a client what the
//! payload is, so text deltas and annotations can never be confused:
//!
//! | code | payload                                   |
//! |------|-------------------------------------------|
//! | `0`  | text delta (JSON string)                  |
//! | `g`  | reasoning delta (rewritten to `0` before the wire) |
//! | `2`  | data array (progress records)             |
//! | `3`  | error message (JSON string)               |
//! | `8`  | message annotation array                  |
//! | `f`  | message start `{messageId}`               |
//! | `d`  | finish `{finishReason, usage}`            |

use axum::body::Bytes;
use serde::Serialize;

use crate::completion::FinishReason;
use crate::usage::UsageAccumulator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    InProgress,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "progress")]
pub struct ProgressEvent {
    pub label: String,
    pub status: ProgressStatus,
    pub order: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Annotation {
    Usage {
        value: UsageAccumulator,
    },
    ChatSummary {
        summary: String,
        #[serde(rename = "chatId")]
        chat_id: Option<String>,
    },
    CodeContext {
        files: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Reasoning(String),
    Progress(ProgressEvent),
    Annotation(Annotation),
    Error(String),
    MessageStart { message_id: String },
    Finish {
        finish_reason: FinishReason,
        usage: UsageAccumulator,
    },
}

impl Frame {
    pub fn code(&self) -> char {
        match self {
            Self::Text(_) => '0',
            Self::Reasoning(_) => 'g',
            Self::Progress(_) => '2',
            Self::Error(_) => '3',
            Self::Annotation(_) => '8',
            Self::MessageStart { .. } => 'f',
            Self::Finish { .. } => 'd',
        }
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self, Self::Reasoning(_))
    }

    pub fn encode(&self) -> Bytes {
        let payload = match self {
            Self::Text(text) | Self::Reasoning(text) | Self::Error(text) => to_json(text),
            Self::Progress(event) => to_json(&[event]),
            Self::Annotation(annotation) => to_json(&[annotation]),
            Self::MessageStart { message_id } => {
                to_json(&serde_json::json!({ "messageId": message_id }))
            }
            Self::Finish {
                finish_reason,
                usage,
            } => to_json(&serde_json::json!({
                "finishReason": finish_reason,
                "usage": {
                    "promptTokens": usage.prompt_tokens,
                    "completionTokens": usage.completion_tokens,
                },
            })),
        };
        Bytes::from(format!("{}:{payload}\n", self.code()))
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        tracing::warn!("frame serialization failed: {e}");
        "null".to_string()
    })
}
