//! Canonical streaming event vocabulary.
//!
//! The vocabulary mirrors the Anthropic SSE protocol, which is the richest of the four; the
//! other providers are translated into it by [`crate::llm::streaming::normalize`].

use crate::error::{CrosstalkError, Result};
use crate::llm::models::{Attachment, Provider, Role, TokenUsage};
use serde_json::Value;

/// One framed unit read off the wire: an SSE event or an NDJSON line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// SSE `event:` name, when the framing has one.
    pub event: Option<String>,
    pub data: String,
}

impl RawEvent {
    pub fn new(event: Option<String>, data: impl Into<String>) -> Self {
        Self {
            event,
            data: data.into(),
        }
    }

    pub fn data(data: impl Into<String>) -> Self {
        Self::new(None, data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        role: Role,
        usage: TokenUsage,
    },
    BlockStart {
        index: u32,
        kind: BlockKind,
    },
    BlockDelta {
        index: u32,
        delta: Delta,
    },
    BlockStop {
        index: u32,
    },
    /// Raw provider stop reason; classified when the message stops.
    MessageDelta {
        stop_reason: Option<String>,
        stop_sequence: Option<String>,
        usage: TokenUsage,
    },
    MessageStop,
    /// Provider information with no canonical block, kept in message metadata.
    Metadata {
        key: String,
        value: Value,
    },
    Ping,
    Error {
        kind: String,
        message: String,
    },
}

/// Initial contents of a block opened by [`StreamEvent::BlockStart`].
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text { text: String },
    ToolCall { id: String, name: String },
    Thinking { text: String, signature: String },
    RedactedThinking { data: String },
    /// Media arrives whole; the block takes no deltas.
    Attachment(Attachment),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Text(String),
    InputJson(String),
    Thinking(String),
    Signature(String),
    Other(String),
}

impl Delta {
    pub fn kind_name(&self) -> &str {
        match self {
            Delta::Text(_) => "text_delta",
            Delta::InputJson(_) => "input_json_delta",
            Delta::Thinking(_) => "thinking_delta",
            Delta::Signature(_) => "signature_delta",
            Delta::Other(name) => name,
        }
    }
}

impl StreamEvent {
    /// Parse one Anthropic SSE payload. Unknown event types yield `None`.
    pub fn from_anthropic(data: &str) -> Result<Option<StreamEvent>> {
        let event: wire::Event = serde_json::from_str(data).map_err(|e| {
            CrosstalkError::malformed_text(Provider::Anthropic, format!("invalid stream event: {}", e), data)
        })?;
        Ok(event.into_canonical())
    }
}

/// Anthropic SSE payloads as they appear on the wire.
mod wire {
    use super::{BlockKind, Delta as CanonicalDelta, StreamEvent};
    use crate::llm::models::{Role, TokenUsage};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub(super) enum Event {
        MessageStart {
            message: MessageInfo,
        },
        MessageDelta {
            #[serde(default)]
            delta: MessageDeltaInfo,
            #[serde(default)]
            usage: Usage,
        },
        ContentBlockStart {
            index: u32,
            content_block: ContentBlock,
        },
        ContentBlockDelta {
            index: u32,
            delta: Delta,
        },
        ContentBlockStop {
            index: u32,
        },
        MessageStop,
        Ping,
        Error {
            error: ErrorInfo,
        },
        #[serde(other)]
        Unknown,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct MessageInfo {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        usage: Usage,
    }

    #[derive(Debug, Deserialize, Default)]
    pub(super) struct MessageDeltaInfo {
        #[serde(default)]
        stop_reason: Option<String>,
        #[serde(default)]
        stop_sequence: Option<String>,
    }

    /// Anthropic's `input_tokens` excludes cached tokens.
    #[derive(Debug, Deserialize, Default)]
    pub(super) struct Usage {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
        #[serde(default)]
        cache_creation_input_tokens: u64,
        #[serde(default)]
        cache_read_input_tokens: u64,
    }

    impl From<Usage> for TokenUsage {
        fn from(usage: Usage) -> Self {
            TokenUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_creation_input_tokens: usage.cache_creation_input_tokens,
                cache_read_input_tokens: usage.cache_read_input_tokens,
            }
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub(super) enum ContentBlock {
        Text {
            #[serde(default)]
            text: String,
        },
        ToolUse {
            id: String,
            name: String,
        },
        Thinking {
            #[serde(default)]
            thinking: String,
            #[serde(default)]
            signature: String,
        },
        RedactedThinking {
            data: String,
        },
        #[serde(other)]
        Unknown,
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub(super) enum Delta {
        TextDelta { text: String },
        ThinkingDelta { thinking: String },
        SignatureDelta { signature: String },
        InputJsonDelta { partial_json: String },
        #[serde(other)]
        Unknown,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct ErrorInfo {
        #[serde(default, rename = "type")]
        error_type: String,
        #[serde(default)]
        message: String,
    }

    impl Event {
        pub(super) fn into_canonical(self) -> Option<StreamEvent> {
            let event = match self {
                Event::MessageStart { message } => StreamEvent::MessageStart {
                    role: match message.role.as_deref() {
                        Some("user") => Role::User,
                        _ => Role::Assistant,
                    },
                    usage: message.usage.into(),
                },
                Event::MessageDelta { delta, usage } => StreamEvent::MessageDelta {
                    stop_reason: delta.stop_reason,
                    stop_sequence: delta.stop_sequence,
                    usage: usage.into(),
                },
                Event::ContentBlockStart {
                    index,
                    content_block,
                } => StreamEvent::BlockStart {
                    index,
                    kind: match content_block {
                        ContentBlock::Text { text } => BlockKind::Text { text },
                        ContentBlock::ToolUse { id, name } => BlockKind::ToolCall { id, name },
                        ContentBlock::Thinking {
                            thinking,
                            signature,
                        } => BlockKind::Thinking {
                            text: thinking,
                            signature,
                        },
                        ContentBlock::RedactedThinking { data } => {
                            BlockKind::RedactedThinking { data }
                        }
                        ContentBlock::Unknown => BlockKind::Unknown("unknown".to_string()),
                    },
                },
                Event::ContentBlockDelta { index, delta } => StreamEvent::BlockDelta {
                    index,
                    delta: match delta {
                        Delta::TextDelta { text } => CanonicalDelta::Text(text),
                        Delta::ThinkingDelta { thinking } => CanonicalDelta::Thinking(thinking),
                        Delta::SignatureDelta { signature } => CanonicalDelta::Signature(signature),
                        Delta::InputJsonDelta { partial_json } => {
                            CanonicalDelta::InputJson(partial_json)
                        }
                        Delta::Unknown => CanonicalDelta::Other("unknown".to_string()),
                    },
                },
                Event::ContentBlockStop { index } => StreamEvent::BlockStop { index },
                Event::MessageStop => StreamEvent::MessageStop,
                Event::Ping => StreamEvent::Ping,
                Event::Error { error } => StreamEvent::Error {
                    kind: error.error_type,
                    message: error.message,
                },
                Event::Unknown => return None,
            };
            Some(event)
        }
    }
}
