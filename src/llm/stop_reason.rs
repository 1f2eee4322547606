//! Canonical stop-reason classification.
//!
//! Each provider reports why generation ended with its own vocabulary. [`classify`] folds them
//! all into [`StopReason`]; the mapping is total, so unknown strings land on
//! [`StopReason::Other`] instead of failing.

use crate::llm::models::{Message, Provider};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn or a stop sequence.
    Stop,
    /// Output token limit (or context window) reached.
    MaxTokens,
    /// Refusal or safety filter.
    Blocked,
    /// The model wants tools run before it continues.
    ToolCall,
    /// The provider ended generation because of a malformed response.
    Error,
    /// Long-running turn paused by the provider; can be resumed.
    Pause,
    Other,
}

/// Map a provider's raw stop/finish reason onto [`StopReason`].
pub fn classify(provider: Provider, reason: &str) -> StopReason {
    match provider {
        Provider::Anthropic => match reason {
            "end_turn" | "stop_sequence" => StopReason::Stop,
            "max_tokens" | "model_context_window_exceeded" => StopReason::MaxTokens,
            "tool_use" => StopReason::ToolCall,
            "refusal" => StopReason::Blocked,
            "pause_turn" => StopReason::Pause,
            _ => StopReason::Other,
        },
        Provider::Gemini => match reason {
            "STOP" => StopReason::Stop,
            "MAX_TOKENS" => StopReason::MaxTokens,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
            | "IMAGE_SAFETY" | "LANGUAGE" => StopReason::Blocked,
            "MALFORMED_FUNCTION_CALL" => StopReason::Error,
            _ => StopReason::Other,
        },
        Provider::OpenAI => match reason {
            "stop" => StopReason::Stop,
            "length" => StopReason::MaxTokens,
            "tool_calls" | "function_call" => StopReason::ToolCall,
            "content_filter" => StopReason::Blocked,
            _ => StopReason::Other,
        },
        Provider::Ollama => match reason {
            "stop" => StopReason::Stop,
            "length" => StopReason::MaxTokens,
            _ => StopReason::Other,
        },
    }
}

/// Classify a stop reason against the message it ended.
///
/// Gemini and Ollama report a plain stop when the turn ends in function calls; a message
/// that carries tool calls and stopped normally is a tool-call stop for every provider.
pub fn classify_message(provider: Provider, reason: &str, message: &Message) -> StopReason {
    match classify(provider, reason) {
        StopReason::Stop if !message.tool_calls().is_empty() => StopReason::ToolCall,
        other => other,
    }
}

/// A finished turn, split by whether its content is usable.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Generation ended normally.
    Complete(Message),
    /// Generation was cut short (token limit, pause); the content so far is usable.
    Partial(Message),
    /// The provider refused or failed; no content is surfaced.
    Withheld(StopReason),
}

impl Outcome {
    /// Sort a message by its recorded stop reason. A message without one is complete.
    pub fn from_message(message: Message) -> Self {
        match message.stop_reason {
            Some(reason @ (StopReason::Blocked | StopReason::Error)) => Outcome::Withheld(reason),
            Some(StopReason::MaxTokens | StopReason::Pause) => Outcome::Partial(message),
            _ => Outcome::Complete(message),
        }
    }

    pub fn stop_reason(&self) -> StopReason {
        match self {
            Outcome::Complete(message) | Outcome::Partial(message) => {
                message.stop_reason.unwrap_or(StopReason::Stop)
            }
            Outcome::Withheld(reason) => *reason,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            Outcome::Complete(message) | Outcome::Partial(message) => Some(message),
            Outcome::Withheld(_) => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Outcome::Complete(message) | Outcome::Partial(message) => Some(message),
            Outcome::Withheld(_) => None,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Outcome::Partial(_))
    }
}
