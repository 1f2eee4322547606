//! Provider-agnostic LLM messages with wire adapters for Anthropic, Gemini, OpenAI and Ollama.
//!
//! Conversations are built from canonical [`llm::Message`]s. An adapter turns them into one
//! vendor's request body and decodes the reply; streamed replies are framed, normalized and
//! assembled into the same canonical shape. Sending bytes is left to a [`llm::Transport`].

pub mod error;
pub mod llm;

pub use error::{CrosstalkError, Result};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::error::{CrosstalkError, Result};
    pub use crate::llm::streaming::{cancel_pair, CancelSignal};
    pub use crate::llm::{
        ChatSession, ContentBlock, Conversation, Message, Outcome, Provider, RequestOptions, Role,
        StopReason, ToolDeclaration, Transport, WireAdapter,
    };
}
