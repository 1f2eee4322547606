pub mod adapters;
pub mod chat_session;
pub mod conversation;
pub mod gateway;
pub mod model_registry;
pub mod models;
pub mod stop_reason;
pub mod streaming;
pub mod tools;

pub use adapters::{adapter_for, DecodedResponse, WireAdapter};
pub use chat_session::{ChatSession, ChatSessionBuilder};
pub use conversation::Conversation;
pub use gateway::{RequestOptions, Transport};
pub use model_registry::{
    resolve_model, InMemoryModelCache, ModelIdentity, ModelInfo, ModelMetadataCache,
};
pub use models::{
    Attachment, ContentBlock, Message, Provider, Role, TokenUsage, ToolCall, ToolResult,
};
pub use stop_reason::{classify, Outcome, StopReason};
pub use tools::{ToolDeclaration, ToolRegistry};
