//! Bidirectional wire-format adapters.
//!
//! Each adapter translates canonical [`Message`]s to one vendor's JSON and back. Adapters are
//! stateless; one instance can serve any number of concurrent callers.

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

use crate::error::{CrosstalkError, Result};
use crate::llm::gateway::RequestOptions;
use crate::llm::models::{ContentBlock, Message, Provider, Role, TokenUsage};
use crate::llm::tools::ToolDeclaration;
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;

/// A decoded non-streaming response.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResponse {
    pub message: Message,
    pub usage: TokenUsage,
}

/// Translation between canonical messages and one provider's wire format.
pub trait WireAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Encode one message into the provider's message object.
    fn encode_message(&self, message: &Message) -> Result<Value>;

    /// Decode one provider message object.
    fn decode_message(&self, value: &Value) -> Result<Message>;

    /// Build a complete request body for a conversation.
    ///
    /// System-role messages are left out; the system prompt travels in
    /// [`RequestOptions::system_prompt`].
    fn build_request(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDeclaration],
        options: &RequestOptions,
    ) -> Result<Value>;

    /// Decode a complete non-streaming response body.
    fn decode_response(&self, body: &[u8]) -> Result<DecodedResponse>;

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.encode_message(message)?)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let value = parse_body(self.provider(), bytes)?;
        self.decode_message(&value)
    }
}

/// Adapter for a provider.
pub fn adapter_for(provider: Provider) -> Box<dyn WireAdapter> {
    match provider {
        Provider::Anthropic => Box::new(AnthropicAdapter),
        Provider::Gemini => Box::new(GeminiAdapter),
        Provider::OpenAI => Box::new(OpenAIAdapter),
        Provider::Ollama => Box::new(OllamaAdapter),
    }
}

/// Messages that go on the wire: system turns removed, usage annotations stripped, and tool
/// result names recovered from the calls they answer.
pub(crate) fn outbound_messages(provider: Provider, messages: &[Message]) -> Vec<Message> {
    let mut outbound: Vec<Message> = messages
        .iter()
        .filter(|message| message.role != Role::System)
        .map(Message::without_usage)
        .collect();
    resolve_tool_result_names(&mut outbound);
    debug!(
        provider = %provider,
        total = messages.len(),
        outbound = outbound.len(),
        "Filtered conversation for request"
    );
    outbound
}

/// Fill in empty tool-result names from the earlier tool call with the same id.
///
/// Anthropic's `tool_result` carries only the call id, so results decoded from it have no name;
/// providers such as Gemini need one.
pub fn resolve_tool_result_names(messages: &mut [Message]) {
    let mut names: HashMap<String, String> = HashMap::new();
    for message in messages.iter_mut() {
        for block in message.content.iter_mut() {
            match block {
                ContentBlock::ToolCall(call) => {
                    names.insert(call.id.clone(), call.name.clone());
                }
                ContentBlock::ToolResult(result) if result.name.is_empty() => {
                    if let Some(name) = names.get(&result.id) {
                        result.name = name.clone();
                    }
                }
                _ => {}
            }
        }
    }
}

pub(crate) fn parse_body(provider: Provider, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| {
        CrosstalkError::malformed_text(
            provider,
            format!("invalid JSON: {}", e),
            &String::from_utf8_lossy(bytes),
        )
    })
}

pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub(crate) fn decode_base64(provider: Provider, data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .map_err(|e| CrosstalkError::malformed_text(provider, format!("invalid base64: {}", e), data))
}

pub(crate) fn required_str<'a>(provider: Provider, value: &'a Value, key: &str) -> Result<&'a str> {
    value[key]
        .as_str()
        .ok_or_else(|| CrosstalkError::malformed(provider, format!("missing string field `{}`", key), value))
}

/// Guess a MIME type from a file name or URL extension.
pub(crate) fn mime_from_path(path: &str, fallback: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => fallback,
    };
    mime.to_string()
}
