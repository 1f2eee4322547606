//! Canonical, provider-agnostic conversation model.
//!
//! Every adapter converts to and from these types. [`ContentBlock`] is a genuine sum type, so a
//! block carrying two payloads at once cannot be built, and [`MediaSource`] makes "inline bytes
//! and a URI together" unrepresentable.

use crate::error::{CrosstalkError, Result};
use crate::llm::stop_reason::StopReason;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// LLM vendor whose wire format an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Gemini,
    OpenAI,
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 4] =
        [Provider::Anthropic, Provider::Gemini, Provider::OpenAI, Provider::Ollama];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::OpenAI => "openai",
            Provider::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message role in LLM conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Broad media class derived from a MIME type prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    Document,
}

impl AttachmentKind {
    pub fn from_mime(mime_type: &str) -> Self {
        let prefix = mime_type.split('/').next().unwrap_or("").to_ascii_lowercase();
        match prefix.as_str() {
            "image" => AttachmentKind::Image,
            "video" => AttachmentKind::Video,
            "audio" => AttachmentKind::Audio,
            _ => AttachmentKind::Document,
        }
    }
}

/// Where attachment bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    Inline(#[serde(with = "base64_bytes")] Vec<u8>),
    Uri(String),
}

/// Image, document, audio or video attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    pub source: MediaSource,
}

impl Attachment {
    pub fn inline(mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            source: MediaSource::Inline(data.into()),
        }
    }

    pub fn uri(mime_type: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            source: MediaSource::Uri(uri.into()),
        }
    }

    /// Build an attachment from optional parts, requiring exactly one of `data` and `uri`.
    pub fn from_parts(
        mime_type: impl Into<String>,
        data: Option<Vec<u8>>,
        uri: Option<String>,
    ) -> Result<Self> {
        let mime_type = mime_type.into();
        if mime_type.is_empty() {
            return Err(CrosstalkError::InvalidAttachment("missing MIME type".to_string()));
        }
        match (data, uri) {
            (Some(data), None) => Ok(Self::inline(mime_type, data)),
            (None, Some(uri)) => Ok(Self::uri(mime_type, uri)),
            (Some(_), Some(_)) => Err(CrosstalkError::InvalidAttachment(
                "both inline data and a URI were supplied".to_string(),
            )),
            (None, None) => Err(CrosstalkError::InvalidAttachment(
                "neither inline data nor a URI was supplied".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> AttachmentKind {
        AttachmentKind::from_mime(&self.mime_type)
    }
}

/// Tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Output of a tool run, answering the [`ToolCall`] with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    /// JSON-encoded (or plain text) tool output.
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(id, name, content)
        }
    }
}

/// Chain-of-thought segment. The signature is an opaque integrity token issued by the
/// provider and is copied verbatim on every re-encode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thinking {
    pub text: String,
    #[serde(default)]
    pub signature: String,
}

impl Thinking {
    pub fn new(text: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            signature: signature.into(),
        }
    }
}

/// Prompt-cache lifetime hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTtl {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl CacheTtl {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheTtl::FiveMinutes => "5m",
            CacheTtl::OneHour => "1h",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "5m" => Some(CacheTtl::FiveMinutes),
            "1h" => Some(CacheTtl::OneHour),
            _ => None,
        }
    }
}

/// Marks the preceding block as a prompt-cache breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<CacheTtl>,
}

/// Cache accounting reported alongside a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// One content unit within a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(String),
    Attachment(Attachment),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Thinking(Thinking),
    RedactedThinking(String),
    CacheControl(CacheControl),
    Usage(UsageMetrics),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(text.into())
    }

    /// Short name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ContentBlock::Text(_) => "text",
            ContentBlock::Attachment(_) => "attachment",
            ContentBlock::ToolCall(_) => "tool call",
            ContentBlock::ToolResult(_) => "tool result",
            ContentBlock::Thinking(_) => "thinking",
            ContentBlock::RedactedThinking(_) => "redacted thinking",
            ContentBlock::CacheControl(_) => "cache control",
            ContentBlock::Usage(_) => "usage metrics",
        }
    }

    /// Annotations describe other blocks or the response rather than carrying content.
    pub fn is_annotation(&self) -> bool {
        matches!(self, ContentBlock::CacheControl(_) | ContentBlock::Usage(_))
    }
}

/// Token counts reported by a provider for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    /// Input tokens including cached prefixes.
    ///
    /// Anthropic reports `input_tokens` as the uncached remainder only.
    pub fn total_input(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.cache_creation_input_tokens)
            .saturating_add(self.cache_read_input_tokens)
    }

    /// Fold a later usage report into this one. Streaming providers report input and
    /// output counts in different events; a zero never overwrites a known figure.
    pub fn merge(&mut self, other: TokenUsage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = other.cache_creation_input_tokens;
        }
        if other.cache_read_input_tokens > 0 {
            self.cache_read_input_tokens = other.cache_read_input_tokens;
        }
    }

    pub fn cache_metrics(&self) -> UsageMetrics {
        UsageMetrics {
            cache_creation_input_tokens: self.cache_creation_input_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
        }
    }
}

/// Message in LLM conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    token_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            token_count: 0,
            stop_reason: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::Text(text.into())])
    }

    /// Create a system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::Text(text.into())])
    }

    /// Create an assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::Text(text.into())])
    }

    /// Create a tool-role message answering one tool call
    pub fn tool_result(result: ToolResult) -> Self {
        Self::new(Role::Tool, vec![ContentBlock::ToolResult(result)])
    }

    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.content.push(block);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_stop_reason(mut self, stop_reason: StopReason) -> Self {
        self.stop_reason = Some(stop_reason);
        self
    }

    /// Token cost assigned by conversation accounting.
    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    pub(crate) fn set_token_count(&mut self, token_count: u64) {
        self.token_count = token_count;
    }

    /// All text blocks joined with a newline, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All tool calls, in order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn tool_results(&self) -> Vec<&ToolResult> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    /// True when at least one block carries content rather than an annotation.
    pub fn has_content(&self) -> bool {
        self.content.iter().any(|block| !block.is_annotation())
    }

    /// Copy of this message without response-side usage annotations.
    pub(crate) fn without_usage(&self) -> Message {
        let mut message = self.clone();
        message.content.retain(|block| !matches!(block, ContentBlock::Usage(_)));
        message
    }
}

/// Standard base64 for inline media in the serde representation.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
    }

    #[test]
    fn test_provider_display() {
        assert_eq!(Provider::Anthropic.to_string(), "anthropic");
        assert_eq!(Provider::OpenAI.to_string(), "openai");
        assert_eq!(serde_json::to_string(&Provider::Gemini).unwrap(), "\"gemini\"");
    }

    #[test]
    fn test_user_message() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, vec![ContentBlock::Text("Hello".to_string())]);
        assert_eq!(msg.token_count(), 0);
        assert!(msg.stop_reason.is_none());
        assert!(msg.metadata.is_empty());
    }

    #[test]
    fn test_text_joins_text_blocks_with_newline() {
        let msg = Message::assistant("first")
            .with_block(ContentBlock::ToolCall(ToolCall::new("call_1", "search", json!({}))))
            .with_block(ContentBlock::text("second"));

        assert_eq!(msg.text(), "first\nsecond");
    }

    #[test]
    fn test_text_empty_without_text_blocks() {
        let msg = Message::new(Role::Assistant, vec![]);
        assert_eq!(msg.text(), "");
    }

    #[test]
    fn test_tool_calls_in_order() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::ToolCall(ToolCall::new("a", "first", json!({"x": 1}))),
                ContentBlock::text("between"),
                ContentBlock::ToolCall(ToolCall::new("b", "second", json!({}))),
            ],
        );

        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[1].name, "second");
    }

    #[test]
    fn test_attachment_from_parts_requires_exactly_one_source() {
        let inline = Attachment::from_parts("image/png", Some(vec![1, 2, 3]), None).unwrap();
        assert_eq!(inline.source, MediaSource::Inline(vec![1, 2, 3]));

        let uri = Attachment::from_parts("image/png", None, Some("https://x/a.png".to_string()))
            .unwrap();
        assert_eq!(uri.source, MediaSource::Uri("https://x/a.png".to_string()));

        let both = Attachment::from_parts("image/png", Some(vec![1]), Some("u".to_string()));
        assert!(matches!(both, Err(CrosstalkError::InvalidAttachment(_))));

        let neither = Attachment::from_parts("image/png", None, None);
        assert!(matches!(neither, Err(CrosstalkError::InvalidAttachment(_))));
    }

    #[test]
    fn test_attachment_kind_from_mime_prefix() {
        assert_eq!(AttachmentKind::from_mime("image/png"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_mime("video/mp4"), AttachmentKind::Video);
        assert_eq!(AttachmentKind::from_mime("audio/wav"), AttachmentKind::Audio);
        assert_eq!(AttachmentKind::from_mime("application/pdf"), AttachmentKind::Document);
        assert_eq!(AttachmentKind::from_mime("text/plain"), AttachmentKind::Document);
    }

    #[test]
    fn test_message_serde_roundtrip_with_inline_bytes() {
        let msg = Message::user("look")
            .with_block(ContentBlock::Attachment(Attachment::inline("image/png", vec![0u8, 255])))
            .with_metadata("thought", "pondering");

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][1]["type"], "attachment");
        assert_eq!(json["content"][1]["data"]["source"]["inline"], "AP8=");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_token_usage_total_input_includes_cache() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 7,
            cache_creation_input_tokens: 25,
            cache_read_input_tokens: 50,
        };
        assert_eq!(usage.total_input(), 175);
    }

    #[test]
    fn test_token_usage_merge_keeps_known_figures() {
        let mut usage = TokenUsage::new(40, 0);
        usage.merge(TokenUsage::new(0, 12));
        assert_eq!(usage, TokenUsage::new(40, 12));
    }

    #[test]
    fn test_without_usage_strips_only_usage_blocks() {
        let msg = Message::assistant("hi")
            .with_block(ContentBlock::CacheControl(CacheControl::default()))
            .with_block(ContentBlock::Usage(UsageMetrics::default()));

        let stripped = msg.without_usage();
        assert_eq!(stripped.content.len(), 2);
        assert!(stripped.has_content());
    }

    #[test]
    fn test_cache_ttl_parse() {
        assert_eq!(CacheTtl::parse("1h"), Some(CacheTtl::OneHour));
        assert_eq!(CacheTtl::parse("5m"), Some(CacheTtl::FiveMinutes));
        assert_eq!(CacheTtl::parse("2d"), None);
    }
}
