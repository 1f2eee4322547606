//! Adapter for the Anthropic Messages API.
//!
//! Content is an array of typed blocks. Tool results travel in `user` messages; a user message
//! made only of `tool_result` blocks decodes back to [`Role::Tool`]. Prompt-cache breakpoints are
//! a `cache_control` field on the annotated block.
//!
//! `tool_result` blocks carry only the call id, so decoded results have an empty name. Request
//! builders recover it from the matching `tool_use` earlier in the conversation.

use super::{
    decode_base64, encode_base64, mime_from_path, outbound_messages, parse_body, required_str,
    DecodedResponse, WireAdapter,
};
use crate::error::{CrosstalkError, Result};
use crate::llm::gateway::RequestOptions;
use crate::llm::models::{
    Attachment, AttachmentKind, CacheControl, CacheTtl, ContentBlock, MediaSource, Message,
    Provider, Role, Thinking, TokenUsage, ToolCall, ToolResult, UsageMetrics,
};
use crate::llm::stop_reason::classify;
use crate::llm::tools::ToolDeclaration;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

const PROVIDER: Provider = Provider::Anthropic;

#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicAdapter;

impl WireAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    fn encode_message(&self, message: &Message) -> Result<Value> {
        let role = match message.role {
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
            Role::System => {
                return Err(CrosstalkError::unsupported(
                    PROVIDER,
                    "system-role messages (use the request system prompt)",
                ))
            }
        };

        let mut blocks: Vec<Value> = Vec::with_capacity(message.content.len());
        let mut usage: Option<UsageMetrics> = None;

        for block in &message.content {
            match block {
                ContentBlock::CacheControl(cache) => {
                    let target = blocks.last_mut().ok_or_else(|| {
                        CrosstalkError::unsupported(PROVIDER, "cache control with no preceding block")
                    })?;
                    if target.get("cache_control").is_some() {
                        return Err(CrosstalkError::unsupported(
                            PROVIDER,
                            "two cache control annotations on one block",
                        ));
                    }
                    target["cache_control"] = encode_cache_control(cache);
                }
                ContentBlock::Usage(metrics) => {
                    if usage.replace(*metrics).is_some() {
                        return Err(CrosstalkError::unsupported(
                            PROVIDER,
                            "more than one usage annotation per message",
                        ));
                    }
                }
                other => blocks.push(encode_block(other)?),
            }
        }

        let mut encoded = json!({
            "role": role,
            "content": blocks,
        });
        if let Some(metrics) = usage {
            encoded["usage"] = json!({
                "cache_creation_input_tokens": metrics.cache_creation_input_tokens,
                "cache_read_input_tokens": metrics.cache_read_input_tokens,
            });
        }
        Ok(encoded)
    }

    fn decode_message(&self, value: &Value) -> Result<Message> {
        let role = match required_str(PROVIDER, value, "role")? {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(CrosstalkError::malformed(
                    PROVIDER,
                    format!("unknown role `{}`", other),
                    value,
                ))
            }
        };

        let mut content = Vec::new();
        match &value["content"] {
            Value::String(text) => content.push(ContentBlock::Text(text.clone())),
            Value::Array(blocks) => {
                for block in blocks {
                    if let Some(decoded) = decode_block(block)? {
                        content.push(decoded);
                        if let Some(cache) = block.get("cache_control") {
                            content.push(ContentBlock::CacheControl(decode_cache_control(cache)));
                        }
                    }
                }
            }
            Value::Null => {}
            other => {
                return Err(CrosstalkError::malformed(
                    PROVIDER,
                    "content must be a string or an array",
                    other,
                ))
            }
        }

        if let Some(usage) = value.get("usage") {
            if usage.get("cache_creation_input_tokens").is_some()
                || usage.get("cache_read_input_tokens").is_some()
            {
                content.push(ContentBlock::Usage(UsageMetrics {
                    cache_creation_input_tokens: usage["cache_creation_input_tokens"]
                        .as_u64()
                        .unwrap_or(0),
                    cache_read_input_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0),
                }));
            }
        }

        let all_tool_results = content
            .iter()
            .filter(|block| !block.is_annotation())
            .all(|block| matches!(block, ContentBlock::ToolResult(_)));
        let role = if role == Role::User && all_tool_results && !message_is_empty(&content) {
            Role::Tool
        } else {
            role
        };

        let mut message = Message::new(role, content);
        if let Some(reason) = value["stop_reason"].as_str() {
            message.stop_reason = Some(classify(PROVIDER, reason));
        }
        if let Some(sequence) = value["stop_sequence"].as_str() {
            message.metadata.insert("stop_sequence".to_string(), json!(sequence));
        }
        Ok(message)
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDeclaration],
        options: &RequestOptions,
    ) -> Result<Value> {
        options.validate()?;
        let encoded = outbound_messages(PROVIDER, messages)
            .iter()
            .map(|message| self.encode_message(message))
            .collect::<Result<Vec<_>>>()?;

        let mut body = json!({
            "model": model,
            "max_tokens": options.max_tokens,
            "messages": encoded,
            "temperature": options.temperature,
        });

        if let Some(system) = &options.system_prompt {
            body["system"] = json!(system);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(top_k) = options.top_k {
            body["top_k"] = json!(top_k);
        }
        if !options.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(options.stop_sequences);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolDeclaration::to_anthropic).collect());
        }
        if options.stream {
            body["stream"] = json!(true);
        }
        options.apply_extra(&mut body);

        debug!(model = model, tools = tools.len(), "Built Anthropic request");
        Ok(body)
    }

    fn decode_response(&self, body: &[u8]) -> Result<DecodedResponse> {
        let value = parse_body(PROVIDER, body)?;

        if value["type"] == "error" {
            return Err(CrosstalkError::UpstreamError {
                kind: value["error"]["type"].as_str().unwrap_or("error").to_string(),
                message: value["error"]["message"].as_str().unwrap_or_default().to_string(),
            });
        }

        let message = self.decode_message(&value)?;
        let usage = &value["usage"];
        let usage = TokenUsage {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
            cache_creation_input_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0),
            cache_read_input_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0),
        };

        Ok(DecodedResponse { message, usage })
    }
}

fn message_is_empty(content: &[ContentBlock]) -> bool {
    !content.iter().any(|block| !block.is_annotation())
}

fn encode_block(block: &ContentBlock) -> Result<Value> {
    let encoded = match block {
        ContentBlock::Text(text) => json!({"type": "text", "text": text}),
        ContentBlock::Attachment(attachment) => encode_attachment(attachment)?,
        ContentBlock::ToolCall(call) => json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments,
        }),
        ContentBlock::ToolResult(result) => {
            let mut encoded = json!({
                "type": "tool_result",
                "tool_use_id": result.id,
                "content": result.content,
            });
            if result.is_error {
                encoded["is_error"] = json!(true);
            }
            encoded
        }
        ContentBlock::Thinking(thinking) => json!({
            "type": "thinking",
            "thinking": thinking.text,
            "signature": thinking.signature,
        }),
        ContentBlock::RedactedThinking(data) => json!({"type": "redacted_thinking", "data": data}),
        ContentBlock::CacheControl(_) | ContentBlock::Usage(_) => {
            return Err(CrosstalkError::unsupported(
                PROVIDER,
                format!("a standalone {} block", block.kind_name()),
            ))
        }
    };
    Ok(encoded)
}

fn encode_attachment(attachment: &Attachment) -> Result<Value> {
    let block_type = match attachment.kind() {
        AttachmentKind::Image => "image",
        AttachmentKind::Document => "document",
        AttachmentKind::Video | AttachmentKind::Audio => {
            return Err(CrosstalkError::unsupported(
                PROVIDER,
                format!("{} attachments", attachment.mime_type),
            ))
        }
    };

    let source = match &attachment.source {
        MediaSource::Inline(data) => json!({
            "type": "base64",
            "media_type": attachment.mime_type,
            "data": encode_base64(data),
        }),
        MediaSource::Uri(url) => json!({"type": "url", "url": url}),
    };

    Ok(json!({"type": block_type, "source": source}))
}

fn encode_cache_control(cache: &CacheControl) -> Value {
    let mut encoded = Map::new();
    encoded.insert("type".to_string(), json!("ephemeral"));
    if let Some(ttl) = cache.ttl {
        encoded.insert("ttl".to_string(), json!(ttl.as_str()));
    }
    Value::Object(encoded)
}

fn decode_cache_control(value: &Value) -> CacheControl {
    CacheControl {
        ttl: value["ttl"].as_str().and_then(CacheTtl::parse),
    }
}

/// Decode one content block. Unknown block types are skipped with a warning.
fn decode_block(block: &Value) -> Result<Option<ContentBlock>> {
    let decoded = match required_str(PROVIDER, block, "type")? {
        "text" => ContentBlock::Text(required_str(PROVIDER, block, "text")?.to_string()),
        "image" => ContentBlock::Attachment(decode_source(&block["source"], "image/jpeg")?),
        "document" => ContentBlock::Attachment(decode_source(&block["source"], "application/pdf")?),
        "tool_use" => ContentBlock::ToolCall(ToolCall {
            id: required_str(PROVIDER, block, "id")?.to_string(),
            name: required_str(PROVIDER, block, "name")?.to_string(),
            arguments: match &block["input"] {
                Value::Null => json!({}),
                input => input.clone(),
            },
        }),
        "tool_result" => ContentBlock::ToolResult(ToolResult {
            id: required_str(PROVIDER, block, "tool_use_id")?.to_string(),
            name: String::new(),
            content: decode_tool_result_content(&block["content"])?,
            is_error: block["is_error"].as_bool().unwrap_or(false),
        }),
        "thinking" => ContentBlock::Thinking(Thinking {
            text: required_str(PROVIDER, block, "thinking")?.to_string(),
            signature: block["signature"].as_str().unwrap_or_default().to_string(),
        }),
        "redacted_thinking" => {
            ContentBlock::RedactedThinking(required_str(PROVIDER, block, "data")?.to_string())
        }
        other => {
            warn!(block_type = other, "Skipping unsupported Anthropic content block");
            return Ok(None);
        }
    };
    Ok(Some(decoded))
}

fn decode_source(source: &Value, fallback_mime: &str) -> Result<Attachment> {
    match required_str(PROVIDER, source, "type")? {
        "base64" => {
            let data = decode_base64(PROVIDER, required_str(PROVIDER, source, "data")?)?;
            Ok(Attachment::inline(required_str(PROVIDER, source, "media_type")?, data))
        }
        "url" => {
            let url = required_str(PROVIDER, source, "url")?;
            Ok(Attachment::uri(mime_from_path(url, fallback_mime), url))
        }
        "text" => {
            let data = required_str(PROVIDER, source, "data")?;
            let mime = source["media_type"].as_str().unwrap_or("text/plain");
            Ok(Attachment::inline(mime, data.as_bytes().to_vec()))
        }
        other => Err(CrosstalkError::malformed(
            PROVIDER,
            format!("unknown media source type `{}`", other),
            source,
        )),
    }
}

fn decode_tool_result_content(content: &Value) -> Result<String> {
    match content {
        Value::String(text) => Ok(text.clone()),
        Value::Null => Ok(String::new()),
        Value::Array(parts) => {
            let mut texts = Vec::new();
            for part in parts {
                match part["type"].as_str() {
                    Some("text") => texts.push(required_str(PROVIDER, part, "text")?.to_string()),
                    other => warn!(
                        block_type = other.unwrap_or("<missing>"),
                        "Skipping non-text tool result content"
                    ),
                }
            }
            Ok(texts.join("\n"))
        }
        other => Err(CrosstalkError::malformed(
            PROVIDER,
            "tool_result content must be a string or an array",
            other,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stop_reason::StopReason;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter
    }

    #[test]
    fn test_encode_text_message() {
        let encoded = adapter().encode_message(&Message::user("Hello")).unwrap();

        assert_eq!(encoded["role"], "user");
        assert_eq!(encoded["content"][0]["type"], "text");
        assert_eq!(encoded["content"][0]["text"], "Hello");
    }

    #[test]
    fn test_encode_rejects_system_role() {
        let err = adapter().encode_message(&Message::system("rules")).unwrap_err();
        assert!(matches!(err, CrosstalkError::FormatUnsupported { .. }));
    }

    #[test]
    fn test_tool_use_and_thinking_roundtrip() {
        let message = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::Thinking(Thinking::new("Let me check", "sig-abc==")),
                ContentBlock::text("Checking the weather."),
                ContentBlock::ToolCall(ToolCall::new("toolu_1", "get_weather", json!({"city": "Oslo"}))),
            ],
        );

        let bytes = adapter().encode(&message).unwrap();
        let decoded = adapter().decode(&bytes).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn test_thinking_signature_copied_verbatim() {
        let message = Message::new(
            Role::Assistant,
            vec![ContentBlock::Thinking(Thinking::new("hmm", "EqQBCgIYAhIM+/opaque=="))],
        );

        let encoded = adapter().encode_message(&message).unwrap();
        assert_eq!(encoded["content"][0]["signature"], "EqQBCgIYAhIM+/opaque==");
    }

    #[test]
    fn test_tool_role_encodes_as_user_and_decodes_back() {
        let message = Message::tool_result(ToolResult::error("toolu_1", "", "city not found"));

        let encoded = adapter().encode_message(&message).unwrap();
        assert_eq!(encoded["role"], "user");
        assert_eq!(encoded["content"][0]["type"], "tool_result");
        assert_eq!(encoded["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(encoded["content"][0]["is_error"], true);

        let decoded = adapter().decode_message(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_attachments_share_source_object() {
        let message = Message::user("Compare these")
            .with_block(ContentBlock::Attachment(Attachment::inline("image/png", vec![1, 2, 3])))
            .with_block(ContentBlock::Attachment(Attachment::uri(
                "application/pdf",
                "https://example.com/report.pdf",
            )));

        let encoded = adapter().encode_message(&message).unwrap();
        let image = &encoded["content"][1];
        assert_eq!(image["type"], "image");
        assert_eq!(image["source"]["type"], "base64");
        assert_eq!(image["source"]["media_type"], "image/png");
        assert_eq!(image["source"]["data"], "AQID");

        let document = &encoded["content"][2];
        assert_eq!(document["type"], "document");
        assert_eq!(document["source"]["type"], "url");

        let decoded = adapter().decode_message(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_audio_attachment_is_unsupported() {
        let message = Message::user("listen")
            .with_block(ContentBlock::Attachment(Attachment::inline("audio/wav", vec![0])));

        let err = adapter().encode_message(&message).unwrap_err();
        assert!(matches!(err, CrosstalkError::FormatUnsupported { .. }));
    }

    #[test]
    fn test_cache_control_attaches_to_previous_block() {
        let message = Message::user("long context").with_block(ContentBlock::CacheControl(
            CacheControl {
                ttl: Some(CacheTtl::OneHour),
            },
        ));

        let encoded = adapter().encode_message(&message).unwrap();
        assert_eq!(encoded["content"].as_array().unwrap().len(), 1);
        assert_eq!(encoded["content"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(encoded["content"][0]["cache_control"]["ttl"], "1h");

        let decoded = adapter().decode_message(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_leading_cache_control_is_unsupported() {
        let message = Message::new(
            Role::User,
            vec![ContentBlock::CacheControl(CacheControl::default())],
        );
        assert!(adapter().encode_message(&message).is_err());
    }

    #[test]
    fn test_usage_annotation_roundtrip() {
        let message = Message::assistant("cached answer").with_block(ContentBlock::Usage(
            UsageMetrics {
                cache_creation_input_tokens: 12,
                cache_read_input_tokens: 340,
            },
        ));

        let encoded = adapter().encode_message(&message).unwrap();
        assert_eq!(encoded["usage"]["cache_read_input_tokens"], 340);

        let decoded = adapter().decode_message(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_string_content() {
        let decoded = adapter()
            .decode_message(&json!({"role": "user", "content": "plain"}))
            .unwrap();
        assert_eq!(decoded.content, vec![ContentBlock::text("plain")]);
    }

    #[test]
    fn test_decode_tool_result_array_content() {
        let decoded = adapter()
            .decode_message(&json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "toolu_9",
                    "content": [{"type": "text", "text": "line 1"}, {"type": "text", "text": "line 2"}]
                }]
            }))
            .unwrap();

        assert_eq!(decoded.role, Role::Tool);
        assert_eq!(decoded.tool_results()[0].content, "line 1\nline 2");
    }

    #[test]
    fn test_decode_rejects_missing_role() {
        let err = adapter().decode_message(&json!({"content": []})).unwrap_err();
        assert!(matches!(err, CrosstalkError::DecodeMalformed { .. }));
    }

    #[test]
    fn test_decode_skips_unknown_block_types() {
        let decoded = adapter()
            .decode_message(&json!({
                "role": "assistant",
                "content": [
                    {"type": "server_tool_use", "id": "srv_1", "name": "web_search", "input": {}},
                    {"type": "text", "text": "Found it"}
                ]
            }))
            .unwrap();
        assert_eq!(decoded.content, vec![ContentBlock::text("Found it")]);
    }

    #[test]
    fn test_build_request() {
        let messages = vec![
            Message::system("audit copy"),
            Message::user("Weather in Oslo?"),
        ];
        let tools = vec![ToolDeclaration::new("get_weather", "Weather", json!({"type": "object"}))];
        let options = RequestOptions::default()
            .with_system_prompt("Be brief")
            .with_max_tokens(512)
            .with_extra("metadata", json!({"user_id": "u-1"}));

        let body = adapter()
            .build_request("claude-sonnet-4-5", &messages, &tools, &options)
            .unwrap();

        assert_eq!(body["model"], "claude-sonnet-4-5");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["system"], "Be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["metadata"]["user_id"], "u-1");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_decode_response() {
        let body = json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "Hi!"}],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 10,
                "output_tokens": 3,
                "cache_creation_input_tokens": 0,
                "cache_read_input_tokens": 5
            }
        });

        let decoded = adapter().decode_response(body.to_string().as_bytes()).unwrap();

        assert_eq!(decoded.message.text(), "Hi!");
        assert_eq!(decoded.message.stop_reason, Some(StopReason::Stop));
        assert_eq!(decoded.usage.total_input(), 15);
        assert_eq!(decoded.usage.output_tokens, 3);
        assert!(matches!(decoded.message.content[1], ContentBlock::Usage(_)));
    }

    #[test]
    fn test_decode_response_error_body() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let err = adapter().decode_response(body.as_bytes()).unwrap_err();

        match err {
            CrosstalkError::UpstreamError { kind, message } => {
                assert_eq!(kind, "overloaded_error");
                assert_eq!(message, "Overloaded");
            }
            other => panic!("Expected UpstreamError, got {:?}", other),
        }
    }
}
