//! Adapter for the Gemini `generateContent` API.
//!
//! Messages carry `parts`; the assistant role is called `model`. Function calls and responses
//! replace tool use/result, inline media goes in `inline_data` and URI references in `file_data`.
//! Decoding accepts both the snake_case and camelCase spellings the API emits.

use super::{
    decode_base64, encode_base64, outbound_messages, parse_body, required_str, DecodedResponse,
    WireAdapter,
};
use crate::error::{CrosstalkError, Result};
use crate::llm::gateway::RequestOptions;
use crate::llm::models::{
    Attachment, ContentBlock, MediaSource, Message, Provider, Role, Thinking, TokenUsage, ToolCall,
    ToolResult,
};
use crate::llm::stop_reason::{classify_message, StopReason};
use crate::llm::tools::ToolDeclaration;
use serde_json::{json, Value};
use tracing::{debug, warn};

const PROVIDER: Provider = Provider::Gemini;

/// Metadata key for thought signatures attached to non-thought parts.
///
/// The value is a bare string when there is one signature on the block the encoder would pick
/// anyway (the first function call, else the first non-thought block). Otherwise it is an
/// object mapping each signed block's position to its signature.
pub const THOUGHT_SIGNATURE_KEY: &str = "thought_signature";

#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiAdapter;

impl WireAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    fn encode_message(&self, message: &Message) -> Result<Value> {
        let role = match message.role {
            Role::User | Role::Tool => "user",
            Role::Assistant => "model",
            Role::System => {
                return Err(CrosstalkError::unsupported(
                    PROVIDER,
                    "system-role messages (use system_instruction)",
                ))
            }
        };

        let mut parts = message
            .content
            .iter()
            .map(encode_part)
            .collect::<Result<Vec<_>>>()?;

        match message.metadata.get(THOUGHT_SIGNATURE_KEY) {
            Some(Value::String(signature)) => match default_signature_target(&message.content) {
                Some(index) => parts[index]["thought_signature"] = json!(signature),
                None => warn!("Thought signature has no part to attach to"),
            },
            Some(Value::Object(by_block)) => {
                for (position, signature) in by_block {
                    let (Ok(index), Some(signature)) = (position.parse::<usize>(), signature.as_str()) else {
                        warn!(position = %position, "Skipping unreadable thought signature entry");
                        continue;
                    };
                    match parts.get_mut(index) {
                        Some(part) => part["thought_signature"] = json!(signature),
                        None => parts.push(json!({"thought_signature": signature})),
                    }
                }
            }
            Some(other) => warn!(value = %other, "Ignoring thought signature metadata of unknown shape"),
            None => {}
        }

        Ok(json!({"role": role, "parts": parts}))
    }

    fn decode_message(&self, value: &Value) -> Result<Message> {
        let role = match value["role"].as_str() {
            Some("user") => Role::User,
            Some("model") | None => Role::Assistant,
            Some("function") => Role::Tool,
            Some(other) => {
                return Err(CrosstalkError::malformed(
                    PROVIDER,
                    format!("unknown role `{}`", other),
                    value,
                ))
            }
        };

        let mut content = Vec::new();
        let mut signed: Vec<(usize, String)> = Vec::new();
        let parts = match &value["parts"] {
            Value::Array(parts) => parts.as_slice(),
            Value::Null => &[][..],
            other => {
                return Err(CrosstalkError::malformed(PROVIDER, "parts must be an array", other))
            }
        };

        for part in parts {
            let is_thought = part["thought"].as_bool().unwrap_or(false);
            let part_signature = field(part, "thought_signature", "thoughtSignature").and_then(Value::as_str);

            if !is_thought {
                if let Some(sig) = part_signature {
                    signed.push((content.len(), sig.to_string()));
                }
            }

            if let Some(block) = decode_part(part, is_thought, part_signature)? {
                content.push(block);
            }
        }

        let role = if role == Role::User
            && !content.is_empty()
            && content.iter().all(|block| matches!(block, ContentBlock::ToolResult(_)))
        {
            Role::Tool
        } else {
            role
        };

        let default_target = default_signature_target(&content);
        let mut message = Message::new(role, content);
        if let Some(signatures) = signature_metadata(&signed, default_target) {
            message.metadata.insert(THOUGHT_SIGNATURE_KEY.to_string(), signatures);
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
        let contents = outbound_messages(PROVIDER, messages)
            .iter()
            .map(|message| self.encode_message(message))
            .collect::<Result<Vec<_>>>()?;

        let mut generation_config = json!({
            "max_output_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        if let Some(top_p) = options.top_p {
            generation_config["top_p"] = json!(top_p);
        }
        if let Some(top_k) = options.top_k {
            generation_config["top_k"] = json!(top_k);
        }
        if !options.stop_sequences.is_empty() {
            generation_config["stop_sequences"] = json!(options.stop_sequences);
        }

        let mut body = json!({
            "contents": contents,
            "generation_config": generation_config,
        });
        if let Some(system) = &options.system_prompt {
            body["system_instruction"] = json!({"parts": [{"text": system}]});
        }
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools.iter().map(ToolDeclaration::to_gemini).collect();
            body["tools"] = json!([{"function_declarations": declarations}]);
        }
        options.apply_extra(&mut body);

        debug!(model = model, tools = tools.len(), "Built Gemini request");
        Ok(body)
    }

    fn decode_response(&self, body: &[u8]) -> Result<DecodedResponse> {
        let value = parse_body(PROVIDER, body)?;

        if let Some(error) = value.get("error") {
            return Err(CrosstalkError::UpstreamError {
                kind: error["status"].as_str().unwrap_or("error").to_string(),
                message: error["message"].as_str().unwrap_or_default().to_string(),
            });
        }

        let usage = decode_usage(field(&value, "usage_metadata", "usageMetadata"));
        let candidate = value["candidates"].get(0);

        let Some(candidate) = candidate else {
            let feedback = field(&value, "prompt_feedback", "promptFeedback");
            if let Some(reason) = feedback.and_then(|f| field(f, "block_reason", "blockReason")) {
                let message = Message::new(Role::Assistant, vec![])
                    .with_stop_reason(StopReason::Blocked)
                    .with_metadata("block_reason", reason.clone());
                return Ok(DecodedResponse { message, usage });
            }
            return Err(CrosstalkError::malformed(PROVIDER, "response has no candidates", &value));
        };

        let mut message = match candidate.get("content") {
            Some(content) => self.decode_message(content)?,
            None => Message::new(Role::Assistant, vec![]),
        };
        if let Some(reason) = field(candidate, "finish_reason", "finishReason").and_then(Value::as_str) {
            message.stop_reason = Some(classify_message(PROVIDER, reason, &message));
        }

        Ok(DecodedResponse { message, usage })
    }
}

/// Read a field under either of its spellings.
pub(crate) fn field<'a>(value: &'a Value, snake: &str, camel: &str) -> Option<&'a Value> {
    value.get(snake).or_else(|| value.get(camel))
}

/// Block a lone signature is attached to: the first function call, else the first non-thought block.
pub(crate) fn default_signature_target(content: &[ContentBlock]) -> Option<usize> {
    content
        .iter()
        .position(|block| matches!(block, ContentBlock::ToolCall(_)))
        .or_else(|| {
            content
                .iter()
                .position(|block| !matches!(block, ContentBlock::Thinking(_)))
        })
}

/// Metadata value for `(block position, signature)` pairs; see [`THOUGHT_SIGNATURE_KEY`].
pub(crate) fn signature_metadata(signed: &[(usize, String)], default_target: Option<usize>) -> Option<Value> {
    match signed {
        [] => None,
        [(index, signature)] if Some(*index) == default_target => Some(json!(signature)),
        _ => Some(Value::Object(
            signed
                .iter()
                .map(|(index, signature)| (index.to_string(), json!(signature)))
                .collect(),
        )),
    }
}

pub(crate) fn decode_usage(metadata: Option<&Value>) -> TokenUsage {
    let Some(metadata) = metadata else {
        return TokenUsage::default();
    };
    let count = |snake: &str, camel: &str| {
        field(metadata, snake, camel)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };

    let prompt = count("prompt_token_count", "promptTokenCount");
    let cached = count("cached_content_token_count", "cachedContentTokenCount");
    let output = count("candidates_token_count", "candidatesTokenCount")
        + count("thoughts_token_count", "thoughtsTokenCount");

    TokenUsage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: output,
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: cached,
    }
}

fn encode_part(block: &ContentBlock) -> Result<Value> {
    let part = match block {
        ContentBlock::Text(text) => json!({"text": text}),
        ContentBlock::Thinking(thinking) => {
            let mut part = json!({"text": thinking.text, "thought": true});
            if !thinking.signature.is_empty() {
                part["thought_signature"] = json!(thinking.signature);
            }
            part
        }
        ContentBlock::Attachment(attachment) => match &attachment.source {
            MediaSource::Inline(data) => json!({
                "inline_data": {
                    "mime_type": attachment.mime_type,
                    "data": encode_base64(data),
                }
            }),
            MediaSource::Uri(uri) => json!({
                "file_data": {
                    "mime_type": attachment.mime_type,
                    "file_uri": uri,
                }
            }),
        },
        ContentBlock::ToolCall(call) => json!({
            "function_call": {
                "id": call.id,
                "name": call.name,
                "args": call.arguments,
            }
        }),
        ContentBlock::ToolResult(result) if result.name.is_empty() => {
            return Err(CrosstalkError::unsupported(
                PROVIDER,
                format!("tool result `{}` without a function name", result.id),
            ))
        }
        ContentBlock::ToolResult(result) => {
            let response = if result.is_error {
                json!({"error": result.content})
            } else {
                json!({"content": result.content})
            };
            json!({
                "function_response": {
                    "id": result.id,
                    "name": result.name,
                    "response": response,
                }
            })
        }
        ContentBlock::RedactedThinking(_) | ContentBlock::CacheControl(_) | ContentBlock::Usage(_) => {
            return Err(CrosstalkError::unsupported(
                PROVIDER,
                format!("{} blocks", block.kind_name()),
            ))
        }
    };
    Ok(part)
}

pub(crate) fn decode_part(part: &Value, is_thought: bool, signature: Option<&str>) -> Result<Option<ContentBlock>> {
    if let Some(text) = part.get("text") {
        let text = text
            .as_str()
            .ok_or_else(|| CrosstalkError::malformed(PROVIDER, "text part must be a string", part))?;
        return Ok(Some(if is_thought {
            ContentBlock::Thinking(Thinking::new(text, signature.unwrap_or_default()))
        } else {
            ContentBlock::Text(text.to_string())
        }));
    }

    if let Some(inline) = field(part, "inline_data", "inlineData") {
        let mime = field(inline, "mime_type", "mimeType")
            .and_then(Value::as_str)
            .ok_or_else(|| CrosstalkError::malformed(PROVIDER, "inline_data without mime_type", part))?;
        let data = decode_base64(PROVIDER, required_str(PROVIDER, inline, "data")?)?;
        return Ok(Some(ContentBlock::Attachment(Attachment::inline(mime, data))));
    }

    if let Some(file) = field(part, "file_data", "fileData") {
        let uri = field(file, "file_uri", "fileUri")
            .and_then(Value::as_str)
            .ok_or_else(|| CrosstalkError::malformed(PROVIDER, "file_data without file_uri", part))?;
        let mime = field(file, "mime_type", "mimeType")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream");
        return Ok(Some(ContentBlock::Attachment(Attachment::uri(mime, uri))));
    }

    if let Some(call) = field(part, "function_call", "functionCall") {
        let id = match call["id"].as_str() {
            Some(id) => id.to_string(),
            None => format!("call_{}", uuid::Uuid::new_v4().simple()),
        };
        return Ok(Some(ContentBlock::ToolCall(ToolCall {
            id,
            name: required_str(PROVIDER, call, "name")?.to_string(),
            arguments: match &call["args"] {
                Value::Null => json!({}),
                args => args.clone(),
            },
        })));
    }

    if let Some(response) = field(part, "function_response", "functionResponse") {
        let payload = &response["response"];
        let (content, is_error) = match (payload.get("content"), payload.get("error")) {
            (Some(content), None) => (value_text(content), false),
            (None, Some(error)) => (value_text(error), true),
            _ => (payload.to_string(), false),
        };
        return Ok(Some(ContentBlock::ToolResult(ToolResult {
            id: response["id"].as_str().unwrap_or_default().to_string(),
            name: required_str(PROVIDER, response, "name")?.to_string(),
            content,
            is_error,
        })));
    }

    if signature.is_some() && part.as_object().map(|o| o.len()) == Some(1) {
        // Bare signature carrier; the signature itself is kept in metadata.
        return Ok(None);
    }

    warn!(part = %part, "Skipping unsupported Gemini part");
    Ok(None)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
