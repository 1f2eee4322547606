//! Adapter for OpenAI Chat Completions messages.

use super::{
    decode_base64, encode_base64, mime_from_path, outbound_messages, parse_body, required_str,
    DecodedResponse, WireAdapter,
};
use crate::error::{CrosstalkError, Result};
use crate::llm::gateway::RequestOptions;
use crate::llm::models::{
    Attachment, AttachmentKind, ContentBlock, MediaSource, Message, Provider, Role, TokenUsage,
    ToolCall, ToolResult,
};
use crate::llm::stop_reason::classify;
use crate::llm::tools::ToolDeclaration;
use serde_json::{json, Value};
use tracing::{debug, warn};

const PROVIDER: Provider = Provider::OpenAI;

/// Tool messages have no error flag; failures are marked in-band.
const ERROR_PREFIX: &str = "[error] ";

/// Successful results that would read as marked get one extra leading backslash.
const ESCAPE: char = '\\';

fn reads_as_marked(text: &str) -> bool {
    text.trim_start_matches(ESCAPE).starts_with(ERROR_PREFIX)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAIAdapter;

impl WireAdapter for OpenAIAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    fn encode_message(&self, message: &Message) -> Result<Value> {
        if message.role == Role::Tool {
            return encode_tool_message(message);
        }

        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();

        for block in &message.content {
            match block {
                ContentBlock::Text(text) => parts.push(json!({"type": "text", "text": text})),
                ContentBlock::Attachment(attachment) => parts.push(encode_image(attachment)?),
                ContentBlock::ToolCall(call) if message.role == Role::Assistant => {
                    tool_calls.push(json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": serde_json::to_string(&call.arguments)?,
                        }
                    }));
                }
                ContentBlock::ToolCall(_) => {
                    return Err(CrosstalkError::unsupported(
                        PROVIDER,
                        format!("tool calls on {} messages", message.role.as_str()),
                    ))
                }
                ContentBlock::ToolResult(_) => {
                    return Err(CrosstalkError::unsupported(
                        PROVIDER,
                        format!("tool results on {} messages", message.role.as_str()),
                    ))
                }
                other => {
                    return Err(CrosstalkError::unsupported(
                        PROVIDER,
                        format!("{} blocks", other.kind_name()),
                    ))
                }
            }
        }

        let mut encoded = json!({"role": message.role.as_str()});
        encoded["content"] = collapse_parts(parts, !tool_calls.is_empty());
        if !tool_calls.is_empty() {
            encoded["tool_calls"] = json!(tool_calls);
        }
        Ok(encoded)
    }

    fn decode_message(&self, value: &Value) -> Result<Message> {
        let role = match required_str(PROVIDER, value, "role")? {
            "system" | "developer" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => {
                return Err(CrosstalkError::malformed(
                    PROVIDER,
                    format!("unknown role `{}`", other),
                    value,
                ))
            }
        };

        if role == Role::Tool {
            return decode_tool_message(value);
        }
        if value.get("tool_call_id").is_some_and(|id| !id.is_null()) {
            return Err(CrosstalkError::malformed(
                PROVIDER,
                "tool_call_id on a non-tool message",
                value,
            ));
        }

        let mut content = decode_content(value)?;

        if let Some(calls) = value.get("tool_calls").filter(|calls| !calls.is_null()) {
            if role != Role::Assistant {
                return Err(CrosstalkError::malformed(
                    PROVIDER,
                    "tool_calls on a non-assistant message",
                    value,
                ));
            }
            let calls = calls
                .as_array()
                .ok_or_else(|| CrosstalkError::malformed(PROVIDER, "tool_calls must be an array", value))?;
            for call in calls {
                content.push(ContentBlock::ToolCall(decode_tool_call(call)?));
            }
        }

        let mut message = Message::new(role, content);
        if let Some(refusal) = value["refusal"].as_str() {
            message.metadata.insert("refusal".to_string(), json!(refusal));
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
        let mut wire = Vec::new();
        if let Some(system) = &options.system_prompt {
            wire.push(json!({"role": "system", "content": system}));
        }
        for message in outbound_messages(PROVIDER, messages) {
            for message in split_tool_results(message) {
                wire.push(self.encode_message(&message)?);
            }
        }

        let count = wire.len();
        let mut body = json!({
            "model": model,
            "messages": wire,
            "max_completion_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if options.top_k.is_some() {
            debug!("OpenAI does not accept top_k; ignoring");
        }
        if !options.stop_sequences.is_empty() {
            body["stop"] = json!(options.stop_sequences);
        }
        if !tools.is_empty() {
            let descriptors: Vec<_> = tools.iter().map(ToolDeclaration::to_openai).collect();
            body["tools"] = serde_json::to_value(descriptors)?;
        }
        if options.stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        options.apply_extra(&mut body);

        debug!(model = model, messages = count, "Built OpenAI request");
        Ok(body)
    }

    fn decode_response(&self, body: &[u8]) -> Result<DecodedResponse> {
        let value = parse_body(PROVIDER, body)?;

        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            return Err(CrosstalkError::UpstreamError {
                kind: error["type"].as_str().unwrap_or("error").to_string(),
                message: error["message"].as_str().unwrap_or_default().to_string(),
            });
        }

        let choice = value["choices"]
            .get(0)
            .ok_or_else(|| CrosstalkError::malformed(PROVIDER, "response has no choices", &value))?;
        let mut message = self.decode_message(&choice["message"])?;
        if let Some(reason) = choice["finish_reason"].as_str() {
            message.stop_reason = Some(classify(PROVIDER, reason));
        }

        Ok(DecodedResponse {
            message,
            usage: decode_usage(&value["usage"]),
        })
    }
}

pub(crate) fn decode_usage(usage: &Value) -> TokenUsage {
    let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let cached = usage["prompt_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0);
    TokenUsage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: cached,
    }
}

/// Parse a `tool_calls` entry; arguments arrive as a JSON string.
pub(crate) fn decode_tool_call(call: &Value) -> Result<ToolCall> {
    let function = &call["function"];
    let arguments = match function["arguments"].as_str() {
        None | Some("") => json!({}),
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            CrosstalkError::malformed_text(PROVIDER, format!("tool arguments are not JSON: {}", e), raw)
        })?,
    };
    Ok(ToolCall {
        id: required_str(PROVIDER, call, "id")?.to_string(),
        name: required_str(PROVIDER, function, "name")?.to_string(),
        arguments,
    })
}

/// A single text part collapses to a plain string; assistant turns that only call tools
/// carry `null` content.
fn collapse_parts(mut parts: Vec<Value>, has_tool_calls: bool) -> Value {
    match parts.len() {
        0 if has_tool_calls => Value::Null,
        0 => json!(""),
        1 if parts[0]["type"] == "text" => parts[0]["text"].take(),
        _ => json!(parts),
    }
}

fn encode_image(attachment: &Attachment) -> Result<Value> {
    if attachment.kind() != AttachmentKind::Image {
        return Err(CrosstalkError::unsupported(
            PROVIDER,
            format!("{} attachments", attachment.mime_type),
        ));
    }
    let url = match &attachment.source {
        MediaSource::Inline(data) => {
            format!("data:{};base64,{}", attachment.mime_type, encode_base64(data))
        }
        MediaSource::Uri(uri) => uri.clone(),
    };
    Ok(json!({"type": "image_url", "image_url": {"url": url}}))
}

fn encode_tool_message(message: &Message) -> Result<Value> {
    let result = match message.content.as_slice() {
        [ContentBlock::ToolResult(result)] => result,
        _ => {
            return Err(CrosstalkError::unsupported(
                PROVIDER,
                "tool messages that are not exactly one tool result",
            ))
        }
    };

    let content = if result.is_error {
        format!("{}{}", ERROR_PREFIX, result.content)
    } else if reads_as_marked(&result.content) {
        format!("{}{}", ESCAPE, result.content)
    } else {
        result.content.clone()
    };
    let mut encoded = json!({
        "role": "tool",
        "tool_call_id": result.id,
        "content": content,
    });
    if !result.name.is_empty() {
        encoded["name"] = json!(result.name);
    }
    Ok(encoded)
}

fn decode_tool_message(value: &Value) -> Result<Message> {
    let raw = match &value["content"] {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => return Err(CrosstalkError::malformed(PROVIDER, "invalid tool content", other)),
    };
    let (content, is_error) = match raw.strip_prefix(ERROR_PREFIX) {
        Some(rest) => (rest.to_string(), true),
        None if reads_as_marked(&raw) => (raw[ESCAPE.len_utf8()..].to_string(), false),
        None => (raw, false),
    };

    Ok(Message::tool_result(ToolResult {
        id: required_str(PROVIDER, value, "tool_call_id")?.to_string(),
        name: value["name"].as_str().unwrap_or_default().to_string(),
        content,
        is_error,
    }))
}

fn decode_content(value: &Value) -> Result<Vec<ContentBlock>> {
    match &value["content"] {
        Value::Null => Ok(Vec::new()),
        Value::String(text) if text.is_empty() => Ok(Vec::new()),
        Value::String(text) => Ok(vec![ContentBlock::Text(text.clone())]),
        Value::Array(parts) => {
            let mut blocks = Vec::new();
            for part in parts {
                match part["type"].as_str() {
                    Some("text") => {
                        blocks.push(ContentBlock::Text(required_str(PROVIDER, part, "text")?.to_string()))
                    }
                    Some("image_url") => blocks.push(ContentBlock::Attachment(decode_image(part)?)),
                    other => warn!(part_type = ?other, "Skipping unsupported OpenAI content part"),
                }
            }
            Ok(blocks)
        }
        other => Err(CrosstalkError::malformed(PROVIDER, "content must be a string or array", other)),
    }
}

fn decode_image(part: &Value) -> Result<Attachment> {
    let url = match &part["image_url"] {
        Value::String(url) => url.as_str(),
        object => required_str(PROVIDER, object, "url")?,
    };

    if let Some(rest) = url.strip_prefix("data:") {
        let (header, data) = rest
            .split_once(',')
            .ok_or_else(|| CrosstalkError::malformed(PROVIDER, "data URL without payload", part))?;
        let mime = header.strip_suffix(";base64").ok_or_else(|| {
            CrosstalkError::malformed(PROVIDER, "only base64 data URLs are supported", part)
        })?;
        return Ok(Attachment::inline(mime, decode_base64(PROVIDER, data)?));
    }

    Ok(Attachment::uri(mime_from_path(url, "image/jpeg"), url))
}

/// Tool messages carry one result each; a multi-result tool message becomes several.
fn split_tool_results(message: Message) -> Vec<Message> {
    if message.role != Role::Tool || message.content.len() <= 1 {
        return vec![message];
    }
    message
        .content
        .into_iter()
        .map(|block| Message::new(Role::Tool, vec![block]))
        .collect()
}
