//! Adapter for the Ollama `/api/chat` endpoint.
//!
//! Ollama messages carry a single `content` string plus an optional array of base64 images, so
//! only text and inline images are representable. A message may hold at most one text block,
//! and it must come before any image; other layouts cannot survive the trip back.

use super::{decode_base64, encode_base64, outbound_messages, parse_body, required_str, DecodedResponse, WireAdapter};
use crate::error::{CrosstalkError, Result};
use crate::llm::gateway::RequestOptions;
use crate::llm::models::{
    Attachment, AttachmentKind, ContentBlock, MediaSource, Message, Provider, Role, TokenUsage,
};
use crate::llm::stop_reason::classify;
use crate::llm::tools::ToolDeclaration;
use serde_json::{json, Value};
use tracing::{debug, warn};

const PROVIDER: Provider = Provider::Ollama;

/// Metadata key holding a thinking model's reasoning text.
pub const THOUGHT_KEY: &str = "thought";

#[derive(Debug, Clone, Copy, Default)]
pub struct OllamaAdapter;

impl WireAdapter for OllamaAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    fn encode_message(&self, message: &Message) -> Result<Value> {
        let mut text: Option<&str> = None;
        let mut images = Vec::new();

        for block in &message.content {
            match block {
                ContentBlock::Text(_) if text.is_some() => {
                    return Err(CrosstalkError::unsupported(PROVIDER, "more than one text block"))
                }
                ContentBlock::Text(_) if !images.is_empty() => {
                    return Err(CrosstalkError::unsupported(PROVIDER, "text after an image"))
                }
                ContentBlock::Text(block_text) => text = Some(block_text.as_str()),
                ContentBlock::Attachment(attachment) => images.push(encode_image(attachment)?),
                other => {
                    return Err(CrosstalkError::unsupported(
                        PROVIDER,
                        format!("{} blocks", other.kind_name()),
                    ))
                }
            }
        }

        let mut ollama_msg = json!({
            "role": message.role.as_str(),
            "content": text.unwrap_or_default(),
        });
        if !images.is_empty() {
            ollama_msg["images"] = json!(images);
        }
        Ok(ollama_msg)
    }

    fn decode_message(&self, value: &Value) -> Result<Message> {
        let role = match required_str(PROVIDER, value, "role")? {
            "system" => Role::System,
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

        let mut content = Vec::new();
        match value["content"].as_str() {
            Some("") | None => {}
            Some(text) => content.push(ContentBlock::Text(text.to_string())),
        }

        if let Some(images) = value["images"].as_array() {
            for image in images {
                let encoded = image
                    .as_str()
                    .ok_or_else(|| CrosstalkError::malformed(PROVIDER, "image must be a base64 string", image))?;
                let data = decode_base64(PROVIDER, encoded)?;
                content.push(ContentBlock::Attachment(Attachment::inline(sniff_image_mime(&data), data)));
            }
        }

        if value["tool_calls"].as_array().is_some_and(|calls| !calls.is_empty()) {
            warn!("Ignoring Ollama tool_calls; tool use is not supported for this provider");
        }

        let mut message = Message::new(role, content);
        if let Some(thought) = value["thinking"].as_str().filter(|t| !t.is_empty()) {
            message.metadata.insert(THOUGHT_KEY.to_string(), json!(thought));
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
        if !tools.is_empty() {
            return Err(CrosstalkError::unsupported(PROVIDER, "tool declarations"));
        }

        let mut ollama_messages = Vec::new();
        if let Some(system) = &options.system_prompt {
            ollama_messages.push(json!({"role": "system", "content": system}));
        }
        for message in outbound_messages(PROVIDER, messages) {
            ollama_messages.push(self.encode_message(&message)?);
        }

        let mut body = json!({
            "model": model,
            "messages": ollama_messages,
            "options": extract_ollama_options(options),
            "stream": options.stream,
        });
        options.apply_extra(&mut body);

        debug!(model = model, stream = options.stream, "Built Ollama request");
        Ok(body)
    }

    fn decode_response(&self, body: &[u8]) -> Result<DecodedResponse> {
        let value = parse_body(PROVIDER, body)?;

        if let Some(error) = value["error"].as_str() {
            return Err(CrosstalkError::UpstreamError {
                kind: "error".to_string(),
                message: error.to_string(),
            });
        }

        let mut message = self.decode_message(&value["message"])?;
        if let Some(reason) = value["done_reason"].as_str() {
            message.stop_reason = Some(classify(PROVIDER, reason));
        }

        Ok(DecodedResponse {
            message,
            usage: decode_usage(&value),
        })
    }
}

pub(crate) fn decode_usage(value: &Value) -> TokenUsage {
    TokenUsage::new(
        value["prompt_eval_count"].as_u64().unwrap_or(0),
        value["eval_count"].as_u64().unwrap_or(0),
    )
}

fn extract_ollama_options(options: &RequestOptions) -> Value {
    let mut ollama_options = json!({
        "temperature": options.temperature,
    });

    if options.max_tokens > 0 {
        ollama_options["num_predict"] = json!(options.max_tokens);
    }
    if let Some(top_p) = options.top_p {
        ollama_options["top_p"] = json!(top_p);
    }
    if let Some(top_k) = options.top_k {
        ollama_options["top_k"] = json!(top_k);
    }
    if !options.stop_sequences.is_empty() {
        ollama_options["stop"] = json!(options.stop_sequences);
    }

    ollama_options
}

fn encode_image(attachment: &Attachment) -> Result<String> {
    if attachment.kind() != AttachmentKind::Image {
        return Err(CrosstalkError::unsupported(
            PROVIDER,
            format!("{} attachments", attachment.mime_type),
        ));
    }
    match &attachment.source {
        MediaSource::Inline(data) => Ok(encode_base64(data)),
        MediaSource::Uri(_) => Err(CrosstalkError::unsupported(PROVIDER, "URI attachments")),
    }
}

/// Ollama images carry no MIME type; recover it from the file signature.
fn sniff_image_mime(data: &[u8]) -> &'static str {
    match data {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}
