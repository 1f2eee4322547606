//! Translation of each provider's native streaming chunks into [`StreamEvent`]s.
//!
//! Anthropic already speaks the canonical vocabulary. OpenAI and Gemini send whole-response
//! chunks with no block boundaries, and Ollama sends one NDJSON object per token batch, so their
//! normalizers track which blocks are open and synthesize start/stop events around them.

use super::events::{BlockKind, Delta, RawEvent, StreamEvent};
use crate::error::{CrosstalkError, Result};
use crate::llm::adapters::{gemini, ollama, openai};
use crate::llm::models::{ContentBlock, Provider, Role, TokenUsage};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Stateful translator for one response stream.
pub trait EventNormalizer: Send {
    /// Translate one framed event. May yield zero or more canonical events.
    fn normalize(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>>;

    /// Called once the byte stream ends; flushes anything still open.
    fn finish(&mut self) -> Result<Vec<StreamEvent>>;
}

pub fn normalizer_for(provider: Provider) -> Box<dyn EventNormalizer> {
    match provider {
        Provider::Anthropic => Box::new(AnthropicNormalizer),
        Provider::Gemini => Box::new(GeminiNormalizer::default()),
        Provider::OpenAI => Box::new(OpenAINormalizer::default()),
        Provider::Ollama => Box::new(OllamaNormalizer::default()),
    }
}

fn parse_chunk(provider: Provider, raw: &RawEvent) -> Result<Value> {
    serde_json::from_str(&raw.data).map_err(|e| {
        CrosstalkError::malformed_text(provider, format!("invalid stream chunk: {}", e), &raw.data)
    })
}

/// `{"error": {...}}` payloads some providers send mid-stream.
fn error_event(chunk: &Value) -> Option<StreamEvent> {
    let error = chunk.get("error").filter(|e| !e.is_null())?;
    Some(match error {
        Value::String(message) => StreamEvent::Error {
            kind: "error".to_string(),
            message: message.clone(),
        },
        object => StreamEvent::Error {
            kind: object["type"]
                .as_str()
                .or_else(|| object["status"].as_str())
                .unwrap_or("error")
                .to_string(),
            message: object["message"].as_str().unwrap_or_default().to_string(),
        },
    })
}

#[derive(Debug, Clone, Copy)]
pub struct AnthropicNormalizer;

impl EventNormalizer for AnthropicNormalizer {
    fn normalize(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>> {
        Ok(StreamEvent::from_anthropic(&raw.data)?.into_iter().collect())
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        Ok(Vec::new())
    }
}

/// Bookkeeping shared by the normalizers that synthesize block boundaries.
#[derive(Debug, Default)]
struct Synthesizer {
    started: bool,
    finished: bool,
    /// The provider's own end marker has arrived; only then may the message be closed.
    terminal: bool,
    next_index: u32,
    open: Vec<u32>,
    stop_reason: Option<String>,
    usage: TokenUsage,
}

impl Synthesizer {
    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                role: Role::Assistant,
                usage: TokenUsage::default(),
            });
        }
    }

    fn open(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        self.open.push(index);
        events.push(StreamEvent::BlockStart { index, kind });
        index
    }

    fn close(&mut self, index: u32, events: &mut Vec<StreamEvent>) {
        self.open.retain(|open| *open != index);
        events.push(StreamEvent::BlockStop { index });
    }

    /// A started stream that stops before its end marker is truncated, not complete.
    fn check_terminated(&self, provider: Provider) -> Result<()> {
        if self.started && !self.finished && !self.terminal {
            return Err(CrosstalkError::violation(format!(
                "{} stream ended before its final chunk",
                provider
            )));
        }
        Ok(())
    }

    /// Close every open block and end the message. Idempotent.
    fn end(&mut self) -> Vec<StreamEvent> {
        if self.finished || !self.started {
            return Vec::new();
        }
        self.finished = true;

        let mut events: Vec<StreamEvent> = std::mem::take(&mut self.open)
            .into_iter()
            .map(|index| StreamEvent::BlockStop { index })
            .collect();
        events.push(StreamEvent::MessageDelta {
            stop_reason: self.stop_reason.take(),
            stop_sequence: None,
            usage: self.usage,
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

/// OpenAI `chat.completion.chunk` stream, terminated by `data: [DONE]`.
#[derive(Debug, Default)]
pub struct OpenAINormalizer {
    sync: Synthesizer,
    text_block: Option<u32>,
    /// OpenAI tool-call index to block index.
    tool_blocks: BTreeMap<u64, u32>,
    refusal: String,
}

impl EventNormalizer for OpenAINormalizer {
    fn normalize(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>> {
        if raw.data.trim() == "[DONE]" {
            self.sync.terminal = true;
            return self.finish();
        }

        let chunk = parse_chunk(Provider::OpenAI, raw)?;
        if let Some(error) = error_event(&chunk) {
            return Ok(vec![error]);
        }

        let mut events = Vec::new();
        self.sync.ensure_started(&mut events);

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.sync.usage = openai::decode_usage(usage);
        }

        let Some(choice) = chunk["choices"].get(0) else {
            return Ok(events);
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            let index = match self.text_block {
                Some(index) => index,
                None => {
                    let index = self.sync.open(
                        BlockKind::Text {
                            text: String::new(),
                        },
                        &mut events,
                    );
                    self.text_block = Some(index);
                    index
                }
            };
            events.push(StreamEvent::BlockDelta {
                index,
                delta: Delta::Text(text.to_string()),
            });
        }

        if let Some(refusal) = delta["refusal"].as_str() {
            self.refusal.push_str(refusal);
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let position = call["index"].as_u64().unwrap_or(0);
                let index = match self.tool_blocks.get(&position) {
                    Some(index) => *index,
                    None => {
                        let id = call["id"].as_str().ok_or_else(|| {
                            CrosstalkError::malformed(Provider::OpenAI, "first tool call chunk has no id", call)
                        })?;
                        let name = call["function"]["name"].as_str().unwrap_or_default();
                        let index = self.sync.open(
                            BlockKind::ToolCall {
                                id: id.to_string(),
                                name: name.to_string(),
                            },
                            &mut events,
                        );
                        self.tool_blocks.insert(position, index);
                        index
                    }
                };
                if let Some(arguments) = call["function"]["arguments"].as_str().filter(|a| !a.is_empty()) {
                    events.push(StreamEvent::BlockDelta {
                        index,
                        delta: Delta::InputJson(arguments.to_string()),
                    });
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.sync.terminal = true;
            self.sync.stop_reason = Some(reason.to_string());
        }

        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        self.sync.check_terminated(Provider::OpenAI)?;
        let mut events = Vec::new();
        if !self.refusal.is_empty() && !self.sync.finished {
            events.push(StreamEvent::Metadata {
                key: "refusal".to_string(),
                value: json!(std::mem::take(&mut self.refusal)),
            });
        }
        events.extend(self.sync.end());
        Ok(events)
    }
}

/// Gemini `streamGenerateContent?alt=sse` chunks. Parts arrive whole; a run of consecutive text
/// parts (or unsigned thought parts) is merged into one block.
#[derive(Debug, Default)]
pub struct GeminiNormalizer {
    sync: Synthesizer,
    /// Text or thought block still accepting fragments.
    run: Option<(Run, u32)>,
    first_call: Option<u32>,
    first_non_thought: Option<u32>,
    /// Signatures carried by non-thought parts, by block position.
    signatures: Vec<(usize, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run {
    Text,
    Thought,
}

impl GeminiNormalizer {
    fn extend_run(&mut self, run: Run, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some((open, index)) = self.run {
            if open == run {
                return index;
            }
        }
        self.end_run(events);
        let kind = match run {
            Run::Text => BlockKind::Text { text: String::new() },
            Run::Thought => BlockKind::Thinking {
                text: String::new(),
                signature: String::new(),
            },
        };
        let index = self.sync.open(kind, events);
        self.run = Some((run, index));
        index
    }

    fn end_run(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some((_, index)) = self.run.take() {
            self.sync.close(index, events);
        }
    }

    fn landed(&mut self, index: u32, is_call: bool) {
        self.first_non_thought.get_or_insert(index);
        if is_call {
            self.first_call.get_or_insert(index);
        }
    }

    fn part(&mut self, part: &Value, events: &mut Vec<StreamEvent>) -> Result<()> {
        let is_thought = part["thought"].as_bool().unwrap_or(false);
        let signature = gemini::field(part, "thought_signature", "thoughtSignature").and_then(Value::as_str);

        let landed_at = match gemini::decode_part(part, is_thought, signature)? {
            Some(ContentBlock::Text(text)) => {
                let index = self.extend_run(Run::Text, events);
                events.push(StreamEvent::BlockDelta {
                    index,
                    delta: Delta::Text(text),
                });
                self.landed(index, false);
                Some(index)
            }
            Some(ContentBlock::Thinking(thinking)) => {
                let index = self.extend_run(Run::Thought, events);
                events.push(StreamEvent::BlockDelta {
                    index,
                    delta: Delta::Thinking(thinking.text),
                });
                // A signature seals its thought; the next thought part starts a new block.
                if !thinking.signature.is_empty() {
                    events.push(StreamEvent::BlockDelta {
                        index,
                        delta: Delta::Signature(thinking.signature),
                    });
                    self.end_run(events);
                }
                None
            }
            Some(ContentBlock::ToolCall(call)) => {
                self.end_run(events);
                let kind = BlockKind::ToolCall {
                    id: call.id,
                    name: call.name,
                };
                let index = self.sync.open(kind, events);
                events.push(StreamEvent::BlockDelta {
                    index,
                    delta: Delta::InputJson(call.arguments.to_string()),
                });
                self.sync.close(index, events);
                self.landed(index, true);
                Some(index)
            }
            Some(ContentBlock::Attachment(attachment)) => {
                self.end_run(events);
                let index = self.sync.open(BlockKind::Attachment(attachment), events);
                self.sync.close(index, events);
                self.landed(index, false);
                Some(index)
            }
            Some(other) => {
                warn!(block = other.kind_name(), "Ignoring unexpected block in Gemini stream");
                None
            }
            None => None,
        };

        if let (false, Some(signature)) = (is_thought, signature) {
            // A bare signature part belongs to the position of the next block.
            let position = landed_at.unwrap_or(self.sync.next_index);
            self.signatures.push((position as usize, signature.to_string()));
        }
        Ok(())
    }
}

impl EventNormalizer for GeminiNormalizer {
    fn normalize(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>> {
        let chunk = parse_chunk(Provider::Gemini, raw)?;
        if let Some(error) = error_event(&chunk) {
            return Ok(vec![error]);
        }

        let mut events = Vec::new();
        self.sync.ensure_started(&mut events);

        if let Some(metadata) = gemini::field(&chunk, "usage_metadata", "usageMetadata") {
            self.sync.usage = gemini::decode_usage(Some(metadata));
        }

        let Some(candidate) = chunk["candidates"].get(0) else {
            let feedback = gemini::field(&chunk, "prompt_feedback", "promptFeedback");
            if let Some(reason) = feedback
                .and_then(|f| gemini::field(f, "block_reason", "blockReason"))
                .and_then(Value::as_str)
            {
                debug!(reason = reason, "Gemini blocked the prompt");
                self.sync.terminal = true;
                self.sync.stop_reason = Some("SAFETY".to_string());
                events.push(StreamEvent::Metadata {
                    key: "block_reason".to_string(),
                    value: json!(reason),
                });
            }
            return Ok(events);
        };

        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                self.part(part, &mut events)?;
            }
        }

        if let Some(reason) = gemini::field(candidate, "finish_reason", "finishReason").and_then(Value::as_str) {
            self.sync.terminal = true;
            self.sync.stop_reason = Some(reason.to_string());
        }

        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        self.sync.check_terminated(Provider::Gemini)?;
        let mut events = Vec::new();
        if !self.sync.finished {
            let default_target = self.first_call.or(self.first_non_thought).map(|index| index as usize);
            if let Some(value) = gemini::signature_metadata(&self.signatures, default_target) {
                events.push(StreamEvent::Metadata {
                    key: gemini::THOUGHT_SIGNATURE_KEY.to_string(),
                    value,
                });
            }
            self.signatures.clear();
        }
        events.extend(self.sync.end());
        Ok(events)
    }
}

/// Ollama NDJSON chat stream; the final object has `done: true` and the token counts.
#[derive(Debug, Default)]
pub struct OllamaNormalizer {
    sync: Synthesizer,
    text_block: Option<u32>,
    thought: String,
}

impl EventNormalizer for OllamaNormalizer {
    fn normalize(&mut self, raw: &RawEvent) -> Result<Vec<StreamEvent>> {
        let chunk = parse_chunk(Provider::Ollama, raw)?;
        if let Some(error) = error_event(&chunk) {
            return Ok(vec![error]);
        }

        let mut events = Vec::new();
        self.sync.ensure_started(&mut events);

        let message = &chunk["message"];
        if let Some(thinking) = message["thinking"].as_str() {
            self.thought.push_str(thinking);
        }
        if let Some(text) = message["content"].as_str().filter(|t| !t.is_empty()) {
            let index = match self.text_block {
                Some(index) => index,
                None => {
                    let index = self.sync.open(BlockKind::Text { text: String::new() }, &mut events);
                    self.text_block = Some(index);
                    index
                }
            };
            events.push(StreamEvent::BlockDelta {
                index,
                delta: Delta::Text(text.to_string()),
            });
        }
        if message["tool_calls"].as_array().is_some_and(|calls| !calls.is_empty()) {
            warn!("Ignoring Ollama tool_calls in stream");
        }

        if chunk["done"].as_bool().unwrap_or(false) {
            self.sync.terminal = true;
            self.sync.usage = ollama::decode_usage(&chunk);
            self.sync.stop_reason = chunk["done_reason"].as_str().map(str::to_string);
            events.extend(self.finish()?);
        }

        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        self.sync.check_terminated(Provider::Ollama)?;
        let mut events = Vec::new();
        if !self.thought.is_empty() && !self.sync.finished {
            events.push(StreamEvent::Metadata {
                key: ollama::THOUGHT_KEY.to_string(),
                value: json!(std::mem::take(&mut self.thought)),
            });
        }
        events.extend(self.sync.end());
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::streaming::assembler::StreamAssembler;
    use crate::llm::models::{Attachment, Thinking, ToolCall};
    use crate::llm::stop_reason::StopReason;

    fn run(provider: Provider, lines: &[&str]) -> Result<crate::llm::streaming::Assembled> {
        let mut normalizer = normalizer_for(provider);
        let mut assembler = StreamAssembler::new(provider);
        let mut events = Vec::new();
        for line in lines {
            events.extend(normalizer.normalize(&RawEvent::data(*line))?);
        }
        events.extend(normalizer.finish()?);

        for event in events {
            if let Some(done) = assembler.apply(event)? {
                return Ok(done);
            }
        }
        Err(CrosstalkError::violation("no message stop"))
    }

    #[test]
    fn test_anthropic_passthrough() {
        let mut normalizer = AnthropicNormalizer;
        let events = normalizer
            .normalize(&RawEvent::new(Some("ping".to_string()), r#"{"type": "ping"}"#))
            .unwrap();
        assert_eq!(events, vec![StreamEvent::Ping]);
        assert!(normalizer.finish().unwrap().is_empty());
    }

    #[test]
    fn test_openai_text_and_tool_call_stream() {
        let assembled = run(
            Provider::OpenAI,
            &[
                r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
                r#"{"choices":[{"index":0,"delta":{"content":"Checking"}}]}"#,
                r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"get_weather","arguments":""}}]}}]}"#,
                r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":"}}]}}]}"#,
                r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Oslo\"}"}}]}}]}"#,
                r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":40,"completion_tokens":18}}"#,
                "[DONE]",
            ],
        )
        .unwrap();

        assert_eq!(
            assembled.message.content,
            vec![
                ContentBlock::text("Checking"),
                ContentBlock::ToolCall(ToolCall::new("call_1", "get_weather", json!({"city": "Oslo"}))),
            ]
        );
        assert_eq!(assembled.message.stop_reason, Some(StopReason::ToolCall));
        assert_eq!(assembled.usage, TokenUsage::new(40, 18));
    }

    #[test]
    fn test_openai_done_then_finish_is_idempotent() {
        let mut normalizer = OpenAINormalizer::default();
        normalizer
            .normalize(&RawEvent::data(r#"{"choices":[{"delta":{"content":"x"}}]}"#))
            .unwrap();
        let closing = normalizer.normalize(&RawEvent::data("[DONE]")).unwrap();

        assert_eq!(closing.last(), Some(&StreamEvent::MessageStop));
        assert!(normalizer.finish().unwrap().is_empty());
    }

    #[test]
    fn test_openai_error_chunk() {
        let err = run(
            Provider::OpenAI,
            &[r#"{"error":{"message":"server overloaded","type":"server_error"}}"#],
        )
        .unwrap_err();
        assert!(matches!(err, CrosstalkError::UpstreamError { ref kind, .. } if kind == "server_error"));
    }

    #[test]
    fn test_gemini_stream_merges_text_and_keeps_signature() {
        let assembled = run(
            Provider::Gemini,
            &[
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"weighing","thought":true,"thoughtSignature":"sig-t"}]}}]}"#,
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello, "}]}}]}"#,
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"world","thoughtSignature":"sig-m"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":8,"candidatesTokenCount":3,"thoughtsTokenCount":2}}"#,
            ],
        )
        .unwrap();

        assert_eq!(
            assembled.message.content,
            vec![
                ContentBlock::Thinking(Thinking::new("weighing", "sig-t")),
                ContentBlock::text("Hello, world"),
            ]
        );
        assert_eq!(assembled.message.metadata[gemini::THOUGHT_SIGNATURE_KEY], "sig-m");
        assert_eq!(assembled.message.stop_reason, Some(StopReason::Stop));
        assert_eq!(assembled.usage, TokenUsage::new(8, 5));
    }

    #[test]
    fn test_gemini_function_call_stop_is_tool_call() {
        let assembled = run(
            Provider::Gemini,
            &[
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"id":"fc_1","name":"lookup","args":{"q":"rust"}}}]},"finishReason":"STOP"}]}"#,
            ],
        )
        .unwrap();

        assert_eq!(assembled.message.tool_calls()[0].arguments, json!({"q": "rust"}));
        assert_eq!(assembled.message.stop_reason, Some(StopReason::ToolCall));
    }

    #[test]
    fn test_gemini_inline_media_part() {
        let assembled = run(
            Provider::Gemini,
            &[r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"image/png","data":"AQI="}}]},"finishReason":"STOP"}]}"#],
        )
        .unwrap();

        assert_eq!(
            assembled.message.content,
            vec![ContentBlock::Attachment(Attachment::inline("image/png", vec![1, 2]))]
        );
    }

    #[test]
    fn test_gemini_blocked_prompt() {
        let assembled = run(Provider::Gemini, &[r#"{"promptFeedback":{"blockReason":"PROHIBITED_CONTENT"}}"#])
            .unwrap();

        assert_eq!(assembled.message.stop_reason, Some(StopReason::Blocked));
        assert_eq!(assembled.message.metadata["block_reason"], "PROHIBITED_CONTENT");
    }

    #[test]
    fn test_ollama_stream_with_thinking() {
        let assembled = run(
            Provider::Ollama,
            &[
                r#"{"model":"qwen3","message":{"role":"assistant","content":"","thinking":"Let me "},"done":false}"#,
                r#"{"model":"qwen3","message":{"role":"assistant","content":"","thinking":"think."},"done":false}"#,
                r#"{"model":"qwen3","message":{"role":"assistant","content":"The answer"},"done":false}"#,
                r#"{"model":"qwen3","message":{"role":"assistant","content":" is 4."},"done":false}"#,
                r#"{"model":"qwen3","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":20,"eval_count":9}"#,
            ],
        )
        .unwrap();

        assert_eq!(assembled.message.text(), "The answer is 4.");
        assert_eq!(assembled.message.metadata[ollama::THOUGHT_KEY], "Let me think.");
        assert_eq!(assembled.message.stop_reason, Some(StopReason::Stop));
        assert_eq!(assembled.usage, TokenUsage::new(20, 9));
    }

    #[test]
    fn test_ollama_error_line() {
        let mut normalizer = OllamaNormalizer::default();
        let events = normalizer
            .normalize(&RawEvent::data(r#"{"error":"model not found"}"#))
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                kind: "error".to_string(),
                message: "model not found".to_string()
            }]
        );
    }

    #[test]
    fn test_openai_stream_cut_before_done_is_violation() {
        let err = run(
            Provider::OpenAI,
            &[
                r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"The answer"}}]}"#,
                r#"{"choices":[{"index":0,"delta":{"content":" is"}}]}"#,
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CrosstalkError::StreamProtocolViolation(ref detail) if detail.contains("openai")));
    }

    #[test]
    fn test_openai_finish_reason_without_done_completes() {
        let assembled = run(
            Provider::OpenAI,
            &[r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":"stop"}]}"#],
        )
        .unwrap();
        assert_eq!(assembled.message.text(), "Hi");
        assert_eq!(assembled.message.stop_reason, Some(StopReason::Stop));
    }

    #[test]
    fn test_gemini_stream_cut_before_finish_reason_is_violation() {
        let err = run(
            Provider::Gemini,
            &[r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Partial"}]}}]}"#],
        )
        .unwrap_err();
        assert!(matches!(err, CrosstalkError::StreamProtocolViolation(_)));
    }

    #[test]
    fn test_ollama_stream_cut_before_done_is_violation() {
        let err = run(
            Provider::Ollama,
            &[r#"{"model":"llama3","message":{"role":"assistant","content":"Half an"},"done":false}"#],
        )
        .unwrap_err();
        assert!(matches!(err, CrosstalkError::StreamProtocolViolation(_)));
    }

    #[test]
    fn test_gemini_text_after_function_call_opens_new_block() {
        let assembled = run(
            Provider::Gemini,
            &[
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"First I will look."}]}}]}"#,
                r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"id":"fc_1","name":"lookup","args":{"q":"rust"}}}]}}]}"#,
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Then summarize."}]},"finishReason":"STOP"}]}"#,
            ],
        )
        .unwrap();

        assert_eq!(
            assembled.message.content,
            vec![
                ContentBlock::text("First I will look."),
                ContentBlock::ToolCall(ToolCall::new("fc_1", "lookup", json!({"q": "rust"}))),
                ContentBlock::text("Then summarize."),
            ]
        );
    }

    #[test]
    fn test_gemini_each_signed_thought_keeps_its_signature() {
        let assembled = run(
            Provider::Gemini,
            &[
                r#"{"candidates":[{"content":{"parts":[{"text":"step one","thought":true,"thoughtSignature":"sigA"}]}}]}"#,
                r#"{"candidates":[{"content":{"parts":[{"text":"step two","thought":true,"thoughtSignature":"sigB"}]}}]}"#,
                r#"{"candidates":[{"content":{"parts":[{"text":"Done."}]},"finishReason":"STOP"}]}"#,
            ],
        )
        .unwrap();

        assert_eq!(
            assembled.message.content,
            vec![
                ContentBlock::Thinking(Thinking::new("step one", "sigA")),
                ContentBlock::Thinking(Thinking::new("step two", "sigB")),
                ContentBlock::text("Done."),
            ]
        );
    }

    #[test]
    fn test_gemini_stream_keeps_every_part_signature() {
        let assembled = run(
            Provider::Gemini,
            &[
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"id":"c1","name":"lookup","args":{}},"thoughtSignature":"sig-1"}]}}]}"#,
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"id":"c2","name":"lookup","args":{}},"thoughtSignature":"sig-2"}]},"finishReason":"STOP"}]}"#,
            ],
        )
        .unwrap();

        assert_eq!(
            assembled.message.metadata[gemini::THOUGHT_SIGNATURE_KEY],
            json!({"0": "sig-1", "1": "sig-2"})
        );
    }

    #[test]
    fn test_empty_stream_finishes_without_events() {
        for provider in [Provider::OpenAI, Provider::Gemini, Provider::Ollama] {
            assert!(normalizer_for(provider).finish().unwrap().is_empty());
        }
    }
}
