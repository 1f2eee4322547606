//! Chat session management with token accounting.
//!
//! A session owns a [`Conversation`] and drives one turn at a time: build the request from the
//! history plus the pending message, hand it to the [`Transport`], decode or assemble the reply,
//! and only then record both messages with the provider's usage figures. A turn that fails, is
//! cancelled, or is withheld by the provider leaves the history untouched.

use crate::error::Result;
use crate::llm::adapters::{adapter_for, WireAdapter};
use crate::llm::conversation::Conversation;
use crate::llm::gateway::{RequestOptions, Transport};
use crate::llm::models::{Message, Provider, TokenUsage};
use crate::llm::stop_reason::Outcome;
use crate::llm::streaming::{assemble_raw, CancelSignal};
use crate::llm::tools::{ToolDeclaration, ToolRegistry};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A conversation with one model on one provider.
///
/// # Examples
///
/// ```ignore
/// use crosstalk::llm::{ChatSession, Message, Provider};
/// use std::sync::Arc;
///
/// let mut session = ChatSession::builder(Provider::Anthropic, "claude-opus-4-6", transport)
///     .system_prompt("You are a terse assistant.")
///     .build();
///
/// let outcome = session.send(Message::user("What is Rust?")).await?;
/// if let Some(reply) = outcome.message() {
///     println!("{}", reply.text());
/// }
/// ```
pub struct ChatSession {
    provider: Provider,
    model: String,
    adapter: Box<dyn WireAdapter>,
    transport: Arc<dyn Transport>,
    conversation: Conversation,
    tools: Vec<ToolDeclaration>,
    options: RequestOptions,
}

impl ChatSession {
    pub fn new(provider: Provider, model: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::builder(provider, model, transport).build()
    }

    pub fn builder(
        provider: Provider,
        model: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> ChatSessionBuilder {
        ChatSessionBuilder::new(provider, model.into(), transport)
    }

    /// Send a message and wait for the complete response.
    pub async fn send(&mut self, message: Message) -> Result<Outcome> {
        let body = self.request_body(&message, false)?;
        info!(provider = %self.provider, model = %self.model, "Sending chat turn");

        let bytes = self.transport.send(self.provider, &self.model, body).await?;
        let decoded = self.adapter.decode_response(&bytes)?;

        Ok(self.settle(message, decoded.message, decoded.usage))
    }

    /// Send a message and assemble the streamed response.
    ///
    /// Cancelling `cancel` aborts at the next event with [`CrosstalkError::Cancelled`](crate::error::CrosstalkError::Cancelled).
    pub async fn send_stream(&mut self, message: Message, cancel: &CancelSignal) -> Result<Outcome> {
        let body = self.request_body(&message, true)?;
        info!(provider = %self.provider, model = %self.model, "Streaming chat turn");

        let raw = self.transport.stream(self.provider, &self.model, body);
        let assembled = assemble_raw(self.provider, raw, cancel).await?;

        Ok(self.settle(message, assembled.message, assembled.usage))
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub fn total_tokens(&self) -> u64 {
        self.conversation.total_tokens()
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, pending: &Message, stream: bool) -> Result<Value> {
        let mut messages = self.conversation.messages().to_vec();
        messages.push(pending.clone());
        let options = self.options.clone().with_stream(stream);

        self.adapter
            .build_request(&self.model, &messages, &self.tools, &options)
    }

    /// Record a finished turn unless the provider withheld it.
    fn settle(&mut self, sent: Message, response: Message, usage: TokenUsage) -> Outcome {
        let outcome = Outcome::from_message(response);
        let Some(reply) = outcome.message() else {
            warn!(
                provider = %self.provider,
                stop_reason = ?outcome.stop_reason(),
                "Response withheld; conversation unchanged"
            );
            return outcome;
        };

        self.conversation.append(sent);
        self.conversation
            .append_with_usage(reply.clone(), usage.total_input(), usage.output_tokens);
        debug!(
            input_tokens = usage.total_input(),
            output_tokens = usage.output_tokens,
            total_tokens = self.conversation.total_tokens(),
            "Turn recorded"
        );
        outcome
    }
}

/// Builder for constructing a `ChatSession` with custom configuration.
pub struct ChatSessionBuilder {
    provider: Provider,
    model: String,
    transport: Arc<dyn Transport>,
    system_prompt: String,
    tools: Vec<ToolDeclaration>,
    options: RequestOptions,
    history: Conversation,
}

impl ChatSessionBuilder {
    fn new(provider: Provider, model: String, transport: Arc<dyn Transport>) -> Self {
        Self {
            provider,
            model,
            transport,
            system_prompt: "You are a helpful assistant.".to_string(),
            tools: Vec::new(),
            options: RequestOptions::default(),
            history: Conversation::new(),
        }
    }

    /// Set the system prompt (default: "You are a helpful assistant.")
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Declare the tools the model may call
    pub fn tools(mut self, registry: &dyn ToolRegistry) -> Self {
        self.tools = registry.declarations();
        self
    }

    /// Set the temperature for generation (default: 1.0)
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.options.max_tokens = max_tokens;
        self
    }

    /// Replace all request options. The system prompt set on the builder still wins.
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Resume an earlier conversation.
    pub fn history(mut self, history: Conversation) -> Self {
        self.history = history;
        self
    }

    pub fn build(self) -> ChatSession {
        let mut conversation = self.history;
        if conversation.is_empty() {
            conversation.append(Message::system(self.system_prompt.as_str()));
        }

        ChatSession {
            provider: self.provider,
            model: self.model,
            adapter: adapter_for(self.provider),
            transport: self.transport,
            conversation,
            tools: self.tools,
            options: self.options.with_system_prompt(self.system_prompt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrosstalkError;
    use crate::llm::models::Role;
    use crate::llm::stop_reason::StopReason;
    use crate::llm::streaming::{cancel_pair, RawEvent};
    use futures::stream::{self, Stream};
    use serde_json::json;
    use std::pin::Pin;
    use std::sync::Mutex;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    // Mock transport replaying canned bodies and recording requests
    #[derive(Default)]
    struct MockTransport {
        responses: Mutex<Vec<Result<Vec<u8>>>>,
        streams: Mutex<Vec<Vec<RawEvent>>>,
        requests: Mutex<Vec<Value>>,
    }

    impl MockTransport {
        fn with_responses(bodies: Vec<Value>) -> Arc<Self> {
            let responses = bodies.into_iter().map(|b| Ok(b.to_string().into_bytes())).collect();
            Arc::new(Self {
                responses: Mutex::new(responses),
                ..Default::default()
            })
        }

        fn with_stream(events: Vec<RawEvent>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(vec![events]),
                ..Default::default()
            })
        }

        fn with_error(error: CrosstalkError) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(vec![Err(error)]),
                ..Default::default()
            })
        }

        fn last_request(&self) -> Value {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn send(&self, _provider: Provider, _model: &str, body: Value) -> Result<Vec<u8>> {
            self.requests.lock().unwrap().push(body);
            self.responses.lock().unwrap().remove(0)
        }

        fn stream<'a>(
            &'a self,
            _provider: Provider,
            _model: &'a str,
            body: Value,
        ) -> Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send + 'a>> {
            self.requests.lock().unwrap().push(body);
            let events = self.streams.lock().unwrap().remove(0);
            Box::pin(stream::iter(events.into_iter().map(Ok)))
        }
    }

    fn anthropic_reply(text: &str, stop_reason: &str, input: u64, output: u64) -> Value {
        json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "stop_reason": stop_reason,
            "usage": {"input_tokens": input, "output_tokens": output}
        })
    }

    fn counts(session: &ChatSession) -> Vec<u64> {
        session.messages().iter().map(Message::token_count).collect()
    }

    #[tokio::test]
    async fn test_send_records_turn_with_usage() {
        init_tracing();
        let transport = MockTransport::with_responses(vec![anthropic_reply("Hello!", "end_turn", 10, 5)]);
        let mut session = ChatSession::new(Provider::Anthropic, "claude-opus-4-6", transport);

        let outcome = session.send(Message::user("Hi")).await.unwrap();

        assert!(matches!(outcome, Outcome::Complete(_)));
        assert_eq!(outcome.message().unwrap().text(), "Hello!");
        assert_eq!(session.messages().len(), 3);
        assert_eq!(session.messages()[0].role, Role::System);
        assert_eq!(counts(&session), vec![0, 10, 5]);
        assert_eq!(session.total_tokens(), 15);
    }

    #[tokio::test]
    async fn test_two_turns_accumulate() {
        let transport = MockTransport::with_responses(vec![
            anthropic_reply("Hello!", "end_turn", 10, 5),
            anthropic_reply("Fine.", "end_turn", 25, 10),
        ]);
        let mut session = ChatSession::new(Provider::Anthropic, "claude-opus-4-6", transport);

        session.send(Message::user("Hi")).await.unwrap();
        session.send(Message::user("How are you?")).await.unwrap();

        assert_eq!(counts(&session), vec![0, 10, 5, 10, 10]);
        assert_eq!(session.total_tokens(), 35);
    }

    #[tokio::test]
    async fn test_request_carries_system_prompt_and_pending_message() {
        let transport = MockTransport::with_responses(vec![anthropic_reply("ok", "end_turn", 1, 1)]);
        let mut session = ChatSession::builder(Provider::Anthropic, "claude-opus-4-6", transport.clone())
            .system_prompt("Answer in French.")
            .temperature(0.3)
            .build();

        session.send(Message::user("Hi")).await.unwrap();

        let request = transport.last_request();
        assert_eq!(request["system"], "Answer in French.");
        assert_eq!(request["messages"].as_array().unwrap().len(), 1);
        assert_eq!(request["messages"][0]["content"][0]["text"], "Hi");
        assert!(request.get("stream").is_none());
    }

    #[tokio::test]
    async fn test_refusal_leaves_conversation_unchanged() {
        let transport = MockTransport::with_responses(vec![anthropic_reply("", "refusal", 10, 0)]);
        let mut session = ChatSession::new(Provider::Anthropic, "claude-opus-4-6", transport);

        let outcome = session.send(Message::user("Something forbidden")).await.unwrap();

        assert_eq!(outcome, Outcome::Withheld(StopReason::Blocked));
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.total_tokens(), 0);
    }

    #[tokio::test]
    async fn test_max_tokens_keeps_partial_content() {
        let transport = MockTransport::with_responses(vec![anthropic_reply("Once upon", "max_tokens", 8, 2)]);
        let mut session = ChatSession::new(Provider::Anthropic, "claude-opus-4-6", transport);

        let outcome = session.send(Message::user("Tell me a story")).await.unwrap();

        assert!(outcome.is_partial());
        assert_eq!(session.messages().len(), 3);
        assert_eq!(session.messages()[2].stop_reason, Some(StopReason::MaxTokens));
    }

    #[tokio::test]
    async fn test_transport_error_leaves_conversation_unchanged() {
        let transport = MockTransport::with_error(CrosstalkError::TransportError("timeout".to_string()));
        let mut session = ChatSession::new(Provider::OpenAI, "gpt-4o", transport);

        let err = session.send(Message::user("Hi")).await.unwrap_err();

        assert!(matches!(err, CrosstalkError::TransportError(_)));
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_send_stream_openai() {
        let transport = MockTransport::with_stream(vec![
            RawEvent::data(r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#),
            RawEvent::data(r#"{"choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}"#),
            RawEvent::data(r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":2}}"#),
            RawEvent::data("[DONE]"),
        ]);
        let mut session = ChatSession::new(Provider::OpenAI, "gpt-4o", transport.clone());

        let outcome = session
            .send_stream(Message::user("Say hello"), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome.message().unwrap().text(), "Hello");
        assert_eq!(counts(&session), vec![0, 12, 2]);

        let request = transport.last_request();
        assert_eq!(request["stream"], true);
        assert_eq!(request["messages"][0]["role"], "system");
        assert_eq!(request["messages"][1]["content"], "Say hello");
    }

    #[tokio::test]
    async fn test_cancelled_stream_leaves_conversation_unchanged() {
        let transport = MockTransport::with_stream(vec![RawEvent::data(
            r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#,
        )]);
        let mut session = ChatSession::new(Provider::OpenAI, "gpt-4o", transport);
        let (handle, signal) = cancel_pair();
        handle.cancel();

        let err = session
            .send_stream(Message::user("Say hello"), &signal)
            .await
            .unwrap_err();

        assert!(matches!(err, CrosstalkError::Cancelled));
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_not_recorded() {
        let transport = MockTransport::with_stream(vec![
            RawEvent::data(r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"The answer"}}]}"#),
            RawEvent::data(r#"{"choices":[{"index":0,"delta":{"content":" is"}}]}"#),
        ]);
        let mut session = ChatSession::new(Provider::OpenAI, "gpt-4o", transport);

        let err = session
            .send_stream(Message::user("What is it?"), &CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(err, CrosstalkError::StreamProtocolViolation(_)));
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn test_send_blocking_with_tools() {
        let tools = vec![ToolDeclaration::new("lookup", "Look it up", json!({"type": "object"}))];
        let transport = MockTransport::with_responses(vec![json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"functionCall": {"id": "fc_1", "name": "lookup", "args": {}}}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 3}
        })]);
        let mut session = ChatSession::builder(Provider::Gemini, "gemini-2.5-pro", transport.clone())
            .tools(&tools)
            .build();

        let outcome = tokio_test::block_on(session.send(Message::user("Look up Rust")));
        let outcome = tokio_test::assert_ok!(outcome);

        assert_eq!(outcome.stop_reason(), StopReason::ToolCall);
        assert_eq!(
            transport.last_request()["tools"][0]["function_declarations"][0]["name"],
            "lookup"
        );
        assert_eq!(session.total_tokens(), 12);
    }

    #[test]
    fn test_builder_resumes_history() {
        let history = Conversation::from(vec![Message::system("old prompt"), Message::user("Hi")]);
        let session = ChatSession::builder(Provider::Ollama, "qwen3:32b", Arc::new(MockTransport::default()))
            .history(history)
            .build();

        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.model(), "qwen3:32b");
        assert_eq!(session.provider(), Provider::Ollama);
    }
}
