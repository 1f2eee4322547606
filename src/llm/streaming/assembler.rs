//! Incremental reconstruction of a message from canonical stream events.

use super::events::{BlockKind, Delta, StreamEvent};
use crate::error::{CrosstalkError, Result};
use crate::llm::models::{Attachment, ContentBlock, Message, Provider, Thinking, TokenUsage, ToolCall};
use crate::llm::stop_reason::{classify_message, Outcome};
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    AwaitStart,
    Accumulating,
    Complete,
    Failed,
}

impl AssemblerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AssemblerState::Complete | AssemblerState::Failed)
    }
}

/// A fully assembled response.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub message: Message,
    pub usage: TokenUsage,
}

impl Assembled {
    pub fn into_outcome(self) -> Outcome {
        Outcome::from_message(self.message)
    }
}

#[derive(Debug)]
enum BlockBuilder {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        json: String,
    },
    Thinking {
        text: String,
        signature: String,
    },
    RedactedThinking(String),
    Attachment(Attachment),
    Unknown(String),
}

impl BlockBuilder {
    fn open(kind: BlockKind) -> Self {
        match kind {
            BlockKind::Text { text } => BlockBuilder::Text(text),
            BlockKind::ToolCall { id, name } => BlockBuilder::ToolCall {
                id,
                name,
                json: String::new(),
            },
            BlockKind::Thinking { text, signature } => BlockBuilder::Thinking { text, signature },
            BlockKind::RedactedThinking { data } => BlockBuilder::RedactedThinking(data),
            BlockKind::Attachment(attachment) => BlockBuilder::Attachment(attachment),
            BlockKind::Unknown(kind) => BlockBuilder::Unknown(kind),
        }
    }

    fn name(&self) -> &str {
        match self {
            BlockBuilder::Text(_) => "text",
            BlockBuilder::ToolCall { .. } => "tool call",
            BlockBuilder::Thinking { .. } => "thinking",
            BlockBuilder::RedactedThinking(_) => "redacted thinking",
            BlockBuilder::Attachment(_) => "attachment",
            BlockBuilder::Unknown(kind) => kind,
        }
    }

    fn push(&mut self, index: u32, delta: Delta) -> Result<()> {
        match (self, delta) {
            (BlockBuilder::Text(text), Delta::Text(fragment)) => text.push_str(&fragment),
            (BlockBuilder::ToolCall { json, .. }, Delta::InputJson(fragment)) => {
                json.push_str(&fragment)
            }
            (BlockBuilder::Thinking { text, .. }, Delta::Thinking(fragment)) => {
                text.push_str(&fragment)
            }
            (BlockBuilder::Thinking { signature, .. }, Delta::Signature(fragment)) => {
                signature.push_str(&fragment)
            }
            (_, Delta::Other(kind)) => {
                debug!(index = index, delta = %kind, "Ignoring unknown delta");
            }
            (BlockBuilder::Unknown(kind), delta) => {
                debug!(index = index, block = %kind, delta = delta.kind_name(), "Ignoring delta for unknown block");
            }
            (builder, delta) => {
                return Err(CrosstalkError::violation(format!(
                    "{} delta for {} block at index {}",
                    delta.kind_name(),
                    builder.name(),
                    index
                )))
            }
        }
        Ok(())
    }

    fn finish(self, provider: Provider) -> Result<Option<ContentBlock>> {
        let block = match self {
            BlockBuilder::Text(text) => ContentBlock::Text(text),
            BlockBuilder::ToolCall { id, name, json } => {
                let arguments: Value = if json.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&json).map_err(|e| {
                        CrosstalkError::malformed_text(
                            provider,
                            format!("tool call arguments are not valid JSON: {}", e),
                            &json,
                        )
                    })?
                };
                ContentBlock::ToolCall(ToolCall { id, name, arguments })
            }
            BlockBuilder::Thinking { text, signature } => {
                ContentBlock::Thinking(Thinking { text, signature })
            }
            BlockBuilder::RedactedThinking(data) => ContentBlock::RedactedThinking(data),
            BlockBuilder::Attachment(attachment) => ContentBlock::Attachment(attachment),
            BlockBuilder::Unknown(kind) => {
                warn!(block = %kind, "Dropping unknown streamed block");
                return Ok(None);
            }
        };
        Ok(Some(block))
    }
}

#[derive(Debug)]
enum BlockSlot {
    Open(BlockBuilder),
    Closed(Option<ContentBlock>),
}

/// State machine turning an ordered event sequence into one [`Message`].
///
/// Blocks may be open concurrently and are emitted in index order. Any protocol violation, and
/// any upstream error event, moves the assembler to [`AssemblerState::Failed`] and discards
/// everything accumulated so far.
#[derive(Debug)]
pub struct StreamAssembler {
    provider: Provider,
    state: AssemblerState,
    message: Option<Message>,
    blocks: BTreeMap<u32, BlockSlot>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
}

impl StreamAssembler {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            state: AssemblerState::AwaitStart,
            message: None,
            blocks: BTreeMap::new(),
            usage: TokenUsage::default(),
            stop_reason: None,
            stop_sequence: None,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Feed one event. Returns the finished response on message stop.
    ///
    /// Keepalive pings are accepted in every state, including after the message ended.
    pub fn apply(&mut self, event: StreamEvent) -> Result<Option<Assembled>> {
        if matches!(event, StreamEvent::Ping) {
            return Ok(None);
        }
        if self.state.is_terminal() {
            return Err(CrosstalkError::violation(format!(
                "event after stream reached {:?}",
                self.state
            )));
        }

        match self.step(event) {
            Ok(done) => Ok(done),
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    fn step(&mut self, event: StreamEvent) -> Result<Option<Assembled>> {
        match event {
            StreamEvent::Ping => {}
            StreamEvent::Error { kind, message } => {
                warn!(kind = %kind, message = %message, "Upstream error during stream");
                return Err(CrosstalkError::UpstreamError { kind, message });
            }
            StreamEvent::MessageStart { role, usage } => {
                if self.state != AssemblerState::AwaitStart {
                    return Err(CrosstalkError::violation("duplicate message start"));
                }
                self.message = Some(Message::new(role, Vec::new()));
                self.usage = usage;
                self.state = AssemblerState::Accumulating;
            }
            other => {
                if self.state == AssemblerState::AwaitStart {
                    return Err(CrosstalkError::violation(format!(
                        "{} before message start",
                        event_name(&other)
                    )));
                }
                return self.accumulate(other);
            }
        }
        Ok(None)
    }

    fn accumulate(&mut self, event: StreamEvent) -> Result<Option<Assembled>> {
        match event {
            StreamEvent::BlockStart { index, kind } => {
                if self.blocks.contains_key(&index) {
                    return Err(CrosstalkError::violation(format!(
                        "block index {} opened twice",
                        index
                    )));
                }
                self.blocks.insert(index, BlockSlot::Open(BlockBuilder::open(kind)));
            }
            StreamEvent::BlockDelta { index, delta } => match self.blocks.get_mut(&index) {
                Some(BlockSlot::Open(builder)) => builder.push(index, delta)?,
                Some(BlockSlot::Closed(_)) => {
                    return Err(CrosstalkError::violation(format!(
                        "delta for closed block {}",
                        index
                    )))
                }
                None => {
                    return Err(CrosstalkError::violation(format!(
                        "delta for unopened block {}",
                        index
                    )))
                }
            },
            StreamEvent::BlockStop { index } => {
                let builder = match self.blocks.remove(&index) {
                    Some(BlockSlot::Open(builder)) => builder,
                    Some(slot @ BlockSlot::Closed(_)) => {
                        self.blocks.insert(index, slot);
                        return Err(CrosstalkError::violation(format!(
                            "block {} stopped twice",
                            index
                        )));
                    }
                    None => {
                        return Err(CrosstalkError::violation(format!(
                            "stop for unopened block {}",
                            index
                        )))
                    }
                };
                let block = builder.finish(self.provider)?;
                self.blocks.insert(index, BlockSlot::Closed(block));
            }
            StreamEvent::MessageDelta {
                stop_reason,
                stop_sequence,
                usage,
            } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if stop_sequence.is_some() {
                    self.stop_sequence = stop_sequence;
                }
                self.usage.merge(usage);
            }
            StreamEvent::Metadata { key, value } => {
                if let Some(message) = self.message.as_mut() {
                    message.metadata.insert(key, value);
                }
            }
            StreamEvent::MessageStop => return self.complete().map(Some),
            other => {
                return Err(CrosstalkError::violation(format!(
                    "unexpected {} while accumulating",
                    event_name(&other)
                )))
            }
        }
        Ok(None)
    }

    fn complete(&mut self) -> Result<Assembled> {
        if let Some(index) = self
            .blocks
            .iter()
            .find_map(|(index, slot)| matches!(slot, BlockSlot::Open(_)).then_some(*index))
        {
            return Err(CrosstalkError::violation(format!(
                "message stop with block {} still open",
                index
            )));
        }

        let mut message = self
            .message
            .take()
            .ok_or_else(|| CrosstalkError::violation("message stop without a message"))?;
        message.content = std::mem::take(&mut self.blocks)
            .into_values()
            .filter_map(|slot| match slot {
                BlockSlot::Closed(block) => block,
                BlockSlot::Open(_) => None,
            })
            .collect();

        let metrics = self.usage.cache_metrics();
        if metrics.cache_creation_input_tokens > 0 || metrics.cache_read_input_tokens > 0 {
            message.content.push(ContentBlock::Usage(metrics));
        }
        if let Some(reason) = self.stop_reason.as_deref() {
            message.stop_reason = Some(classify_message(self.provider, reason, &message));
        }
        if let Some(sequence) = self.stop_sequence.take() {
            message.metadata.insert("stop_sequence".to_string(), json!(sequence));
        }

        self.state = AssemblerState::Complete;
        debug!(
            provider = %self.provider,
            blocks = message.content.len(),
            stop_reason = ?message.stop_reason,
            "Assembled streamed message"
        );
        Ok(Assembled {
            message,
            usage: self.usage,
        })
    }

    fn fail(&mut self) {
        self.state = AssemblerState::Failed;
        self.message = None;
        self.blocks.clear();
    }
}

fn event_name(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::MessageStart { .. } => "message start",
        StreamEvent::BlockStart { .. } => "block start",
        StreamEvent::BlockDelta { .. } => "block delta",
        StreamEvent::BlockStop { .. } => "block stop",
        StreamEvent::MessageDelta { .. } => "message delta",
        StreamEvent::MessageStop => "message stop",
        StreamEvent::Metadata { .. } => "metadata",
        StreamEvent::Ping => "ping",
        StreamEvent::Error { .. } => "error",
    }
}

/// Receiving side of a cancellation request.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Requests cancellation of every [`CancelSignal`] cloned from its pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pending forever if the handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Drive an event stream to completion.
///
/// Cancellation is checked before every event; a cancelled read returns
/// [`CrosstalkError::Cancelled`] and no partial message. A stream that ends before message
/// stop is a protocol violation.
pub async fn assemble<S>(provider: Provider, events: S, cancel: &CancelSignal) -> Result<Assembled>
where
    S: Stream<Item = Result<StreamEvent>>,
{
    let mut events = std::pin::pin!(events);
    let mut assembler = StreamAssembler::new(provider);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(provider = %provider, "Stream cancelled");
                return Err(CrosstalkError::Cancelled);
            }
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                if let Some(assembled) = assembler.apply(event)? {
                    return Ok(assembled);
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(CrosstalkError::violation(format!(
                    "stream ended in state {:?} before message stop",
                    assembler.state()
                )))
            }
        }
    }
}
