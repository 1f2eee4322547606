//! Append-only conversation history with token accounting.
//!
//! Providers report usage per request, not per message. A response's input count covers the
//! whole conversation sent, so the cost of the most recent message is recovered by subtracting
//! everything already accounted for; the response's output count is the new message's cost.

use crate::llm::models::{ContentBlock, Message, Role, ToolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append without any token computation.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Append a response message and settle token counts from the provider's usage report.
    ///
    /// The previously last message is back-filled with `input_tokens` minus the sum of all
    /// messages before it, and `message` is charged `output_tokens`. When the provider reports
    /// fewer input tokens than already accounted (it truncated server-side), the back-fill is
    /// clamped to zero; earlier counts are never rewritten. Nothing is back-filled on an empty
    /// conversation.
    pub fn append_with_usage(&mut self, mut message: Message, input_tokens: u64, output_tokens: u64) {
        if let Some((last, earlier)) = self.messages.split_last_mut() {
            let accounted: u64 = earlier.iter().map(Message::token_count).sum();
            let backfill = match input_tokens.checked_sub(accounted) {
                Some(backfill) => backfill,
                None => {
                    warn!(
                        input_tokens = input_tokens,
                        accounted = accounted,
                        "Provider reported fewer input tokens than already accounted; clamping to zero"
                    );
                    0
                }
            };
            last.set_token_count(backfill);
        }

        message.set_token_count(output_tokens);
        self.messages.push(message);
        debug!(
            messages = self.messages.len(),
            total_tokens = self.total_tokens(),
            "Recorded usage"
        );
    }

    pub fn total_tokens(&self) -> u64 {
        self.messages.iter().map(Message::token_count).sum()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages that are sent to a provider; system turns stay local.
    pub fn wire_messages(&self) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|message| message.role != Role::System)
            .collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Tool results whose id answers no tool call made earlier in the conversation.
    pub fn unmatched_tool_results(&self) -> Vec<&ToolResult> {
        let mut calls: HashSet<&str> = HashSet::new();
        let mut unmatched = Vec::new();

        for message in &self.messages {
            for call in message.tool_calls() {
                calls.insert(call.id.as_str());
            }
            for block in &message.content {
                if let ContentBlock::ToolResult(result) = block {
                    if !calls.contains(result.id.as_str()) {
                        unmatched.push(result);
                    }
                }
            }
        }
        unmatched
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}
